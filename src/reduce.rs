// reduce.rs — two-stage tree reduction, CPU reference.
//
// Algorithm (shared with gpu/reduce.rs, which runs the same plan on wgpu):
//
//   Stage 1 — `groups` groups of `group_size` lanes each.
//     Lane l of group g visits elements
//         i = g * group_size + l,  i + stride,  i + 2 * stride, ...
//     where stride = groups * group_size (grid-stride loop), folding each
//     into a private accumulator. The group then folds its lanes pairwise:
//
//         lanes:  a0 a1 a2 a3 a4 a5 a6 a7
//         half 4: a0+a4  a1+a5  a2+a6  a3+a7
//         half 2: (a0+a4)+(a2+a6)  (a1+a5)+(a3+a7)
//         half 1: total
//
//     and writes one partial per group.
//
//   Stage 2 — one group of `group_size` lanes grid-strides over the
//     partials and folds them the same way into the final scalar.
//
// Elements are addressed in row-major order of the *logical* image
// (i = y * width + x). Padding is never visited.
//
// Sums accumulate in `Element::Sum` (u64 / i64 / f64). Counts accumulate
// in u64. Integer results are exact. Float results depend on the fold order
// and are only equal to the mathematical sum within a relative tolerance.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::image::PixelBuffer;
use crate::pixel::{Element, Pixel};

/// Operator applied by a reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceOp<T> {
    /// Sum of all elements, in the element's wide accumulator type.
    Sum,
    /// Number of elements exactly equal to the probe value.
    CountEqual(T),
}

impl<T> ReduceOp<T> {
    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::CountEqual(_) => "count_equal",
        }
    }
}

/// Scalar produced by a reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReductionResult<S> {
    Sum(S),
    Count(u64),
}

// ---------------------------------------------------------------------------
// ReductionPlan
// ---------------------------------------------------------------------------

/// Grid geometry of a reduction over `elements` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionPlan {
    pub elements: usize,
    /// Lanes per group. Power of two.
    pub group_size: usize,
    /// Number of stage-1 groups, in `1..=MAX_GROUPS`.
    pub groups: usize,
}

impl ReductionPlan {
    /// Upper bound on stage-1 groups (and therefore on the partials
    /// buffer). Larger inputs make each lane loop more.
    pub const MAX_GROUPS: usize = 1024;

    /// # Errors
    /// `InvalidWorkgroupSize` unless `group_size` is a non-zero power of two.
    pub fn new(elements: usize, group_size: usize) -> Result<Self> {
        check_group_size(group_size)?;
        let groups = elements.div_ceil(group_size).clamp(1, Self::MAX_GROUPS);
        Ok(ReductionPlan { elements, group_size, groups })
    }

    /// Distance between consecutive elements visited by one lane.
    #[inline]
    pub fn stride(&self) -> usize {
        self.groups * self.group_size
    }
}

fn check_group_size(group_size: usize) -> Result<()> {
    if group_size == 0 || !group_size.is_power_of_two() {
        return Err(Error::InvalidWorkgroupSize(u32::try_from(group_size).unwrap_or(u32::MAX)));
    }
    Ok(())
}

/// Pairwise in-place fold of `lanes`.
///
/// Mirrors the shared-memory tree in the shader: each round folds the
/// upper half onto the lower half. An odd round leaves its middle lane
/// untouched for the next one. Empty input folds to `A::default()`.
pub(crate) fn tree_fold<A: Copy + Default>(lanes: &mut [A], combine: impl Fn(A, A) -> A) -> A {
    let mut len = lanes.len();
    while len > 1 {
        let half = len.div_ceil(2);
        for i in 0..len - half {
            lanes[i] = combine(lanes[i], lanes[i + half]);
        }
        len = half;
    }
    lanes.first().copied().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// CpuReducer
// ---------------------------------------------------------------------------

/// Host-side reduction engine. Groups run in parallel on the rayon pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuReducer {
    group_size: usize,
}

impl Default for CpuReducer {
    fn default() -> Self {
        CpuReducer { group_size: 256 }
    }
}

impl CpuReducer {
    /// `group_size` must be a non-zero power of two.
    pub fn new(group_size: usize) -> Result<Self> {
        check_group_size(group_size)?;
        Ok(CpuReducer { group_size })
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Sum of every element of a host buffer.
    pub fn sum<T: Element>(&self, buf: &PixelBuffer<Pixel<T, 1>>) -> Result<T::Sum> {
        self.run("reduce::sum", buf, |v: T| v.widen(), |a, b| a + b)
    }

    /// Number of elements of a host buffer equal to `probe`.
    pub fn count_equal<T: Element>(&self, buf: &PixelBuffer<Pixel<T, 1>>, probe: T) -> Result<u64> {
        self.run("reduce::count_equal", buf, move |v: T| u64::from(v == probe), |a, b| a + b)
    }

    pub fn reduce<T: Element>(
        &self,
        buf: &PixelBuffer<Pixel<T, 1>>,
        op: ReduceOp<T>,
    ) -> Result<ReductionResult<T::Sum>> {
        match op {
            ReduceOp::Sum => self.sum(buf).map(ReductionResult::Sum),
            ReduceOp::CountEqual(probe) => self.count_equal(buf, probe).map(ReductionResult::Count),
        }
    }

    fn run<T, A>(
        &self,
        op: &'static str,
        buf: &PixelBuffer<Pixel<T, 1>>,
        lift: impl Fn(T) -> A + Sync,
        combine: impl Fn(A, A) -> A + Sync,
    ) -> Result<A>
    where
        T: Element,
        A: Copy + Default + Send + Sync,
    {
        if !buf.is_host() {
            return Err(Error::precondition(
                op,
                "CPU reduction needs a host buffer; use gpu::reduce for device buffers",
            ));
        }
        let width = buf.width();
        let plan = ReductionPlan::new(width * buf.height(), self.group_size)?;
        let stride = plan.stride();
        let gs = plan.group_size;
        let at = |i: usize| buf.row(i / width)[i % width].0[0];

        // Stage 1
        let partials: Vec<A> = (0..plan.groups)
            .into_par_iter()
            .map(|g| {
                let mut lanes = vec![A::default(); gs];
                for (l, lane) in lanes.iter_mut().enumerate() {
                    let mut acc = A::default();
                    let mut i = g * gs + l;
                    while i < plan.elements {
                        acc = combine(acc, lift(at(i)));
                        i += stride;
                    }
                    *lane = acc;
                }
                tree_fold(&mut lanes, &combine)
            })
            .collect();

        // Stage 2
        let mut lanes = vec![A::default(); gs];
        for (l, lane) in lanes.iter_mut().enumerate() {
            let mut acc = A::default();
            let mut i = l;
            while i < partials.len() {
                acc = combine(acc, partials[i]);
                i += gs;
            }
            *lane = acc;
        }
        let total = tree_fold(&mut lanes, &combine);
        log::debug!(
            "{op}: {}×{} in {} groups of {gs}",
            width,
            buf.height(),
            plan.groups
        );
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// One-shot helpers
// ---------------------------------------------------------------------------

/// Sum of a host buffer with the default group size.
pub fn sum<T: Element>(buf: &PixelBuffer<Pixel<T, 1>>) -> Result<T::Sum> {
    CpuReducer::default().sum(buf)
}

/// Count of elements equal to `probe` in a host buffer.
pub fn count_equal<T: Element>(buf: &PixelBuffer<Pixel<T, 1>>, probe: T) -> Result<u64> {
    CpuReducer::default().count_equal(buf, probe)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
