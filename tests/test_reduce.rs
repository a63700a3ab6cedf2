// tests/test_reduce.rs — Integration tests for the CPU reduction reference.
//
// The GPU engine is validated against these same results in
// src/gpu/reduce.rs (run with `cargo test -- --ignored` on a machine with
// a Vulkan GPU).

use pitchbuf::reduce::{self, CpuReducer, ReductionPlan};
use pitchbuf::{
    Pixel, Pixel16uC1, Pixel32fC1, Pixel32sC1, Pixel32uC1, Pixel8uC1, PixelBuffer, ReduceOp,
    ReductionResult,
};

/// Calibrated relative tolerance for f32 sums. Measured, not derived.
const FLOAT_SUM_TOLERANCE: f64 = 0.015;

fn rel_err(got: f64, expected: f64) -> f64 {
    ((got - expected) / expected).abs()
}

// ===== Sum =====

#[test_log::test]
fn sum_constant_frame_752x480() {
    let mut buf = PixelBuffer::<Pixel32fC1>::new(752, 480).unwrap();
    buf.fill(Pixel([0.1])).unwrap();
    let got = reduce::sum(&buf).unwrap();
    let expected = 752.0 * 480.0 * 0.1;
    assert!(rel_err(got, expected) < 0.01, "sum {got} vs {expected}");
    assert!(rel_err(got, 36096.0) < FLOAT_SUM_TOLERANCE);
}

#[test_log::test]
fn sum_uniform_integer_frames_are_exact() {
    for &(w, h) in &[(1usize, 1usize), (7, 3), (64, 64), (752, 480), (1023, 17)] {
        let mut u8s = PixelBuffer::<Pixel8uC1>::new(w, h).unwrap();
        u8s.fill(Pixel([200])).unwrap();
        assert_eq!(reduce::sum(&u8s).unwrap(), (w * h * 200) as u64, "u8 {w}×{h}");

        let mut u16s = PixelBuffer::<Pixel16uC1>::new(w, h).unwrap();
        u16s.fill(Pixel([u16::MAX])).unwrap();
        assert_eq!(reduce::sum(&u16s).unwrap(), (w * h) as u64 * u16::MAX as u64, "u16 {w}×{h}");

        let mut i32s = PixelBuffer::<Pixel32sC1>::new(w, h).unwrap();
        i32s.fill(Pixel([-7])).unwrap();
        assert_eq!(reduce::sum(&i32s).unwrap(), -7 * (w * h) as i64, "i32 {w}×{h}");
    }
}

#[test_log::test]
fn sum_ignores_row_padding() {
    // Wrap caller memory whose padding holds garbage.
    let (w, h, pitch) = (3usize, 4usize, 8usize);
    let mut backing = vec![0xFFu8; pitch * h];
    for y in 0..h {
        for x in 0..w {
            backing[y * pitch + x] = 1;
        }
    }
    let buf = unsafe {
        PixelBuffer::<Pixel8uC1>::wrap_external(
            backing.as_mut_ptr().cast(),
            w,
            h,
            pitch,
            pitchbuf::WrapMode::Borrow,
        )
    }
    .unwrap();
    assert_eq!(reduce::sum(&buf).unwrap(), 12);
}

#[test_log::test]
fn float_sum_of_ramp_within_tolerance() {
    let (w, h) = (640usize, 480usize);
    let data: Vec<Pixel32fC1> = (0..w * h).map(|i| Pixel([(i % 1000) as f32 * 0.001])).collect();
    let buf = PixelBuffer::from_vec(w, h, data).unwrap();
    let exact: f64 = (0..w * h).map(|i| ((i % 1000) as f32 * 0.001) as f64).sum();
    let got = reduce::sum(&buf).unwrap();
    assert!(rel_err(got, exact) < FLOAT_SUM_TOLERANCE, "{got} vs {exact}");
}

// ===== CountEqual =====

#[test_log::test]
fn count_equal_with_k_matches() {
    for k in [0usize, 1, 4] {
        let mut buf = PixelBuffer::<Pixel32uC1>::new(100, 60).unwrap();
        buf.fill(Pixel([3])).unwrap();
        for j in 0..k {
            buf.set(j * 17, j * 11, Pixel([99]));
        }
        assert_eq!(reduce::count_equal(&buf, 99).unwrap(), k as u64, "k = {k}");
        assert_eq!(reduce::count_equal(&buf, 3).unwrap(), (6000 - k) as u64);
    }
}

#[test_log::test]
fn count_equal_four_cells_of_seven() {
    // 752×480 frame at 0.1 with four cells set to the probe value.
    let mut buf = PixelBuffer::<Pixel32fC1>::new(752, 480).unwrap();
    buf.fill(Pixel([0.1])).unwrap();
    for (x, y) in [(10, 10), (700, 20), (35, 450), (751, 479)] {
        buf.set(x, y, Pixel([7.0]));
    }
    assert_eq!(reduce::count_equal(&buf, 7.0).unwrap(), 4);
    assert_eq!(reduce::count_equal(&buf, 7.000001).unwrap(), 0);
}

#[test_log::test]
fn count_equal_four_integer_cells_of_seven() {
    let mut buf = PixelBuffer::<Pixel32sC1>::new(752, 480).unwrap();
    for (x, y) in [(0, 0), (376, 240), (751, 0), (100, 479)] {
        buf.set(x, y, Pixel([7]));
    }
    assert_eq!(reduce::count_equal(&buf, 7).unwrap(), 4);
    assert_eq!(reduce::count_equal(&buf, 0).unwrap(), 752 * 480 - 4);
    assert_eq!(reduce::sum(&buf).unwrap(), 28);
}

#[test_log::test]
fn count_equal_nan_never_matches() {
    let mut buf = PixelBuffer::<Pixel32fC1>::new(8, 8).unwrap();
    buf.fill(Pixel([f32::NAN])).unwrap();
    assert_eq!(reduce::count_equal(&buf, f32::NAN).unwrap(), 0);
}

// ===== Engine configuration =====

#[test_log::test]
fn group_size_is_configurable() {
    let mut buf = PixelBuffer::<Pixel8uC1>::new(300, 200).unwrap();
    buf.fill(Pixel([1])).unwrap();
    for gs in [1, 32, 64, 256, 512] {
        let r = CpuReducer::new(gs).unwrap();
        assert_eq!(r.sum(&buf).unwrap(), 60_000, "group size {gs}");
        assert_eq!(
            r.reduce(&buf, ReduceOp::CountEqual(1)).unwrap(),
            ReductionResult::Count(60_000)
        );
    }
}

#[test_log::test]
fn large_frames_cap_group_count() {
    let plan = ReductionPlan::new(4096 * 4096, 256).unwrap();
    assert_eq!(plan.groups, ReductionPlan::MAX_GROUPS);
    let plan = ReductionPlan::new(100, 256).unwrap();
    assert_eq!(plan.groups, 1);
}

#[test_log::test]
fn plan_rejects_zero_group_size() {
    let err = ReductionPlan::new(10, 0).unwrap_err();
    assert!(matches!(err, pitchbuf::Error::InvalidWorkgroupSize(0)), "{err}");
}

// ===== Concurrency =====

#[test_log::test]
fn concurrent_reductions_share_one_reducer() {
    let reducer = CpuReducer::new(64).unwrap();
    let mut shared = PixelBuffer::<Pixel32sC1>::new(320, 240).unwrap();
    shared.fill(Pixel([-3])).unwrap();
    let own: Vec<PixelBuffer<Pixel16uC1>> = (1..=4u16)
        .map(|v| {
            let mut b = PixelBuffer::new(100 + v as usize, 50).unwrap();
            b.fill(Pixel([v])).unwrap();
            b
        })
        .collect();

    std::thread::scope(|scope| {
        for (i, buf) in own.iter().enumerate() {
            let (reducer, shared) = (&reducer, &shared);
            scope.spawn(move || {
                let v = i as u64 + 1;
                for _ in 0..16 {
                    assert_eq!(reducer.sum(shared).unwrap(), -3 * 320 * 240);
                    assert_eq!(reducer.sum(buf).unwrap(), (100 + v) * 50 * v);
                    assert_eq!(reducer.count_equal(buf, v as u16).unwrap(), (100 + v) * 50);
                }
            });
        }
    });
}
