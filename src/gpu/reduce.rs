// gpu/reduce.rs — two-stage tree reduction on wgpu.
//
// Runs the same `ReductionPlan` as the CPU reference in reduce.rs:
//
//   pass 1  reduce_groups    plan.groups workgroups × WG_SIZE invocations
//                            grid-stride over the image → partials[groups]
//   pass 2  reduce_partials  1 workgroup × WG_SIZE invocations
//                            partials → result[0]
//
// Both passes are recorded into one command buffer; the queue orders them.
// Only the 8-byte result is read back.
//
// One shader template covers every element type. The Rust side fills in
// the element width, mask, signedness and the operator as WGSL constants,
// so each (element type, operator) pair gets its own specialised module.
// naga does not support override constants in @workgroup_size, which is why
// this is textual substitution rather than pipeline overrides.
//
// Bind group layout (shared by both pipelines):
//   0  src       storage, read        — the pixel buffer, as array<u32>
//   1  partials  storage, read_write  — vec2<u32> per group
//   2  result    storage, read_write  — vec2<u32>
//   3  params    uniform              — ReduceParams
//
// A `GpuReducer` holds only immutable pipelines and can be shared across
// threads. Every call allocates its own partials/result/params buffers.

use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::error::{Error, Result};
use crate::gpu::device::{DeviceHandle, GpuDevice, WorkgroupSize};
use crate::gpu::memory::read_buffer;
use crate::image::PixelBuffer;
use crate::pixel::{Accumulator, Element, ElementKind, Pixel};
use crate::reduce::{ReduceOp, ReductionPlan, ReductionResult};

/// Uniform block; must match `Params` in reduce.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ReduceParams {
    width:      u32,
    height:     u32,
    pitch:      u32,
    probe:      u32,
    n_partials: u32,
    _pad:       [u32; 3],
}

/// Bytes per accumulator slot (vec2<u32>).
const ACC_BYTES: u64 = 8;

/// WGSL source for one element kind and operator.
///
/// Exposed so tests and tooling can validate the generated shader without
/// a device.
pub fn shader_source(kind: ElementKind, count: bool, workgroup_size: WorkgroupSize) -> String {
    let acc_float = kind.is_float() && !count;
    include_str!("../shaders/reduce.wgsl")
        .replace("{{WG_SIZE}}",     &workgroup_size.threads.to_string())
        .replace("{{ELEM_BYTES}}",  &kind.size().to_string())
        .replace("{{ELEM_BITS}}",   &kind.bits().to_string())
        .replace("{{ELEM_MASK}}",   &format!("0x{:X}", kind.mask()))
        .replace("{{ELEM_SIGNED}}", &kind.is_signed().to_string())
        .replace("{{ELEM_FLOAT}}",  &kind.is_float().to_string())
        .replace("{{OP_COUNT}}",    &count.to_string())
        .replace("{{ACC_FLOAT}}",   &acc_float.to_string())
}

/// The two pipelines of one operator.
struct Stages {
    groups:   wgpu::ComputePipeline,
    partials: wgpu::ComputePipeline,
}

/// GPU reduction engine for single-channel buffers of element type `T`.
///
/// Create once per device and element type; reuse across frames.
pub struct GpuReducer<T: Element> {
    handle:         DeviceHandle,
    bgl:            wgpu::BindGroupLayout,
    sum:            Stages,
    count:          Stages,
    workgroup_size: WorkgroupSize,
    _elem:          PhantomData<fn() -> T>,
}

impl<T: Element> GpuReducer<T> {
    /// Build a reducer using `gpu`'s configured workgroup size.
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        Self::with_handle(&gpu.handle(), gpu.workgroup_size)
    }

    /// Build a reducer for the device behind `handle`.
    ///
    /// # Errors
    /// `WorkgroupTooLarge` if the device cannot run `workgroup_size`
    /// invocations per group; `Execution` if shader or pipeline creation
    /// fails validation.
    pub fn with_handle(handle: &DeviceHandle, workgroup_size: WorkgroupSize) -> Result<Self> {
        const OP: &str = "GpuReducer::new";
        let limits = handle.device.limits();
        let max = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        if workgroup_size.threads > max {
            return Err(Error::WorkgroupTooLarge { total: workgroup_size.threads, max });
        }

        let device = &handle.device;
        let (bgl, sum, count) = handle.scoped(OP, || {
            let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuReducer BGL"),
                entries: &[
                    // 0 — source pixels
                    storage_entry(0, true),
                    // 1 — per-group partials
                    storage_entry(1, false),
                    // 2 — final result
                    storage_entry(2, false),
                    // 3 — params uniform
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuReducer pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
            let sum = build_stages(device, &layout, T::KIND, false, workgroup_size);
            let count = build_stages(device, &layout, T::KIND, true, workgroup_size);
            (bgl, sum, count)
        })?;

        log::debug!("{OP}: compiled {} reducer, {workgroup_size}", T::KIND);
        Ok(GpuReducer {
            handle: handle.clone(),
            bgl,
            sum,
            count,
            workgroup_size,
            _elem: PhantomData,
        })
    }

    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup_size
    }

    /// Sum of every element of a device buffer, in `T`'s accumulator type.
    ///
    /// Integer sums are exact. f32 sums are carried as double-single pairs
    /// and are accurate to a small relative tolerance; a sum that reaches
    /// ±inf or NaN comes back as that value, like the CPU reference.
    pub fn sum(&self, buf: &PixelBuffer<Pixel<T, 1>>) -> Result<T::Sum> {
        let words = self.run("gpu::reduce::sum", buf, &self.sum, 0)?;
        Ok(<T::Sum as Accumulator>::from_device_words(words))
    }

    /// Number of elements of a device buffer exactly equal to `probe`.
    pub fn count_equal(&self, buf: &PixelBuffer<Pixel<T, 1>>, probe: T) -> Result<u64> {
        let words = self.run("gpu::reduce::count_equal", buf, &self.count, probe.to_bits())?;
        Ok(<u64 as Accumulator>::from_device_words(words))
    }

    pub fn reduce(
        &self,
        buf: &PixelBuffer<Pixel<T, 1>>,
        op: ReduceOp<T>,
    ) -> Result<ReductionResult<T::Sum>> {
        match op {
            ReduceOp::Sum => self.sum(buf).map(ReductionResult::Sum),
            ReduceOp::CountEqual(probe) => self.count_equal(buf, probe).map(ReductionResult::Count),
        }
    }

    fn run(
        &self,
        op: &'static str,
        buf: &PixelBuffer<Pixel<T, 1>>,
        stages: &Stages,
        probe: u32,
    ) -> Result<[u32; 2]> {
        let (src, src_handle) = match (buf.device_buffer(), buf.device_handle()) {
            (Some(b), Some(h)) => (b, h),
            _ => {
                return Err(Error::precondition(
                    op,
                    "buffer is host-resident; transfer it with to_device first",
                ))
            }
        };
        if !self.handle.same_device(src_handle) {
            return Err(Error::precondition(op, "buffer lives on a different device than the reducer"));
        }
        if !src.usage().contains(wgpu::BufferUsages::STORAGE) {
            return Err(Error::precondition(op, "device buffer lacks STORAGE usage"));
        }
        let max_binding = self.handle.device.limits().max_storage_buffer_binding_size as u64;
        if src.size() > max_binding {
            return Err(Error::precondition(
                op,
                format!("buffer of {} bytes exceeds the storage binding limit of {max_binding}", src.size()),
            ));
        }
        if src.size() % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::precondition(op, "device buffer size is not a multiple of 4"));
        }

        let to_u32 = |v: usize, what: &str| {
            u32::try_from(v).map_err(|_| Error::precondition(op, format!("{what} {v} does not fit in u32")))
        };
        let width = to_u32(buf.width(), "width")?;
        let height = to_u32(buf.height(), "height")?;
        let pitch = to_u32(buf.pitch(), "pitch")?;
        let elements = width
            .checked_mul(height)
            .ok_or_else(|| Error::precondition(op, "element count does not fit in u32"))?;

        let plan = ReductionPlan::new(elements as usize, self.workgroup_size.threads as usize)?;
        let groups = plan.groups as u32;

        let partials = self.handle.create_buffer(
            op,
            "GpuReducer partials",
            groups as u64 * ACC_BYTES,
            wgpu::BufferUsages::STORAGE,
        )?;
        let result = self.handle.create_buffer(
            op,
            "GpuReducer result",
            ACC_BYTES,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;

        let params = ReduceParams {
            width,
            height,
            pitch,
            probe,
            n_partials: groups,
            _pad: [0; 3],
        };
        debug_assert_eq!(size_of::<ReduceParams>(), 32);

        let device = &self.handle.device;
        self.handle.scoped(op, || {
            let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label:    Some("GpuReducer params"),
                contents: bytemuck::bytes_of(&params),
                usage:    wgpu::BufferUsages::UNIFORM,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label:  Some("GpuReducer BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: src.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: partials.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: result.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
                ],
            });

            let mut encoder = device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("GpuReducer dispatch") },
            );
            {
                let mut pass = encoder.begin_compute_pass(
                    &wgpu::ComputePassDescriptor { label: Some("reduce_groups"), timestamp_writes: None },
                );
                pass.set_pipeline(&stages.groups);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(
                    &wgpu::ComputePassDescriptor { label: Some("reduce_partials"), timestamp_writes: None },
                );
                pass.set_pipeline(&stages.partials);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            self.handle.queue.submit(std::iter::once(encoder.finish()));
        })?;

        let bytes = read_buffer(&self.handle, op, &result, 0, ACC_BYTES)?;
        let words: [u32; 2] = bytemuck::pod_read_unaligned(&bytes);
        log::debug!(
            "{op}: {width}×{height} {} in {groups} groups of {} → {words:08x?}",
            T::KIND,
            self.workgroup_size.threads
        );
        Ok(words)
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn build_stages(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    kind: ElementKind,
    count: bool,
    workgroup_size: WorkgroupSize,
) -> Stages {
    let label = if count { "reduce.wgsl (count_equal)" } else { "reduce.wgsl (sum)" };
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label:  Some(label),
        source: wgpu::ShaderSource::Wgsl(shader_source(kind, count, workgroup_size).into()),
    });
    let pipeline = |entry_point: &'static str| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label:               Some(entry_point),
            layout:              Some(layout),
            module:              &shader,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache:               None,
        })
    };
    Stages { groups: pipeline("reduce_groups"), partials: pipeline("reduce_partials") }
}

// ---------------------------------------------------------------------------
// One-shot helpers
// ---------------------------------------------------------------------------

fn one_shot<T: Element>(op: &'static str, buf: &PixelBuffer<Pixel<T, 1>>) -> Result<GpuReducer<T>> {
    let handle = buf.device_handle().ok_or_else(|| {
        Error::precondition(op, "buffer is host-resident; transfer it with to_device first")
    })?;
    GpuReducer::with_handle(handle, handle.workgroup_size())
}

/// Sum a device buffer with a reducer built for this call.
///
/// The reducer uses the workgroup size the buffer's `GpuDevice` was
/// configured with when the buffer was allocated or wrapped.
pub fn sum<T: Element>(buf: &PixelBuffer<Pixel<T, 1>>) -> Result<T::Sum> {
    one_shot("gpu::reduce::sum", buf)?.sum(buf)
}

/// Count elements equal to `probe` with a reducer built for this call.
pub fn count_equal<T: Element>(buf: &PixelBuffer<Pixel<T, 1>>, probe: T) -> Result<u64> {
    one_shot("gpu::reduce::count_equal", buf)?.count_equal(buf, probe)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
