// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize` — the number of invocations per reduction
//     group, validated against the active profile.
//   - Hand out `DeviceHandle`s: cheap clones of the device and queue that
//     device-resident buffers carry around, so a buffer can copy, transfer
//     and be reduced without the caller threading a `&GpuDevice` through.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer anything
// that is not DeviceType::Cpu.
//
// DEVICE LIMITS:
// We request *lower* limits than the hardware actually supports when
// running under a non-Native profile. wgpu validates every dispatch against
// the requested limits, so violations that would crash on RPi are caught at
// dev time on the laptop.
//
// ERROR SCOPES:
// wgpu reports allocation and validation failures asynchronously through
// error scopes instead of return values. `DeviceHandle::scoped` wraps a
// closure in an OutOfMemory + Validation scope pair and turns whatever
// pops out into our `Error`, so nothing is swallowed by wgpu's default
// "log and panic" handler.
//
// The scope stack belongs to the device, not to the calling thread. Every
// handle of one device shares a lock that is held from push to pop, so two
// threads reducing on the same device never pop each other's scopes.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Hardware profile controlling device limits and default workgroup sizes.
///
/// Use `Native` for best performance on your development machine.
/// Use `RaspberryPi` to simulate RPi 4/5 constraints — wgpu will reject
/// any dispatch that exceeds the RPi's actual Vulkan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    /// Caps `max_compute_invocations_per_workgroup` to 256.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Invocations per reduction workgroup.
///
/// Must be a power of two (the in-group tree halves the active count each
/// round) and must not exceed the profile's invocation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub threads: u32,
}

impl WorkgroupSize {
    /// Validate an explicit size against `profile`.
    pub fn new(threads: u32, profile: DeviceProfile) -> Result<Self> {
        if threads == 0 || !threads.is_power_of_two() {
            return Err(Error::InvalidWorkgroupSize(threads));
        }
        let max = max_invocations_for_profile(profile);
        if threads > max {
            return Err(Error::WorkgroupTooLarge { total: threads, max });
        }
        Ok(WorkgroupSize { threads })
    }

    /// Select a validated default workgroup size for the given profile.
    ///
    /// - `Native` (NVIDIA/AMD): 256 invocations — 8 warps / 4 wavefronts,
    ///   enough to hide load latency in the grid-stride loop.
    ///
    /// - `RaspberryPi`: 64 invocations. VideoCore QPUs are SIMD-4 and the
    ///   shared-memory tree on V3DV is cheaper with fewer rounds.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { threads: 256 },
            DeviceProfile::RaspberryPi => WorkgroupSize { threads: 64 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invocations", self.threads)
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

// ============================================================
// DeviceHandle
// ============================================================

/// Shared reference to one wgpu device and its queue.
///
/// Every device-resident buffer holds one. Cloning is two `Arc` bumps.
#[derive(Clone)]
pub struct DeviceHandle {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) profile: DeviceProfile,
    pub(crate) workgroup_size: WorkgroupSize,
    scope_lock: Arc<Mutex<()>>,
}

impl DeviceHandle {
    /// True when both handles refer to the same wgpu device.
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.device, &other.device)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// The workgroup size the owning `GpuDevice` had when this handle was
    /// taken, including any `set_workgroup_size` override.
    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup_size
    }

    /// Serialise error-scope sections on this device. The guard protects no
    /// data, so a poisoned lock is still usable.
    fn lock_scopes(&self) -> MutexGuard<'_, ()> {
        self.scope_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until all submitted work has finished.
    pub(crate) fn wait(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    /// Create a buffer inside an OutOfMemory scope.
    ///
    /// Sizes above the device's `max_buffer_size` are refused up front;
    /// wgpu would otherwise report them as validation errors.
    pub(crate) fn create_buffer(
        &self,
        op: &'static str,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer> {
        let max = self.device.limits().max_buffer_size;
        if size > max {
            return Err(Error::allocation(
                op,
                size,
                format!("exceeds the device's max_buffer_size of {max} bytes"),
            ));
        }
        let _scopes = self.lock_scopes();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::allocation(op, size, err.to_string()));
        }
        log::debug!("{op}: allocated {size} device bytes ({label})");
        Ok(buffer)
    }

    /// Run `f` (which records and submits device work), wait for the queue,
    /// and surface any out-of-memory or validation error as `Execution`.
    ///
    /// `f` must not itself call `scoped` or `create_buffer` on this device.
    pub(crate) fn scoped<R>(&self, op: &'static str, f: impl FnOnce() -> R) -> Result<R> {
        let _scopes = self.lock_scopes();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        self.wait();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match (validation, oom) {
            (None, None) => Ok(out),
            (Some(e), _) | (None, Some(e)) => Err(Error::execution(op, e.to_string())),
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &Arc::as_ptr(&self.device))
            .field("profile", &self.profile)
            .field("workgroup_size", &self.workgroup_size)
            .finish()
    }
}

// ============================================================
// GpuDevice
// ============================================================

/// The core GPU context: adapter, device, queue, and active profile.
///
/// Create via `GpuDevice::new()` or `GpuDevice::new_with_profile()`.
/// Hold one `GpuDevice` for the lifetime of the application — it is
/// expensive to create (Vulkan instance + device initialization) and
/// cheap to clone the `Arc<wgpu::Device>` it wraps.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. dzn (the D3D12-to-Vulkan layer on WSL2) crashes when the
/// Vulkan instance is destroyed while device-level objects still hold
/// back-references to it. Buffers holding a `DeviceHandle` keep the device
/// alive past this struct; wgpu keeps its own instance reference for them.
pub struct GpuDevice {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    scope_lock: Arc<Mutex<()>>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` using the first non-CPU Vulkan adapter found,
    /// with `DeviceProfile::Native` limits.
    ///
    /// # Errors
    /// Returns `Err` if no suitable adapter is found or the device
    /// request fails.
    pub fn new() -> Result<Self> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a `GpuDevice` with an explicit hardware profile.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self> {
        // Vulkan only. ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn on
        // WSL2 through; we run compute-only kernels, which dzn supports.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   1. DiscreteGpu / IntegratedGpu / VirtualGpu / Other (dzn).
        //   2. Last resort: anything, including Cpu (llvmpipe).
        let all_adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(wgpu::Backends::VULKAN);

        if all_adapters.is_empty() {
            return Err(Error::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            log::info!("Vulkan adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| {
                log::warn!("no hardware adapter found, falling back to a software renderer");
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(Error::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // Auto-detect RPi when the caller passed Native but the adapter is V3D.
        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                log::info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let limits = limits_for_profile(profile);

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("pitchbuf"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        log::info!("selected {adapter_info}, profile {profile}, workgroup {workgroup_size}");

        Ok(GpuDevice {
            device: Arc::new(device),
            queue: Arc::new(queue),
            profile,
            adapter_info,
            workgroup_size,
            scope_lock: Arc::new(Mutex::new(())),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the active profile.
    pub fn set_workgroup_size(&mut self, threads: u32) -> Result<()> {
        self.workgroup_size = WorkgroupSize::new(threads, self.profile)?;
        Ok(())
    }

    /// A handle device buffers can hold on to.
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            profile: self.profile,
            workgroup_size: self.workgroup_size,
            scope_lock: Arc::clone(&self.scope_lock),
        }
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB: RPi 4 shares 4 GiB with the CPU.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

/// Maximum compute invocations per workgroup for the given profile.
fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default().max_compute_invocations_per_workgroup,
        DeviceProfile::RaspberryPi => 256,
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::run_gpu_test_in_subprocess;

    #[test]
    fn test_workgroup_size_for_native() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::Native);
        assert_eq!(ws.threads, 256);
        assert!(ws.threads.is_power_of_two());
    }

    #[test]
    fn test_workgroup_size_for_rpi() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(ws.threads, 64);
        assert!(ws.threads <= 256);
    }

    #[test]
    fn test_workgroup_size_validation() {
        assert_eq!(
            WorkgroupSize::new(128, DeviceProfile::RaspberryPi).unwrap(),
            WorkgroupSize { threads: 128 }
        );
        assert!(matches!(
            WorkgroupSize::new(512, DeviceProfile::RaspberryPi),
            Err(Error::WorkgroupTooLarge { total: 512, max: 256 })
        ));
        assert!(matches!(
            WorkgroupSize::new(96, DeviceProfile::Native),
            Err(Error::InvalidWorkgroupSize(96))
        ));
        assert!(matches!(
            WorkgroupSize::new(0, DeviceProfile::Native),
            Err(Error::InvalidWorkgroupSize(0))
        ));
    }

    #[test]
    fn test_rpi_limits_cap_invocations() {
        let limits = limits_for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_storage_buffer_binding_size, 128 << 20);
    }

    #[test]
    fn test_rpi_limits_leave_textures_at_default() {
        let limits = limits_for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(limits.max_texture_dimension_2d, wgpu::Limits::default().max_texture_dimension_2d);
    }

    #[test]
    fn test_native_limits_are_default() {
        let limits = limits_for_profile(DeviceProfile::Native);
        assert_eq!(limits, wgpu::Limits::default());
    }

    // ---- Inner tests (run inside the subprocess, marked #[ignore]) ----------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_native() {
        let gpu = GpuDevice::new().expect("should initialise a Vulkan device");
        println!("{gpu}");
        assert!(gpu.handle().same_device(&gpu.handle()));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_set_workgroup_size_rpi() {
        let mut gpu = GpuDevice::new_with_profile(DeviceProfile::RaspberryPi).unwrap();
        assert_eq!(gpu.workgroup_size, WorkgroupSize { threads: 64 });
        gpu.set_workgroup_size(256).expect("256 should be valid on RPi profile");
        assert_eq!(gpu.handle().workgroup_size(), WorkgroupSize { threads: 256 });
        let err = gpu.set_workgroup_size(512).unwrap_err();
        assert!(matches!(err, Error::WorkgroupTooLarge { total: 512, max: 256 }));
        println!("GPU_TEST_OK");
    }

    // ---- Outer tests (each spawns one subprocess) ---------------------------

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_device_init_native() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_native");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_set_workgroup_size_rpi() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_set_workgroup_size_rpi");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
