// gpu/mod.rs — accelerator layer.
//
// This module provides the device side of the crate: device-resident
// `PixelBuffer`s, host↔device transfer, and the wgpu tree reduction. The
// CPU implementations in the parent crate (`reduce`) remain the
// authoritative reference — every GPU result is validated against them.
//
// Architecture:
//
//   host PixelBuffer ──to_device──▶ device PixelBuffer ──GpuReducer──▶ scalar
//          ▲                              │
//          └───────────to_host────────────┘
//
// Device buffers are plain wgpu storage buffers with a 256-byte row pitch.
// The reduction shader reads them as `array<u32>` and extracts elements by
// byte offset, so one shader source serves every element type.

pub mod device;
pub mod memory;
pub mod reduce;
pub mod transfer;

pub use device::{DeviceHandle, DeviceProfile, GpuDevice, WorkgroupSize};
pub use reduce::GpuReducer;

// ---- Test support ----------------------------------------------------------
//
// dzn (Microsoft's D3D12-to-Vulkan layer on WSL2) crashes with SIGSEGV
// during process exit when any Vulkan device has been created in that
// process. GPU tests therefore run in a child process: the inner test is
// `#[ignore]`d, prints "GPU_TEST_OK" when its assertions pass, and the outer
// test only checks for that token, not the child's exit status.

/// Spawn a child `cargo test` running a single ignored test with
/// `--nocapture`. Returns the combined stdout+stderr.
#[cfg(test)]
pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}
