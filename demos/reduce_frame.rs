// demos/reduce_frame.rs — reduce one synthetic camera frame on CPU and GPU.
//
// Builds a 752×480 f32 frame filled with 0.1, marks four cells with 7.0,
// and prints sum and count-equal results from the CPU reference and, when
// a Vulkan device is available, from the GPU engine.
//
// USAGE
// ─────
//   cargo run --example reduce_frame
//   RUST_LOG=debug cargo run --example reduce_frame          # show transfers
//   cargo run --example reduce_frame -- 1280 720 0.25        # custom frame

use std::time::Instant;

use pitchbuf::gpu::{DeviceProfile, GpuDevice, GpuReducer};
use pitchbuf::reduce::CpuReducer;
use pitchbuf::{Pixel, Pixel32fC1, PixelBuffer};

fn main() -> pitchbuf::Result<()> {
    env_logger::init();

    // --- Parse arguments ---
    let args: Vec<String> = std::env::args().collect();
    let width: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(752);
    let height: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(480);
    let value: f32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0.1);
    let rpi = std::env::var("PITCHBUF_RPI").is_ok();

    // --- Build the frame ---
    let mut frame = PixelBuffer::<Pixel32fC1>::new(width, height)?;
    frame.fill(Pixel([value]))?;
    for (x, y) in [(0, 0), (width - 1, 0), (0, height - 1), (width - 1, height - 1)] {
        frame.set(x, y, Pixel([7.0]));
    }
    let expected = (width * height - 4) as f64 * value as f64 + 4.0 * 7.0;
    eprintln!(
        "[reduce_frame] frame {width}×{height}, pitch {} bytes, expected sum {expected}",
        frame.pitch()
    );

    // --- CPU reference ---
    let cpu = CpuReducer::default();
    let t = Instant::now();
    let cpu_sum = cpu.sum(&frame)?;
    let cpu_count = cpu.count_equal(&frame, 7.0)?;
    eprintln!(
        "[reduce_frame] cpu: sum={cpu_sum:.3} count(7.0)={cpu_count} ({:.2?})",
        t.elapsed()
    );

    // --- GPU engine ---
    let profile = if rpi { DeviceProfile::RaspberryPi } else { DeviceProfile::Native };
    let gpu = match GpuDevice::new_with_profile(profile) {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("[reduce_frame] no GPU ({e}); CPU results only");
            return Ok(());
        }
    };
    eprintln!("[reduce_frame] {gpu}");

    let t = Instant::now();
    let device_frame = frame.to_device(&gpu)?;
    let upload = t.elapsed();

    let reducer = GpuReducer::<f32>::new(&gpu)?;
    let t = Instant::now();
    let gpu_sum = reducer.sum(&device_frame)?;
    let gpu_count = reducer.count_equal(&device_frame, 7.0)?;
    eprintln!(
        "[reduce_frame] gpu: sum={gpu_sum:.3} count(7.0)={gpu_count} (upload {upload:.2?}, reduce {:.2?})",
        t.elapsed()
    );
    eprintln!(
        "[reduce_frame] rel. error: cpu {:.2e}, gpu {:.2e}",
        ((cpu_sum - expected) / expected).abs(),
        ((gpu_sum - expected) / expected).abs()
    );
    Ok(())
}
