// benches/reduce_benchmarks.rs — CPU vs GPU reductions.
//
//   cargo bench --bench reduce_benchmarks
//
// CPU benchmarks always run. GPU benchmarks run only when a Vulkan device
// can be created; otherwise they are skipped with a note on stderr.
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time including buffer allocation, bind group
// creation, submit and the 8-byte readback. That is the cost a caller
// actually pays per reduction. Warm-up is set explicitly so that lazy
// pipeline compilation on some drivers does not leak into the samples.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use pitchbuf::gpu::{GpuDevice, GpuReducer};
use pitchbuf::reduce::CpuReducer;
use pitchbuf::{Pixel, Pixel32fC1, Pixel8uC1, PixelBuffer};

// ============================================================
// Shared helpers
// ============================================================

const SIZES: [(usize, usize); 3] = [(320, 240), (752, 480), (1920, 1080)];

fn ramp_f32(w: usize, h: usize) -> PixelBuffer<Pixel32fC1> {
    let mut buf = PixelBuffer::new(w, h).unwrap();
    for y in 0..h {
        for (x, p) in buf.row_mut(y).iter_mut().enumerate() {
            *p = Pixel([((x + y) % 256) as f32 / 255.0]);
        }
    }
    buf
}

fn ramp_u8(w: usize, h: usize) -> PixelBuffer<Pixel8uC1> {
    let mut buf = PixelBuffer::new(w, h).unwrap();
    for y in 0..h {
        for (x, p) in buf.row_mut(y).iter_mut().enumerate() {
            *p = Pixel([((x * 3 + y) % 256) as u8]);
        }
    }
    buf
}

// ============================================================
// CPU reference
// ============================================================

fn bench_cpu(c: &mut Criterion) {
    let reducer = CpuReducer::default();
    let mut group = c.benchmark_group("reduce_cpu");

    for (w, h) in SIZES {
        let f = ramp_f32(w, h);
        let b = ramp_u8(w, h);
        let id = format!("{w}x{h}");
        group.bench_with_input(BenchmarkId::new("sum_f32", &id), &f, |bench, f| {
            bench.iter(|| reducer.sum(f).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("count_equal_u8", &id), &b, |bench, b| {
            bench.iter(|| reducer.count_equal(b, 7).unwrap())
        });
    }
    group.finish();
}

// ============================================================
// GPU engine
// ============================================================

fn bench_gpu(c: &mut Criterion) {
    let gpu = match GpuDevice::new() {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("[reduce_benchmarks] skipping GPU benchmarks: {e}");
            return;
        }
    };
    let f32_reducer = GpuReducer::<f32>::new(&gpu).unwrap();
    let u8_reducer = GpuReducer::<u8>::new(&gpu).unwrap();

    let mut group = c.benchmark_group("reduce_gpu");
    group.warm_up_time(Duration::from_secs(2));

    for (w, h) in SIZES {
        let f = ramp_f32(w, h).to_device(&gpu).unwrap();
        let b = ramp_u8(w, h).to_device(&gpu).unwrap();
        let id = format!("{w}x{h}");
        group.bench_with_input(BenchmarkId::new("sum_f32", &id), &f, |bench, f| {
            bench.iter(|| f32_reducer.sum(f).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("count_equal_u8", &id), &b, |bench, b| {
            bench.iter(|| u8_reducer.count_equal(b, 7).unwrap())
        });
    }

    // Upload cost, for comparison with the reduction itself.
    let host = ramp_f32(752, 480);
    group.bench_function("upload_f32_752x480", |bench| {
        bench.iter(|| host.to_device(&gpu).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_cpu, bench_gpu);
criterion_main!(benches);
