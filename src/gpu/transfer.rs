// gpu/transfer.rs — moving pixels between host and device.
//
// All four directions of `PixelBuffer::copy_from` land here except
// host→host. Each one picks between a single contiguous block and a
// row-by-row copy:
//
//   src pitch == dst pitch  → one block of pitch * height bytes
//   otherwise               → height rows of row_bytes each
//
// Host→device goes through `Queue::write_buffer` (wgpu stages it
// internally). Device→host goes through a MAP_READ staging buffer
// (`read_buffer`). Device→device records `copy_buffer_to_buffer` commands.
//
// wgpu requires copy sizes and offsets to be multiples of 4. Device pitches
// are multiples of 4 (256 for our own allocations, checked at wrap time for
// caller buffers), so every row offset is aligned; row lengths are rounded
// up to 4, which stays inside the row's padding.

use crate::error::{Error, Result};
use crate::gpu::device::GpuDevice;
use crate::gpu::memory::{read_buffer, DeviceMemory};
use crate::image::PixelBuffer;
use crate::memory::{align_to, HostMemory};
use crate::pixel::PixelType;

/// Geometry shared by both sides of a copy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopyLayout {
    pub dst_pitch: usize,
    pub src_pitch: usize,
    pub row_bytes: usize,
    pub height: usize,
}

impl CopyLayout {
    fn contiguous(&self) -> bool {
        self.dst_pitch == self.src_pitch
    }
}

const WORD: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

/// Host → device.
pub(crate) fn upload(
    op: &'static str,
    dst: &mut DeviceMemory,
    src: &HostMemory,
    layout: &CopyLayout,
) -> Result<()> {
    let bytes = src.as_bytes();
    let staged;
    let data: &[u8] = if layout.contiguous() && layout.src_pitch % WORD == 0 {
        &bytes[..layout.src_pitch * layout.height]
    } else {
        // Repack at the device pitch.
        let mut packed = vec![0u8; layout.dst_pitch * layout.height];
        for y in 0..layout.height {
            let s = y * layout.src_pitch;
            let d = y * layout.dst_pitch;
            packed[d..d + layout.row_bytes].copy_from_slice(&bytes[s..s + layout.row_bytes]);
        }
        staged = packed;
        &staged
    };
    log::trace!("{op}: upload {} bytes ({} rows)", data.len(), layout.height);
    let handle = dst.handle().clone();
    handle.scoped(op, || {
        handle.queue.write_buffer(dst.buffer(), 0, data);
        handle.queue.submit(std::iter::empty());
    })
}

/// Device → host.
pub(crate) fn download(
    op: &'static str,
    dst: &mut HostMemory,
    src: &DeviceMemory,
    layout: &CopyLayout,
) -> Result<()> {
    let size = (layout.src_pitch * layout.height) as u64;
    let bytes = read_buffer(src.handle(), op, src.buffer(), 0, size)?;
    let out = dst.as_bytes_mut();
    if layout.contiguous() {
        let len = layout.src_pitch * (layout.height - 1) + layout.row_bytes;
        out[..len].copy_from_slice(&bytes[..len]);
    } else {
        for y in 0..layout.height {
            let s = y * layout.src_pitch;
            let d = y * layout.dst_pitch;
            out[d..d + layout.row_bytes].copy_from_slice(&bytes[s..s + layout.row_bytes]);
        }
    }
    log::trace!("{op}: downloaded {size} bytes ({} rows)", layout.height);
    Ok(())
}

/// Device → device on the same wgpu device.
pub(crate) fn copy_device(
    op: &'static str,
    dst: &mut DeviceMemory,
    src: &DeviceMemory,
    layout: &CopyLayout,
) -> Result<()> {
    if !dst.handle().same_device(src.handle()) {
        return Err(Error::precondition(op, "source and destination live on different devices"));
    }
    if std::ptr::eq(dst.buffer(), src.buffer()) {
        return Err(Error::precondition(op, "source and destination share one device buffer"));
    }
    let handle = dst.handle().clone();
    handle.scoped(op, || {
        let mut encoder = handle
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy_device") });
        if layout.contiguous() {
            let size = (layout.src_pitch * layout.height) as u64;
            encoder.copy_buffer_to_buffer(src.buffer(), 0, dst.buffer(), 0, size);
        } else {
            let row = align_to(layout.row_bytes, WORD) as u64;
            for y in 0..layout.height {
                encoder.copy_buffer_to_buffer(
                    src.buffer(),
                    (y * layout.src_pitch) as u64,
                    dst.buffer(),
                    (y * layout.dst_pitch) as u64,
                    row,
                );
            }
        }
        handle.queue.submit(Some(encoder.finish()));
    })
}

/// Write `row_pattern` (one row's worth of pixel bytes) into every row.
pub(crate) fn fill_device(
    op: &'static str,
    dst: &mut DeviceMemory,
    pitch: usize,
    row_pattern: &[u8],
    height: usize,
) -> Result<()> {
    let mut packed = vec![0u8; pitch * height];
    for row in packed.chunks_exact_mut(pitch) {
        row[..row_pattern.len()].copy_from_slice(row_pattern);
    }
    let handle = dst.handle().clone();
    handle.scoped(op, || {
        handle.queue.write_buffer(dst.buffer(), 0, &packed);
        handle.queue.submit(std::iter::empty());
    })
}

// ---------------------------------------------------------------------------
// Convenience transfers
// ---------------------------------------------------------------------------

impl<P: PixelType> PixelBuffer<P> {
    /// Copy this buffer into a fresh device-resident buffer on `gpu`.
    pub fn to_device(&self, gpu: &GpuDevice) -> Result<PixelBuffer<P>> {
        let mut out = PixelBuffer::new_device(gpu, self.width(), self.height())?;
        out.copy_from(self)?;
        Ok(out)
    }

    /// Copy this buffer into a fresh host buffer.
    pub fn to_host(&self) -> Result<PixelBuffer<P>> {
        let mut out = PixelBuffer::new(self.width(), self.height())?;
        out.copy_from(self)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::run_gpu_test_in_subprocess;
    use crate::memory::{Location, WrapMode};
    use crate::pixel::{Pixel, Pixel16sC1, Pixel32fC1, Pixel8uC1, Pixel8uC3};

    #[test]
    fn test_copy_layout_contiguous() {
        let l = CopyLayout { dst_pitch: 256, src_pitch: 256, row_bytes: 10, height: 3 };
        assert!(l.contiguous());
        let l = CopyLayout { dst_pitch: 256, src_pitch: 64, row_bytes: 10, height: 3 };
        assert!(!l.contiguous());
    }

    fn ramp_u8(w: usize, h: usize) -> PixelBuffer<Pixel8uC1> {
        let mut buf = PixelBuffer::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                buf.set(x, y, Pixel([((x * 7 + y * 13) % 251) as u8]));
            }
        }
        buf
    }

    fn round_trip_single<T: crate::pixel::Element>(gpu: &GpuDevice, a: T, b: T) {
        // 37 elements per row never fills a 64- or 256-byte pitch exactly.
        let mut host = PixelBuffer::<Pixel<T, 1>>::new(37, 5).unwrap();
        host.fill(Pixel([a])).unwrap();
        host.set(36, 4, Pixel([b]));
        host.set(0, 2, Pixel([b]));
        assert!(host.pitch() > host.row_bytes());
        let back = host.to_device(gpu).unwrap().to_host().unwrap();
        for (x, y, p) in host.pixels() {
            assert_eq!(back.get(x, y), p, "{} mismatch at ({x},{y})", T::KIND);
        }
    }

    // ---- Inner tests ---------------------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_round_trip_every_element_type() {
        let gpu = GpuDevice::new().unwrap();
        round_trip_single::<u8>(&gpu, 200, 1);
        round_trip_single::<i8>(&gpu, -100, 3);
        round_trip_single::<u16>(&gpu, 60_000, 2);
        round_trip_single::<i16>(&gpu, -30_000, 4);
        round_trip_single::<u32>(&gpu, 4_000_000_000, 5);
        round_trip_single::<i32>(&gpu, -2_000_000_000, 6);
        round_trip_single::<f32>(&gpu, 0.1, -7.5);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_round_trip_preserves_pixels() {
        let gpu = GpuDevice::new().unwrap();

        // Odd width: host pitch 64, device pitch 256, 3-byte tail per row.
        let host = ramp_u8(61, 17);
        let dev = host.to_device(&gpu).unwrap();
        assert_eq!(dev.location(), Location::Device);
        assert_eq!(dev.pitch(), 256);
        let back = dev.to_host().unwrap();
        for (x, y, p) in host.pixels() {
            assert_eq!(back.get(x, y), p, "mismatch at ({x},{y})");
        }

        let mut rgb = PixelBuffer::<Pixel8uC3>::new(33, 9).unwrap();
        rgb.fill(Pixel([1, 2, 3])).unwrap();
        rgb.set(32, 8, Pixel([9, 8, 7]));
        let back = rgb.to_device(&gpu).unwrap().to_host().unwrap();
        assert_eq!(back.get(0, 0), Pixel([1, 2, 3]));
        assert_eq!(back.get(32, 8), Pixel([9, 8, 7]));

        let mut s16 = PixelBuffer::<Pixel16sC1>::new(5, 5).unwrap();
        s16.set(4, 4, Pixel([-1234]));
        let back = s16.to_device(&gpu).unwrap().to_host().unwrap();
        assert_eq!(back.get(4, 4), Pixel([-1234]));
        assert_eq!(back.get(0, 0), Pixel([0]));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_to_device_and_fill() {
        let gpu = GpuDevice::new().unwrap();
        let host = ramp_u8(40, 6);
        let a = host.to_device(&gpu).unwrap();

        // Same pitch: block copy.
        let mut b = PixelBuffer::<Pixel8uC1>::new_device(&gpu, 40, 6).unwrap();
        b.copy_from(&a).unwrap();
        let back = b.to_host().unwrap();
        assert_eq!(back.get(39, 5), host.get(39, 5));

        // Different pitch: wrap a caller buffer with a 64-byte pitch.
        let raw = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("caller"),
            size: 64 * 6,
            usage: crate::gpu::memory::PIXEL_BUFFER_USAGE,
            mapped_at_creation: false,
        });
        let mut c = unsafe { PixelBuffer::<Pixel8uC1>::wrap_device(&gpu.handle(), &raw, 40, 6, 64) }
            .unwrap();
        c.copy_from(&a).unwrap();
        let back = c.to_host().unwrap();
        for (x, y, p) in host.pixels() {
            assert_eq!(back.get(x, y), p);
        }

        // Same underlying buffer is refused.
        let c2 = unsafe { PixelBuffer::<Pixel8uC1>::wrap_device(&gpu.handle(), &raw, 40, 6, 64) }
            .unwrap();
        assert!(c.copy_from(&c2).unwrap_err().is_precondition());

        let mut f = PixelBuffer::<Pixel32fC1>::new_device(&gpu, 9, 3).unwrap();
        f.fill(Pixel([0.25])).unwrap();
        let back = f.to_host().unwrap();
        assert!(back.pixels().all(|(_, _, p)| p == Pixel([0.25])));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_upload_from_borrowed_tight_pitch() {
        let gpu = GpuDevice::new().unwrap();
        let mut backing: Vec<f32> = (0..30).map(|i| i as f32).collect();
        let src = unsafe {
            PixelBuffer::<Pixel32fC1>::wrap_external(backing.as_mut_ptr().cast(), 5, 6, 20, WrapMode::Borrow)
        }
        .unwrap();
        let back = src.to_device(&gpu).unwrap().to_host().unwrap();
        assert_eq!(back.get(4, 5), Pixel([29.0]));
        assert_eq!(back.get(2, 3), Pixel([17.0]));
        println!("GPU_TEST_OK");
    }

    // ---- Outer tests ---------------------------------------------------------

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_round_trip_preserves_pixels() {
        let out = run_gpu_test_in_subprocess("gpu::transfer::tests::inner_round_trip_preserves_pixels");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_round_trip_every_element_type() {
        let out = run_gpu_test_in_subprocess("gpu::transfer::tests::inner_round_trip_every_element_type");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_device_to_device_and_fill() {
        let out = run_gpu_test_in_subprocess("gpu::transfer::tests::inner_device_to_device_and_fill");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_upload_from_borrowed_tight_pitch() {
        let out = run_gpu_test_in_subprocess("gpu::transfer::tests::inner_upload_from_borrowed_tight_pitch");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
