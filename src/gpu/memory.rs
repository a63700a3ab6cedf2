// gpu/memory.rs — device memory regions.
//
// The device side of the ownership table in memory.rs:
//
//   ExclusiveAligned  a `wgpu::Buffer` this crate created (boxed, freed on drop)
//   Borrowed          a caller's `&wgpu::Buffer`, used by pointer, never freed
//   SharedTracked     a caller's `Arc<wgpu::Buffer>`; the Arc is the token
//
// All three keep a `DeviceHandle`, so a region knows which device it belongs
// to and can submit copies without the caller passing the device in.
//
// Device pitch is 256 bytes: wgpu's COPY_BYTES_PER_ROW_ALIGNMENT. Plain
// buffer-to-buffer copies only need 4, but 256 keeps rows on the same
// boundaries a texture copy would use and matches what drivers hand out
// for pitched allocations.

use std::ptr::NonNull;
use std::sync::mpsc;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gpu::device::{DeviceHandle, GpuDevice};
use crate::image::{checked_len, checked_row_bytes, Memory, PixelBuffer};
use crate::memory::{align_to, Ownership, Release, SharedToken};
use crate::pixel::PixelType;

/// Row pitch alignment for device allocations, in bytes.
pub const DEVICE_PITCH_ALIGNMENT: usize = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;

/// Usage flags every device-resident pixel buffer must carry.
pub(crate) const PIXEL_BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Pitch used for a fresh device allocation of `row_bytes` per row.
#[inline]
pub fn device_pitch(row_bytes: usize) -> usize {
    align_to(row_bytes, DEVICE_PITCH_ALIGNMENT)
}

// ---------------------------------------------------------------------------
// DeviceMemory
// ---------------------------------------------------------------------------

/// A wgpu buffer plus its release rule.
pub(crate) struct DeviceMemory {
    buffer: NonNull<wgpu::Buffer>,
    len: u64,
    release: Release<()>,
    handle: DeviceHandle,
}

// SAFETY: `wgpu::Buffer` is Send + Sync. The pointer is either our own box,
// a caller reference the caller promised to keep alive, or the contents of
// the Arc held in `release`.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Create a fresh storage buffer of `len` bytes.
    pub(crate) fn alloc(handle: &DeviceHandle, op: &'static str, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::precondition(op, "allocation size must be > 0"));
        }
        let size = align_to(len as usize, wgpu::COPY_BUFFER_ALIGNMENT as usize) as u64;
        let buffer = handle.create_buffer(op, "pitchbuf::PixelBuffer", size, PIXEL_BUFFER_USAGE)?;
        let buffer = NonNull::from(Box::leak(Box::new(buffer)));
        Ok(DeviceMemory { buffer, len, release: Release::Exclusive(()), handle: handle.clone() })
    }

    /// Refer to a caller's buffer without owning it.
    ///
    /// # Safety
    /// The buffer behind `buffer` must outlive the returned region.
    pub(crate) unsafe fn borrowed(handle: &DeviceHandle, buffer: NonNull<wgpu::Buffer>, len: u64) -> Self {
        DeviceMemory { buffer, len, release: Release::Borrowed, handle: handle.clone() }
    }

    /// Share a caller's buffer; the region holds a clone of the Arc.
    pub(crate) fn shared(handle: &DeviceHandle, buffer: Arc<wgpu::Buffer>) -> Self {
        let len = buffer.size();
        let ptr = NonNull::from(&*buffer);
        let token: SharedToken = buffer;
        DeviceMemory { buffer: ptr, len, release: Release::Shared(token), handle: handle.clone() }
    }

    #[inline]
    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        // SAFETY: see the type-level invariant.
        unsafe { self.buffer.as_ref() }
    }

    #[inline]
    pub(crate) fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    #[inline]
    pub(crate) fn ownership(&self) -> Ownership {
        self.release.ownership()
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Release::Exclusive(()) = self.release {
            log::trace!("releasing {} exclusive device bytes", self.len);
            // SAFETY: created by `Box::leak` in `alloc` and never freed elsewhere.
            drop(unsafe { Box::from_raw(self.buffer.as_ptr()) });
        }
    }
}

// ---------------------------------------------------------------------------
// Readback
// ---------------------------------------------------------------------------

/// Copy `size` bytes starting at `offset` of `src` into host memory.
///
/// Goes through a MAP_READ staging buffer; both `offset` and `size` must be
/// multiples of 4.
pub(crate) fn read_buffer(
    handle: &DeviceHandle,
    op: &'static str,
    src: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>> {
    let staging = handle.create_buffer(
        op,
        "pitchbuf::staging_read",
        size,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    )?;

    handle.scoped(op, || {
        let mut encoder = handle
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_buffer") });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
        handle.queue.submit(Some(encoder.finish()));
    })?;

    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    handle.wait();
    rx.recv()
        .map_err(|_| Error::execution(op, "map_async callback was dropped"))?
        .map_err(|e| Error::execution(op, format!("mapping staging buffer failed: {e}")))?;

    let bytes = {
        let view = slice.get_mapped_range();
        view.to_vec()
    };
    staging.unmap();
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Device constructors for PixelBuffer
// ---------------------------------------------------------------------------

impl<P: PixelType> PixelBuffer<P> {
    /// Allocate a device-resident buffer on `gpu`. Contents are zero
    /// (wgpu zero-initializes new buffers).
    pub fn new_device(gpu: &GpuDevice, width: usize, height: usize) -> Result<Self> {
        Self::new_on(&gpu.handle(), width, height)
    }

    /// Allocate a device-resident buffer on the device behind `handle`.
    pub fn new_on(handle: &DeviceHandle, width: usize, height: usize) -> Result<Self> {
        const OP: &str = "PixelBuffer::new_device";
        let row_bytes = checked_row_bytes::<P>(OP, width, height)?;
        let pitch = device_pitch(row_bytes);
        let len = checked_len(OP, pitch, height)?;
        let memory = DeviceMemory::alloc(handle, OP, len as u64)?;
        log::debug!("{OP}: {width}×{height} pitch={pitch} ({len} bytes)");
        Ok(Self::from_parts(width, height, pitch, Memory::Device(memory)))
    }

    /// Wrap a caller-owned device buffer without taking ownership.
    ///
    /// # Errors
    /// `Precondition` if the pitch is not a multiple of 4 or smaller than a
    /// row, the buffer is smaller than `pitch * height`, or it lacks
    /// STORAGE | COPY_SRC | COPY_DST usage.
    ///
    /// # Safety
    /// `buffer` must belong to the device behind `handle` and must outlive
    /// the returned `PixelBuffer`.
    pub unsafe fn wrap_device(
        handle: &DeviceHandle,
        buffer: &wgpu::Buffer,
        width: usize,
        height: usize,
        pitch: usize,
    ) -> Result<Self> {
        const OP: &str = "PixelBuffer::wrap_device";
        check_device_wrap::<P>(OP, buffer, width, height, pitch)?;
        let memory = DeviceMemory::borrowed(handle, NonNull::from(buffer), buffer.size());
        Ok(Self::from_parts(width, height, pitch, Memory::Device(memory)))
    }

    /// Wrap a caller's device buffer, keeping it alive through `buffer`'s Arc.
    ///
    /// `buffer` must belong to the device behind `handle`.
    pub fn wrap_device_shared(
        handle: &DeviceHandle,
        buffer: Arc<wgpu::Buffer>,
        width: usize,
        height: usize,
        pitch: usize,
    ) -> Result<Self> {
        const OP: &str = "PixelBuffer::wrap_device_shared";
        check_device_wrap::<P>(OP, &buffer, width, height, pitch)?;
        let memory = DeviceMemory::shared(handle, buffer);
        Ok(Self::from_parts(width, height, pitch, Memory::Device(memory)))
    }
}

fn check_device_wrap<P: PixelType>(
    op: &'static str,
    buffer: &wgpu::Buffer,
    width: usize,
    height: usize,
    pitch: usize,
) -> Result<()> {
    let row_bytes = checked_row_bytes::<P>(op, width, height)?;
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if pitch < row_bytes || pitch % align != 0 {
        return Err(Error::precondition(
            op,
            format!("pitch {pitch} must be >= {row_bytes} and a multiple of {align}"),
        ));
    }
    let needed = checked_len(op, pitch, height)? as u64;
    if buffer.size() < needed {
        return Err(Error::precondition(
            op,
            format!("buffer holds {} bytes, {needed} needed", buffer.size()),
        ));
    }
    if !buffer.usage().contains(PIXEL_BUFFER_USAGE) {
        return Err(Error::precondition(
            op,
            format!("buffer usage {:?} lacks STORAGE | COPY_SRC | COPY_DST", buffer.usage()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
