// image.rs — PixelBuffer<P>: a pitched 2D grid of pixels.
//
// One type covers every memory arrangement the rest of the crate deals
// with. What varies is hidden in `Memory`:
//
//   ┌────────────┬──────────────────────────┬─────────────────────────────┐
//   │ Location   │ Storage                  │ Element access              │
//   ├────────────┼──────────────────────────┼─────────────────────────────┤
//   │ Host       │ raw aligned bytes        │ element_at / row / pixels   │
//   │ Device     │ wgpu storage buffer      │ none (transfer to host)     │
//   └────────────┴──────────────────────────┴─────────────────────────────┘
//
// and each of those carries one of the three ownership rules from
// memory.rs (exclusive, borrowed, shared-tracked).
//
// Memory layout (pitch = 16 bytes, width = 3 pixels of 4 bytes):
//
//   byte offset:  0   4   8  12 |16  20  24  28 |32 ...
//   pixel:        ■   ■   ■   · | ■   ■   ■   · | ■
//   row:          |--- row 0 ---|--- row 1 -----|
//
//   Bytes 12..16 and 28..32 are padding. Row y starts at y * pitch, never at
//   y * width * size_of::<P>(). Padding content is unspecified.
//
// Pitch is fixed at construction. Fresh host buffers round it up to 64
// bytes, fresh device buffers to 256 (wgpu's copy alignment), so the same
// image can have two different pitches on either side of a transfer.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::gpu::device::DeviceHandle;
use crate::gpu::memory::DeviceMemory;
use crate::gpu::transfer;
use crate::memory::{host_pitch, HostMemory, Location, Ownership, SharedToken, WrapMode};
use crate::pixel::PixelType;

/// Backing store of a buffer.
pub(crate) enum Memory {
    Host(HostMemory),
    Device(DeviceMemory),
}

impl Memory {
    fn location(&self) -> Location {
        match self {
            Memory::Host(_) => Location::Host,
            Memory::Device(_) => Location::Device,
        }
    }

    fn ownership(&self) -> Ownership {
        match self {
            Memory::Host(m) => m.ownership(),
            Memory::Device(m) => m.ownership(),
        }
    }
}

// ---------------------------------------------------------------------------
// PixelBuffer<P>
// ---------------------------------------------------------------------------

/// A 2D buffer of `width × height` pixels with an explicit row pitch.
///
/// Dropping a buffer releases its memory only when it owns it
/// (`Ownership::ExclusiveAligned`) or drops its clone of a shared token
/// (`Ownership::SharedTracked`). Borrowed memory is never touched.
pub struct PixelBuffer<P: PixelType> {
    width: usize,
    height: usize,
    /// Row stride in *bytes*. pitch >= width * size_of::<P>().
    pitch: usize,
    pub(crate) memory: Memory,
    _pixel: PhantomData<P>,
}

/// Validate dimensions and return the number of payload bytes per row.
pub(crate) fn checked_row_bytes<P: PixelType>(
    op: &'static str,
    width: usize,
    height: usize,
) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(Error::precondition(
            op,
            format!("width and height must be > 0 (got {width}×{height})"),
        ));
    }
    if size_of::<P>() == 0 {
        return Err(Error::precondition(op, "pixel type has zero size"));
    }
    width
        .checked_mul(size_of::<P>())
        .ok_or_else(|| Error::precondition(op, format!("row of {width} pixels overflows usize")))
}

/// `pitch * height`, or a precondition error on overflow.
pub(crate) fn checked_len(op: &'static str, pitch: usize, height: usize) -> Result<usize> {
    pitch
        .checked_mul(height)
        .ok_or_else(|| Error::precondition(op, format!("{pitch} × {height} bytes overflows usize")))
}

impl<P: PixelType> PixelBuffer<P> {
    pub(crate) fn from_parts(width: usize, height: usize, pitch: usize, memory: Memory) -> Self {
        PixelBuffer { width, height, pitch, memory, _pixel: PhantomData }
    }

    // --- Host constructors ---

    /// Allocate a zero-filled host buffer with an aligned pitch.
    ///
    /// # Errors
    /// `Precondition` for a zero dimension, `Allocation` if the host
    /// allocator cannot provide the memory.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        const OP: &str = "PixelBuffer::new";
        let row_bytes = checked_row_bytes::<P>(OP, width, height)?;
        let pitch = host_pitch(row_bytes);
        let len = checked_len(OP, pitch, height)?;
        let memory = HostMemory::alloc_zeroed(OP, len)?;
        log::debug!("{OP}: {width}×{height} pitch={pitch} ({len} bytes)");
        Ok(Self::from_parts(width, height, pitch, Memory::Host(memory)))
    }

    /// Build a host buffer from packed row-major pixels (`width * height`
    /// entries, no padding).
    pub fn from_vec(width: usize, height: usize, data: Vec<P>) -> Result<Self> {
        const OP: &str = "PixelBuffer::from_vec";
        if data.len() != width.saturating_mul(height) {
            return Err(Error::precondition(
                OP,
                format!("data length ({}) must equal width * height ({width}×{height})", data.len()),
            ));
        }
        let mut buf = Self::new(width, height)?;
        for (y, src) in data.chunks_exact(width).enumerate() {
            buf.row_mut(y).copy_from_slice(src);
        }
        Ok(buf)
    }

    /// Wrap caller-owned host memory.
    ///
    /// With `WrapMode::Borrow` the buffer uses `ptr` directly and never
    /// frees it. With `WrapMode::CopyIn` the rows are copied into a fresh
    /// aligned allocation and `ptr` is not retained.
    ///
    /// # Errors
    /// `Precondition` if `ptr` is null or misaligned for `P`, a dimension is
    /// zero, or `pitch` is smaller than a row or not a multiple of `P`'s
    /// alignment.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `pitch * height` bytes.
    /// With `WrapMode::Borrow` it must stay valid, and must not be freed or
    /// mutated through other aliases, for as long as the returned buffer
    /// (or any operation using it) is alive.
    pub unsafe fn wrap_external(
        ptr: *mut P,
        width: usize,
        height: usize,
        pitch: usize,
        mode: WrapMode,
    ) -> Result<Self> {
        const OP: &str = "PixelBuffer::wrap_external";
        let (ptr, len) = check_external::<P>(OP, ptr, width, height, pitch)?;
        let borrowed = Self::from_parts(
            width,
            height,
            pitch,
            Memory::Host(HostMemory::borrowed(ptr, len)),
        );
        match mode {
            WrapMode::Borrow => {
                log::debug!("{OP}: borrowing {width}×{height} pitch={pitch} at {ptr:p}");
                Ok(borrowed)
            }
            WrapMode::CopyIn => {
                log::debug!("{OP}: copying in {width}×{height} pitch={pitch} from {ptr:p}");
                borrowed.try_clone()
            }
        }
    }

    /// Wrap caller-owned host memory whose lifetime is tracked by `token`.
    ///
    /// The buffer keeps a clone of `token`; the allocation stays alive until
    /// the last clone (in this buffer or anywhere else) is dropped. The
    /// buffer never frees `ptr` itself.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `pitch * height` bytes
    /// for as long as any clone of `token` is alive, and must not be mutated
    /// through other aliases while the buffer is in use.
    pub unsafe fn wrap_external_tracked(
        ptr: *mut P,
        width: usize,
        height: usize,
        pitch: usize,
        token: SharedToken,
    ) -> Result<Self> {
        const OP: &str = "PixelBuffer::wrap_external_tracked";
        let (ptr, len) = check_external::<P>(OP, ptr, width, height, pitch)?;
        log::debug!("{OP}: tracking {width}×{height} pitch={pitch} at {ptr:p}");
        Ok(Self::from_parts(
            width,
            height,
            pitch,
            Memory::Host(HostMemory::shared(ptr, len, token)),
        ))
    }

    /// Deep copy into a fresh exclusive buffer in the same location.
    ///
    /// The copy gets the default pitch for its location, which may differ
    /// from the source pitch (e.g. a copy of a wrapped external image).
    pub fn try_clone(&self) -> Result<Self> {
        let mut out = match &self.memory {
            Memory::Host(_) => Self::new(self.width, self.height)?,
            Memory::Device(m) => Self::new_on(m.handle(), self.width, self.height)?,
        };
        out.copy_from(self)?;
        Ok(out)
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes between the starts of consecutive rows.
    #[inline]
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Payload bytes per row (`width * size_of::<P>()`), excluding padding.
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width * size_of::<P>()
    }

    /// Bytes spanned by the buffer (`pitch * height`).
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.pitch * self.height
    }

    #[inline]
    pub fn location(&self) -> Location {
        self.memory.location()
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.memory.ownership()
    }

    #[inline]
    pub fn is_host(&self) -> bool {
        self.location() == Location::Host
    }

    #[inline]
    pub fn is_device(&self) -> bool {
        self.location() == Location::Device
    }

    /// The wgpu buffer behind a device-resident buffer.
    pub fn device_buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.memory {
            Memory::Device(m) => Some(m.buffer()),
            Memory::Host(_) => None,
        }
    }

    /// The device a device-resident buffer lives on.
    pub fn device_handle(&self) -> Option<&DeviceHandle> {
        match &self.memory {
            Memory::Device(m) => Some(m.handle()),
            Memory::Host(_) => None,
        }
    }

    // --- Element access ---

    /// Bounds-checked reference to the pixel at column `x`, row `y`.
    ///
    /// # Errors
    /// `Precondition` when `(x, y)` is outside the buffer or the buffer is
    /// device-resident.
    pub fn element_at(&self, x: usize, y: usize) -> Result<&P> {
        const OP: &str = "PixelBuffer::element_at";
        self.check_bounds(OP, x, y)?;
        let offset = self.offset_of(x, y);
        let bytes = self.host_memory(OP)?.as_bytes();
        Ok(bytemuck::from_bytes(&bytes[offset..offset + size_of::<P>()]))
    }

    /// Mutable variant of [`element_at`](Self::element_at).
    pub fn element_at_mut(&mut self, x: usize, y: usize) -> Result<&mut P> {
        const OP: &str = "PixelBuffer::element_at_mut";
        self.check_bounds(OP, x, y)?;
        let offset = self.offset_of(x, y);
        let bytes = self.host_memory_mut(OP)?.as_bytes_mut();
        Ok(bytemuck::from_bytes_mut(&mut bytes[offset..offset + size_of::<P>()]))
    }

    /// Read the pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds or the buffer is on the device.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> P {
        match self.element_at(x, y) {
            Ok(p) => *p,
            Err(e) => panic!("{e}"),
        }
    }

    /// Write the pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds or the buffer is on the device.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: P) {
        match self.element_at_mut(x, y) {
            Ok(p) => *p = value,
            Err(e) => panic!("{e}"),
        }
    }

    /// Borrow row `y` as a `width`-long slice (padding excluded).
    ///
    /// # Panics
    /// Panics if `y >= height` or the buffer is on the device.
    pub fn row(&self, y: usize) -> &[P] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.pitch;
        let len = self.row_bytes();
        let bytes = match self.host_memory("PixelBuffer::row") {
            Ok(m) => m.as_bytes(),
            Err(e) => panic!("{e}"),
        };
        bytemuck::cast_slice(&bytes[start..start + len])
    }

    /// Mutable borrow of row `y`.
    pub fn row_mut(&mut self, y: usize) -> &mut [P] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.pitch;
        let len = self.row_bytes();
        let bytes = match self.host_memory_mut("PixelBuffer::row_mut") {
            Ok(m) => m.as_bytes_mut(),
            Err(e) => panic!("{e}"),
        };
        bytemuck::cast_slice_mut(&mut bytes[start..start + len])
    }

    /// Iterate over all pixels as `(x, y, value)`, skipping row padding.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, P)> + '_ {
        (0..self.height).flat_map(move |y| {
            self.row(y).iter().enumerate().map(move |(x, &p)| (x, y, p))
        })
    }

    /// Raw bytes of a host buffer, padding included.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        Ok(self.host_memory("PixelBuffer::as_bytes")?.as_bytes())
    }

    // --- Bulk operations ---

    /// Set every pixel to `value`. Padding is left as is on the host.
    pub fn fill(&mut self, value: P) -> Result<()> {
        const OP: &str = "PixelBuffer::fill";
        let (width, height, pitch) = (self.width, self.height, self.pitch);
        let row_bytes = self.row_bytes();
        match &mut self.memory {
            Memory::Host(mem) => {
                let bytes = mem.as_bytes_mut();
                for y in 0..height {
                    let start = y * pitch;
                    let row: &mut [P] = bytemuck::cast_slice_mut(&mut bytes[start..start + row_bytes]);
                    row.fill(value);
                }
                Ok(())
            }
            Memory::Device(mem) => {
                let pattern = vec![value; width];
                transfer::fill_device(OP, mem, pitch, bytemuck::cast_slice(&pattern), height)
            }
        }
    }

    /// Copy every pixel of `src` into `self`.
    ///
    /// Works across locations (host↔device) and across pitches. Same-pitch
    /// copies within one location move a single contiguous block; all others
    /// go row by row.
    ///
    /// # Errors
    /// `Precondition` if the dimensions differ or (device↔device) the two
    /// buffers live on different devices; `Allocation`/`Execution` from the
    /// device side of a transfer.
    pub fn copy_from(&mut self, src: &PixelBuffer<P>) -> Result<()> {
        const OP: &str = "PixelBuffer::copy_from";
        if self.width != src.width || self.height != src.height {
            return Err(Error::precondition(
                OP,
                format!(
                    "size mismatch: destination {}×{}, source {}×{}",
                    self.width, self.height, src.width, src.height
                ),
            ));
        }
        let layout = transfer::CopyLayout {
            dst_pitch: self.pitch,
            src_pitch: src.pitch,
            row_bytes: self.row_bytes(),
            height: self.height,
        };
        log::trace!(
            "{OP}: {}×{} {} → {} (pitch {} → {})",
            self.width,
            self.height,
            src.location(),
            self.location(),
            src.pitch,
            self.pitch
        );
        match (&mut self.memory, &src.memory) {
            (Memory::Host(dst), Memory::Host(s)) => {
                copy_host(dst, s, &layout);
                Ok(())
            }
            (Memory::Host(dst), Memory::Device(s)) => transfer::download(OP, dst, s, &layout),
            (Memory::Device(dst), Memory::Host(s)) => transfer::upload(OP, dst, s, &layout),
            (Memory::Device(dst), Memory::Device(s)) => transfer::copy_device(OP, dst, s, &layout),
        }
    }

    // --- Internal helpers ---

    #[inline]
    fn offset_of(&self, x: usize, y: usize) -> usize {
        y * self.pitch + x * size_of::<P>()
    }

    fn check_bounds(&self, op: &'static str, x: usize, y: usize) -> Result<()> {
        if x < self.width && y < self.height {
            Ok(())
        } else {
            Err(Error::precondition(
                op,
                format!("pixel ({x},{y}) out of bounds for buffer {}×{}", self.width, self.height),
            ))
        }
    }

    fn host_memory(&self, op: &'static str) -> Result<&HostMemory> {
        match &self.memory {
            Memory::Host(m) => Ok(m),
            Memory::Device(_) => Err(Error::precondition(
                op,
                "buffer is device-resident; transfer it to the host first",
            )),
        }
    }

    fn host_memory_mut(&mut self, op: &'static str) -> Result<&mut HostMemory> {
        match &mut self.memory {
            Memory::Host(m) => Ok(m),
            Memory::Device(_) => Err(Error::precondition(
                op,
                "buffer is device-resident; transfer it to the host first",
            )),
        }
    }
}

/// Validate an external pointer and layout. Returns the non-null pointer
/// and the byte length it must cover.
fn check_external<P: PixelType>(
    op: &'static str,
    ptr: *mut P,
    width: usize,
    height: usize,
    pitch: usize,
) -> Result<(NonNull<u8>, usize)> {
    let ptr = NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::precondition(op, "external pointer is null"))?;
    let row_bytes = checked_row_bytes::<P>(op, width, height)?;
    if (ptr.as_ptr() as usize) % align_of::<P>() != 0 {
        return Err(Error::precondition(
            op,
            format!("pointer {ptr:p} is not aligned to {} bytes", align_of::<P>()),
        ));
    }
    if pitch < row_bytes {
        return Err(Error::precondition(
            op,
            format!("pitch {pitch} is smaller than a row ({row_bytes} bytes)"),
        ));
    }
    if pitch % align_of::<P>() != 0 {
        return Err(Error::precondition(
            op,
            format!("pitch {pitch} is not a multiple of the pixel alignment {}", align_of::<P>()),
        ));
    }
    let len = checked_len(op, pitch, height)?;
    Ok((ptr, len))
}

/// Host-to-host copy. Same pitch: one block; otherwise row by row.
///
/// Uses `ptr::copy` (memmove) because two borrowed buffers may wrap the
/// same caller memory.
fn copy_host(dst: &mut HostMemory, src: &HostMemory, layout: &transfer::CopyLayout) {
    let s = src.as_ptr();
    let d = dst.as_mut_ptr();
    // SAFETY: both regions cover `pitch * height` bytes (checked at
    // construction) and `row_bytes <= pitch` on both sides.
    unsafe {
        if layout.dst_pitch == layout.src_pitch {
            let len = layout.src_pitch * (layout.height - 1) + layout.row_bytes;
            std::ptr::copy(s, d, len);
        } else {
            for y in 0..layout.height {
                std::ptr::copy(
                    s.add(y * layout.src_pitch),
                    d.add(y * layout.dst_pitch),
                    layout.row_bytes,
                );
            }
        }
    }
}

// Debug formatting — prints the top-left corner of host buffers.
impl<P: PixelType> fmt::Debug for PixelBuffer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "PixelBuffer<{}> {{ {}×{}, pitch={}, {}, {:?} }}",
            std::any::type_name::<P>(),
            self.width,
            self.height,
            self.pitch,
            self.location(),
            self.ownership(),
        )?;
        if self.is_host() {
            for y in 0..self.height.min(8) {
                write!(f, "  row {y}: [")?;
                for (x, p) in self.row(y).iter().take(16).enumerate() {
                    if x > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p:?}")?;
                }
                if self.width > 16 {
                    write!(f, ", ...")?;
                }
                writeln!(f, "]")?;
            }
            if self.height > 8 {
                writeln!(f, "  ...")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
