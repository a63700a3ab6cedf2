// memory.rs — host memory regions and the ownership model.
//
// Every buffer sits on exactly one region of raw memory, and exactly one
// rule decides what happens to that region when the buffer is dropped:
//
//   ┌───────────────────┬─────────────────────────┬──────────────────────┐
//   │ Ownership         │ Who allocated           │ On drop              │
//   ├───────────────────┼─────────────────────────┼──────────────────────┤
//   │ ExclusiveAligned  │ this crate              │ freed here           │
//   │ Borrowed          │ caller                  │ nothing              │
//   │ SharedTracked     │ caller, + lifetime token│ token clone released │
//   └───────────────────┴─────────────────────────┴──────────────────────┘
//
// The rule is a tag on the region, not a trait object: `Release` is a
// plain enum and `Drop` matches on it. The shared token is an
// `Arc<dyn Any + Send + Sync>`; whoever built the token decides what "free"
// means (drop a Vec, unmap a file, hand a frame back to a capture ring).
// The region never frees the raw pointer itself in that mode.
//
// Device regions follow the same table, see gpu/memory.rs.

use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Row pitch and base alignment for host allocations, in bytes.
/// 64 covers AVX-512 loads and a full cache line.
pub const HOST_ALIGNMENT: usize = 64;

/// Opaque shared-ownership token for externally allocated memory.
///
/// The allocation stays alive for as long as any clone of the token exists.
pub type SharedToken = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Location / Ownership tags
// ---------------------------------------------------------------------------

/// Memory space a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => f.write_str("host"),
            Location::Device => f.write_str("device"),
        }
    }
}

/// How a buffer relates to the memory it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Allocated (aligned) by the buffer and freed by it.
    ExclusiveAligned,
    /// Caller memory; never freed by the buffer.
    Borrowed,
    /// Caller memory kept alive by a shared token the buffer holds.
    SharedTracked,
}

/// What `wrap_external` does with caller memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// Use the caller's pointer directly (`Ownership::Borrowed`).
    Borrow,
    /// Deep-copy the caller's rows into a fresh aligned allocation
    /// (`Ownership::ExclusiveAligned`); the pointer is not kept.
    CopyIn,
}

/// Release rule carried by a region. `Ownership` is its public face.
///
/// `E` is whatever the exclusive case needs to free the memory: the
/// `Layout` on the host, nothing on the device (the boxed `wgpu::Buffer`
/// frees itself).
pub(crate) enum Release<E = Layout> {
    Exclusive(E),
    Borrowed,
    Shared(#[allow(dead_code)] SharedToken),
}

impl<E> Release<E> {
    pub(crate) fn ownership(&self) -> Ownership {
        match self {
            Release::Exclusive(_) => Ownership::ExclusiveAligned,
            Release::Borrowed => Ownership::Borrowed,
            Release::Shared(_) => Ownership::SharedTracked,
        }
    }
}

// ---------------------------------------------------------------------------
// Pitch helpers
// ---------------------------------------------------------------------------

/// Round `value` up to the next multiple of `alignment` (a power of two or
/// any non-zero value).
///
///   align_to(100, 64) = 128
///   align_to(128, 64) = 128
#[inline]
pub fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Pitch used for a fresh host allocation of `row_bytes` per row.
#[inline]
pub fn host_pitch(row_bytes: usize) -> usize {
    align_to(row_bytes, HOST_ALIGNMENT)
}

// ---------------------------------------------------------------------------
// HostMemory
// ---------------------------------------------------------------------------

/// A region of host memory plus its release rule.
pub(crate) struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
    release: Release,
}

// SAFETY: an exclusive region is uniquely owned like a `Box<[u8]>`. For
// borrowed and shared regions the caller promised (at the unsafe wrap
// call) that the memory stays valid and is not mutated behind the buffer's
// back, which is the same guarantee a `&mut [u8]` carries.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Allocate `len` zeroed bytes aligned to `HOST_ALIGNMENT`.
    pub(crate) fn alloc_zeroed(op: &'static str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::precondition(op, "allocation size must be > 0"));
        }
        let layout = Layout::from_size_align(len, HOST_ALIGNMENT)
            .map_err(|e| Error::allocation(op, len as u64, e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::allocation(op, len as u64, "host allocator returned null"))?;
        log::trace!("{op}: allocated {len} host bytes at {raw:p}");
        Ok(HostMemory { ptr, len, release: Release::Exclusive(layout) })
    }

    /// Wrap caller memory without taking ownership.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// lifetime of the returned region.
    pub(crate) unsafe fn borrowed(ptr: NonNull<u8>, len: usize) -> Self {
        HostMemory { ptr, len, release: Release::Borrowed }
    }

    /// Wrap caller memory kept alive by `token`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as `token` (or any clone of it) is alive.
    pub(crate) unsafe fn shared(ptr: NonNull<u8>, len: usize, token: SharedToken) -> Self {
        HostMemory { ptr, len, release: Release::Shared(token) }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn ownership(&self) -> Ownership {
        self.release.ownership()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: region is valid for `len` bytes (construction contract).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        match &self.release {
            Release::Exclusive(layout) => {
                log::trace!("releasing {} exclusive host bytes at {:p}", self.len, self.ptr);
                // SAFETY: allocated in `alloc_zeroed` with exactly this layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), *layout) }
            }
            // The token (if any) is dropped with `self.release`.
            Release::Borrowed | Release::Shared(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(1, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 64), 128);
        assert_eq!(align_to(752 * 4, 256), 3072);
        assert_eq!(align_to(0, 64), 0);
    }

    #[test]
    fn test_host_pitch_covers_row() {
        for row_bytes in [1usize, 3, 63, 64, 65, 752, 2256, 3008] {
            let pitch = host_pitch(row_bytes);
            assert!(pitch >= row_bytes);
            assert_eq!(pitch % HOST_ALIGNMENT, 0);
            assert!(pitch - row_bytes < HOST_ALIGNMENT);
        }
    }

    #[test]
    fn test_alloc_zeroed_is_aligned_and_zero() {
        let mem = HostMemory::alloc_zeroed("test", 1000).unwrap();
        assert_eq!(mem.as_ptr() as usize % HOST_ALIGNMENT, 0);
        assert_eq!(mem.len(), 1000);
        assert!(mem.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(mem.ownership(), Ownership::ExclusiveAligned);
    }

    #[test]
    fn test_alloc_zero_bytes_is_precondition() {
        let err = HostMemory::alloc_zeroed("test", 0).err().unwrap();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_borrowed_region_leaves_memory_alone() {
        let mut backing = vec![7u8; 32];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        for _ in 0..4 {
            let mut mem = unsafe { HostMemory::borrowed(ptr, 32) };
            assert_eq!(mem.ownership(), Ownership::Borrowed);
            mem.as_bytes_mut()[0] = 9;
        }
        assert_eq!(backing[0], 9);
        assert!(backing[1..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_shared_region_holds_token() {
        let backing: Arc<Vec<u8>> = Arc::new(vec![1u8; 16]);
        let ptr = NonNull::new(backing.as_ptr() as *mut u8).unwrap();
        let token: SharedToken = backing.clone();
        let mem = unsafe { HostMemory::shared(ptr, 16, token) };
        assert_eq!(Arc::strong_count(&backing), 2);
        assert_eq!(mem.ownership(), Ownership::SharedTracked);
        drop(mem);
        assert_eq!(Arc::strong_count(&backing), 1);
    }
}
