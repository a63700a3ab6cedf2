// error.rs — the crate-wide error type.
//
// Three families, kept distinct so callers can react differently:
//
//   Precondition  — the caller asked for something invalid (null pointer,
//                   zero dimension, out-of-bounds access, wrong memory
//                   location). Fixing the call fixes the error.
//   Allocation    — host or device memory could not be provided. No
//                   partially-built buffer is ever returned.
//   Execution     — the device faulted while running a copy or a reduction.
//                   Nothing is retried here.
//
// Device bring-up errors (adapter, device request, workgroup limits) live
// in the same enum so a single `?` covers a whole pipeline.

use thiserror::Error;

/// Errors produced by buffer construction, transfer and reduction.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid arguments or state for the requested operation.
    #[error("{op}: precondition violated: {detail}")]
    Precondition { op: &'static str, detail: String },

    /// Host or device memory request could not be satisfied.
    #[error("{op}: failed to allocate {bytes} bytes: {detail}")]
    Allocation {
        op: &'static str,
        bytes: u64,
        detail: String,
    },

    /// The device reported a fault while executing submitted work.
    #[error("{op}: device execution failed: {detail}")]
    Execution { op: &'static str, detail: String },

    /// No Vulkan adapter could be found.
    #[error(
        "no suitable Vulkan adapter found (only CPU/software renderers visible); \
         ensure Vulkan is installed and `vulkaninfo` lists a real GPU"
    )]
    NoSuitableAdapter,

    /// wgpu refused the device request (driver issue, unsupported limits).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// Requested workgroup exceeds the profile's invocation limit.
    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    /// Reduction workgroups must be a non-zero power of two.
    #[error("workgroup size {0} is not a power of two")]
    InvalidWorkgroupSize(u32),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn precondition(op: &'static str, detail: impl Into<String>) -> Self {
        Error::Precondition { op, detail: detail.into() }
    }

    pub(crate) fn allocation(op: &'static str, bytes: u64, detail: impl Into<String>) -> Self {
        Error::Allocation { op, bytes, detail: detail.into() }
    }

    pub(crate) fn execution(op: &'static str, detail: impl Into<String>) -> Self {
        Error::Execution { op, detail: detail.into() }
    }

    /// True for caller mistakes (as opposed to resource or device failures).
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition { .. })
    }

    /// True when a host or device allocation could not be satisfied.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Error::Allocation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_operation() {
        let e = Error::precondition("PixelBuffer::new", "width must be > 0 (got 0×4)");
        assert_eq!(
            e.to_string(),
            "PixelBuffer::new: precondition violated: width must be > 0 (got 0×4)"
        );
        assert!(e.is_precondition());
        assert!(!e.is_allocation());

        let e = Error::allocation("PixelBuffer::new", 4096, "allocator returned null");
        assert!(e.to_string().contains("4096 bytes"));
        assert!(e.is_allocation());
    }

    #[test]
    fn test_workgroup_errors() {
        let e = Error::WorkgroupTooLarge { total: 512, max: 256 };
        assert_eq!(e.to_string(), "workgroup size 512 exceeds profile limit of 256 invocations");
        assert_eq!(Error::InvalidWorkgroupSize(96).to_string(), "workgroup size 96 is not a power of two");
    }
}
