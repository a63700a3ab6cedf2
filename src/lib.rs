// pitchbuf: pitched 2D pixel buffers for vision pipelines
//
// A `PixelBuffer<P>` is a width × height grid of pixels with an explicit
// row pitch, living either in host memory or in a wgpu storage buffer, and
// either owning its memory, borrowing it, or sharing it through a token.
// On top of that sits a two-stage tree reduction (sum, count-equal) with a
// rayon CPU reference and a wgpu compute implementation.

pub mod error;
pub mod pixel;
pub mod memory;
pub mod image;
pub mod reduce;
pub mod gpu;

pub use error::{Error, Result};
pub use image::PixelBuffer;
pub use memory::{Location, Ownership, SharedToken, WrapMode};
pub use pixel::*;
pub use reduce::{ReduceOp, ReductionResult};
