// pixel.rs — element types and fixed-channel pixels.
//
// A pixel is C channels of one numeric element type, stored back to back:
//
//   Pixel<u8, 3>   →  [r g b]          3 bytes, align 1
//   Pixel<f32, 2>  →  [u    v   ]      8 bytes, align 4
//
// `Pixel<T, C>` is `#[repr(transparent)]` over `[T; C]`, so a row of pixels
// is exactly a row of elements and can be reinterpreted as bytes with
// bytemuck. That is what lets one buffer type serve host memory, device
// memory and the reduction shader, which reads raw 32-bit words.
//
// Element families: 8/16/32-bit signed and unsigned integers plus f32.
// Each element names the wide accumulator its sums use (`Element::Sum`),
// so a 752×480 frame of u32 cannot overflow and f32 sums are carried in
// f64 on the host.

use std::fmt;
use std::ops::{Add, Index, IndexMut, Sub};

use bytemuck::{Pod, Zeroable};

// ---------------------------------------------------------------------------
// ElementKind
// ---------------------------------------------------------------------------

/// Runtime description of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl ElementKind {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementKind::U8 | ElementKind::I8 => 1,
            ElementKind::U16 | ElementKind::I16 => 2,
            ElementKind::U32 | ElementKind::I32 | ElementKind::F32 => 4,
        }
    }

    /// Width in bits.
    pub const fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, ElementKind::I8 | ElementKind::I16 | ElementKind::I32)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ElementKind::F32)
    }

    /// Mask selecting the element's bits inside a 32-bit word.
    pub const fn mask(self) -> u32 {
        match self.size() {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    /// Short name in the usual `<bits><u|s|f>` notation, e.g. `16s`.
    pub const fn short_name(self) -> &'static str {
        match self {
            ElementKind::U8 => "8u",
            ElementKind::I8 => "8s",
            ElementKind::U16 => "16u",
            ElementKind::I16 => "16s",
            ElementKind::U32 => "32u",
            ElementKind::I32 => "32s",
            ElementKind::F32 => "32f",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Wide type that sums of an element type are carried in.
pub trait Accumulator:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + Add<Output = Self> + 'static
{
    /// Rebuild a value from the two 32-bit words the reduction shader
    /// writes: `[lo, hi]` of a 64-bit integer, or `[hi, lo]` of a
    /// double-single float.
    fn from_device_words(words: [u32; 2]) -> Self;
}

impl Accumulator for u64 {
    #[inline]
    fn from_device_words(words: [u32; 2]) -> Self {
        (words[1] as u64) << 32 | words[0] as u64
    }
}

impl Accumulator for i64 {
    #[inline]
    fn from_device_words(words: [u32; 2]) -> Self {
        u64::from_device_words(words) as i64
    }
}

impl Accumulator for f64 {
    #[inline]
    fn from_device_words(words: [u32; 2]) -> Self {
        f32::from_bits(words[0]) as f64 + f32::from_bits(words[1]) as f64
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// Numeric type that can be a pixel channel.
pub trait Element:
    Pod
    + Default
    + PartialEq
    + fmt::Debug
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + 'static
{
    const KIND: ElementKind;

    /// Accumulator used for sums over this element type.
    type Sum: Accumulator;

    /// Lossless conversion into the accumulator.
    fn widen(self) -> Self::Sum;

    /// Bit pattern zero-extended to 32 bits, as the shader loads it.
    fn to_bits(self) -> u32;

    /// Channel addition: two's complement wrap for integers in every build
    /// profile, IEEE addition for f32.
    fn wrapping_add(self, rhs: Self) -> Self;

    /// Channel subtraction, wrapping like `wrapping_add`.
    fn wrapping_sub(self, rhs: Self) -> Self;
}

macro_rules! impl_int_element {
    ($t:ty, $kind:ident, $sum:ty, $unsigned:ty) => {
        impl Element for $t {
            const KIND: ElementKind = ElementKind::$kind;
            type Sum = $sum;

            #[inline]
            fn widen(self) -> $sum {
                self as $sum
            }

            #[inline]
            fn to_bits(self) -> u32 {
                self as $unsigned as u32
            }

            #[inline]
            fn wrapping_add(self, rhs: Self) -> Self {
                <$t>::wrapping_add(self, rhs)
            }

            #[inline]
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$t>::wrapping_sub(self, rhs)
            }
        }
    };
}

impl_int_element!(u8, U8, u64, u8);
impl_int_element!(i8, I8, i64, u8);
impl_int_element!(u16, U16, u64, u16);
impl_int_element!(i16, I16, i64, u16);
impl_int_element!(u32, U32, u64, u32);
impl_int_element!(i32, I32, i64, u32);

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;
    type Sum = f64;

    #[inline]
    fn widen(self) -> f64 {
        self as f64
    }

    #[inline]
    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    #[inline]
    fn wrapping_add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn wrapping_sub(self, rhs: Self) -> Self {
        self - rhs
    }
}

// ---------------------------------------------------------------------------
// Pixel<T, C>
// ---------------------------------------------------------------------------

/// A pixel of `C` channels of element type `T`, stored contiguously.
///
/// Equality and arithmetic are component-wise. Integer channels wrap on
/// overflow (`Pixel([200u8]) + Pixel([100u8])` is `Pixel([44])`) in debug and release
/// alike.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq)]
pub struct Pixel<T: Element, const C: usize>(pub [T; C]);

// SAFETY: `Pixel` is `repr(transparent)` over `[T; C]` with `T: Pod`, so it
// has no padding and every bit pattern is valid.
unsafe impl<T: Element, const C: usize> Zeroable for Pixel<T, C> {}
unsafe impl<T: Element, const C: usize> Pod for Pixel<T, C> {}

impl<T: Element, const C: usize> Pixel<T, C> {
    /// All channels set to `value`.
    #[inline]
    pub fn splat(value: T) -> Self {
        Pixel([value; C])
    }

    #[inline]
    pub fn channels(&self) -> &[T; C] {
        &self.0
    }
}

impl<T: Element, const C: usize> Default for Pixel<T, C> {
    fn default() -> Self {
        Pixel([T::default(); C])
    }
}

impl<T: Element, const C: usize> fmt::Debug for Pixel<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if C == 1 {
            write!(f, "{:?}", self.0[0])
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

impl<T: Element> From<T> for Pixel<T, 1> {
    #[inline]
    fn from(value: T) -> Self {
        Pixel([value])
    }
}

impl<T: Element, const C: usize> From<[T; C]> for Pixel<T, C> {
    #[inline]
    fn from(value: [T; C]) -> Self {
        Pixel(value)
    }
}

impl<T: Element, const C: usize> Index<usize> for Pixel<T, C> {
    type Output = T;

    #[inline]
    fn index(&self, channel: usize) -> &T {
        &self.0[channel]
    }
}

impl<T: Element, const C: usize> IndexMut<usize> for Pixel<T, C> {
    #[inline]
    fn index_mut(&mut self, channel: usize) -> &mut T {
        &mut self.0[channel]
    }
}

impl<T: Element, const C: usize> Add for Pixel<T, C> {
    type Output = Self;

    #[inline]
    fn add(mut self, rhs: Self) -> Self {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a = Element::wrapping_add(*a, b);
        }
        self
    }
}

impl<T: Element, const C: usize> Sub for Pixel<T, C> {
    type Output = Self;

    #[inline]
    fn sub(mut self, rhs: Self) -> Self {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a = Element::wrapping_sub(*a, b);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// PixelType
// ---------------------------------------------------------------------------

/// Anything a `PixelBuffer` can hold. Implemented for every `Pixel<T, C>`.
pub trait PixelType: Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Elem: Element;
    const CHANNELS: usize;
}

impl<T: Element, const C: usize> PixelType for Pixel<T, C> {
    type Elem = T;
    const CHANNELS: usize = C;
}

// ---------------------------------------------------------------------------
// Aliases
// ---------------------------------------------------------------------------

pub type Pixel8uC1 = Pixel<u8, 1>;
pub type Pixel8uC2 = Pixel<u8, 2>;
pub type Pixel8uC3 = Pixel<u8, 3>;
pub type Pixel8uC4 = Pixel<u8, 4>;

pub type Pixel8sC1 = Pixel<i8, 1>;
pub type Pixel8sC2 = Pixel<i8, 2>;
pub type Pixel8sC3 = Pixel<i8, 3>;
pub type Pixel8sC4 = Pixel<i8, 4>;

pub type Pixel16uC1 = Pixel<u16, 1>;
pub type Pixel16uC2 = Pixel<u16, 2>;
pub type Pixel16uC3 = Pixel<u16, 3>;
pub type Pixel16uC4 = Pixel<u16, 4>;

pub type Pixel16sC1 = Pixel<i16, 1>;
pub type Pixel16sC2 = Pixel<i16, 2>;
pub type Pixel16sC3 = Pixel<i16, 3>;
pub type Pixel16sC4 = Pixel<i16, 4>;

pub type Pixel32uC1 = Pixel<u32, 1>;
pub type Pixel32uC2 = Pixel<u32, 2>;
pub type Pixel32uC3 = Pixel<u32, 3>;
pub type Pixel32uC4 = Pixel<u32, 4>;

pub type Pixel32sC1 = Pixel<i32, 1>;
pub type Pixel32sC2 = Pixel<i32, 2>;
pub type Pixel32sC3 = Pixel<i32, 3>;
pub type Pixel32sC4 = Pixel<i32, 4>;

pub type Pixel32fC1 = Pixel<f32, 1>;
pub type Pixel32fC2 = Pixel<f32, 2>;
pub type Pixel32fC3 = Pixel<f32, 3>;
pub type Pixel32fC4 = Pixel<f32, 4>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
