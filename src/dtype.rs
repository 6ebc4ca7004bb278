//! Mapping between host element types and their OpenCL C declarations.
//!
//! Kernels are monomorphized at program build time by injecting `-D`
//! definitions for the element types, so each trait here carries the
//! declaration text alongside the host representation.

use ocl::OclPrm;

use crate::vector::{Vec2, Vec4};

mod sealed {
    use crate::vector::{Vec2, Vec4};

    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl<T: Sealed> Sealed for Vec2<T> {}
    impl<T: Sealed> Sealed for Vec4<T> {}
}

/// A scalar that can live in a device buffer, with its OpenCL C name.
pub trait ClScalar: OclPrm + bytemuck::Pod + sealed::Sealed {
    /// OpenCL C declaration of this type.
    const DECL: &'static str;
    /// Whether kernels using this type require the `cl_khr_fp64` extension.
    const NEEDS_FP64: bool;
}

/// Any element type (scalar or vector) with an OpenCL C declaration.
pub trait ClType: OclPrm + bytemuck::Pod + sealed::Sealed {
    const DECL: &'static str;
    const NEEDS_FP64: bool;
}

macro_rules! impl_cl_scalar {
    ($ty:ty, $decl:expr, $fp64:expr) => {
        impl ClScalar for $ty {
            const DECL: &'static str = $decl;
            const NEEDS_FP64: bool = $fp64;
        }

        impl ClType for $ty {
            const DECL: &'static str = $decl;
            const NEEDS_FP64: bool = $fp64;
        }
    };
}

impl_cl_scalar!(u32, "uint", false);
impl_cl_scalar!(u64, "ulong", false);
impl_cl_scalar!(i32, "int", false);
impl_cl_scalar!(f32, "float", false);
impl_cl_scalar!(f64, "double", true);

macro_rules! impl_cl_vector {
    ($outer:ident, $inner:ty, $decl:expr) => {
        impl ClType for $outer<$inner> {
            const DECL: &'static str = $decl;
            const NEEDS_FP64: bool = <$inner as ClScalar>::NEEDS_FP64;
        }
    };
}

impl_cl_vector!(Vec2, u32, "uint2");
impl_cl_vector!(Vec2, u64, "ulong2");
impl_cl_vector!(Vec2, f32, "float2");
impl_cl_vector!(Vec2, f64, "double2");
impl_cl_vector!(Vec4, u32, "uint4");
impl_cl_vector!(Vec4, u64, "ulong4");
impl_cl_vector!(Vec4, f32, "float4");
impl_cl_vector!(Vec4, f64, "double4");

/// Floating point scalar usable for coordinates and radii.
pub trait CoordScalar:
    ClScalar
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    const INFINITY: Self;
    const NEG_INFINITY: Self;

    fn min(self, other: Self) -> Self;
    fn max(self, other: Self) -> Self;
}

impl CoordScalar for f32 {
    const INFINITY: Self = f32::INFINITY;
    const NEG_INFINITY: Self = f32::NEG_INFINITY;

    fn min(self, other: Self) -> Self {
        f32::min(self, other)
    }

    fn max(self, other: Self) -> Self {
        f32::max(self, other)
    }
}

impl CoordScalar for f64 {
    const INFINITY: Self = f64::INFINITY;
    const NEG_INFINITY: Self = f64::NEG_INFINITY;

    fn min(self, other: Self) -> Self {
        f64::min(self, other)
    }

    fn max(self, other: Self) -> Self {
        f64::max(self, other)
    }
}

/// Unsigned integer usable as a sort key or index.
pub trait SortKey: ClScalar + Ord {
    const BITS: u32;
}

impl SortKey for u32 {
    const BITS: u32 = 32;
}

impl SortKey for u64 {
    const BITS: u32 = 64;
}

/// Lane count of a device vector element. Width three is padded to four
/// lanes in memory, matching the OpenCL 3-component alignment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecWidth {
    One,
    Two,
    Three,
    Four,
    Eight,
    Sixteen,
}

impl VecWidth {
    /// Logical lane count.
    pub fn lanes(self) -> usize {
        match self {
            VecWidth::One => 1,
            VecWidth::Two => 2,
            VecWidth::Three => 3,
            VecWidth::Four => 4,
            VecWidth::Eight => 8,
            VecWidth::Sixteen => 16,
        }
    }

    /// Lane count as stored in a buffer.
    pub fn padded_lanes(self) -> usize {
        match self {
            VecWidth::Three => 4,
            w => w.lanes(),
        }
    }

    pub(crate) fn decl_suffix(self) -> &'static str {
        match self {
            VecWidth::One => "",
            VecWidth::Two => "2",
            VecWidth::Three => "3",
            VecWidth::Four => "4",
            VecWidth::Eight => "8",
            VecWidth::Sixteen => "16",
        }
    }

    /// OpenCL C declaration of `T` at this width, e.g. `float3`.
    pub(crate) fn decl<T: ClScalar>(self) -> String {
        format!("{}{}", T::DECL, self.decl_suffix())
    }
}

/// Round `x` up to the next multiple of `base`.
pub(crate) fn round_up(x: usize, base: usize) -> usize {
    (x + base - 1) / base * base
}

pub(crate) fn is_power_of_two(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}
