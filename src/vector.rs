//! Plain-old-data vector types mirroring the OpenCL vector layouts.
//!
//! `Vec2` and `Vec4` match the device `type2`/`type4` layouts exactly and
//! may cross the buffer boundary. `Vec3` is a 12-byte host-side type for
//! geometry math; three-component device data is stored as `Vec4` with an
//! unused fourth lane, since device `type3` occupies four lanes.

use std::ops::{Add, Div, Index, IndexMut, Mul, Sub};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec2<T>(pub T, pub T);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec3<T>(pub T, pub T, pub T);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec4<T>(pub T, pub T, pub T, pub T);

unsafe impl<T> bytemuck::Pod for Vec2<T> where T: bytemuck::Pod {}
unsafe impl<T> bytemuck::Pod for Vec3<T> where T: bytemuck::Pod {}
unsafe impl<T> bytemuck::Pod for Vec4<T> where T: bytemuck::Pod {}

unsafe impl<T> ocl::OclPrm for Vec2<T> where T: ocl::OclPrm {}
unsafe impl<T> ocl::OclPrm for Vec4<T> where T: ocl::OclPrm {}

static_assertions::assert_eq_size!(Vec2<f32>, [u8; 8]);
static_assertions::assert_eq_size!(Vec3<f32>, [u8; 12]);
static_assertions::assert_eq_size!(Vec4<f32>, [u8; 16]);
static_assertions::assert_eq_size!(Vec4<f64>, [u8; 32]);

#[inline(always)]
pub const fn vec2<T>(v0: T, v1: T) -> Vec2<T> {
    Vec2(v0, v1)
}

#[inline(always)]
pub const fn vec3<T>(v0: T, v1: T, v2: T) -> Vec3<T> {
    Vec3(v0, v1, v2)
}

#[inline(always)]
pub const fn vec4<T>(v0: T, v1: T, v2: T, v3: T) -> Vec4<T> {
    Vec4(v0, v1, v2, v3)
}

impl<T> Vec3<T>
where
    T: Default,
{
    /// Pad to the four-lane layout used in device buffers.
    pub fn vec4(self) -> Vec4<T> {
        Vec4(self.0, self.1, self.2, Default::default())
    }
}

impl<T: Copy> Vec4<T> {
    /// Drop the padding lane.
    pub fn vec3(self) -> Vec3<T> {
        Vec3(self.0, self.1, self.2)
    }
}

impl<T> Vec3<T>
where
    T: Copy + PartialOrd,
{
    /// Component-wise minimum.
    pub fn min(self, other: Self) -> Self {
        Vec3(
            if other.0 < self.0 { other.0 } else { self.0 },
            if other.1 < self.1 { other.1 } else { self.1 },
            if other.2 < self.2 { other.2 } else { self.2 },
        )
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Vec3(
            if other.0 > self.0 { other.0 } else { self.0 },
            if other.1 > self.1 { other.1 } else { self.1 },
            if other.2 > self.2 { other.2 } else { self.2 },
        )
    }
}

macro_rules! impl_binop {
    ($vec:ident { $($field:tt),+ }, $trait:ident, $method:ident) => {
        impl<T: $trait<Output = T>> $trait for $vec<T> {
            type Output = $vec<T>;

            fn $method(self, rhs: Self) -> Self::Output {
                $vec($(self.$field.$method(rhs.$field)),+)
            }
        }
    };
}

impl_binop!(Vec2 { 0, 1 }, Add, add);
impl_binop!(Vec2 { 0, 1 }, Sub, sub);
impl_binop!(Vec3 { 0, 1, 2 }, Add, add);
impl_binop!(Vec3 { 0, 1, 2 }, Sub, sub);
impl_binop!(Vec4 { 0, 1, 2, 3 }, Add, add);
impl_binop!(Vec4 { 0, 1, 2, 3 }, Sub, sub);

macro_rules! impl_scalar_op {
    ($vec:ident { $($field:tt),+ }, $trait:ident, $method:ident) => {
        impl<T: Copy + $trait<Output = T>> $trait<T> for $vec<T> {
            type Output = $vec<T>;

            fn $method(self, rhs: T) -> Self::Output {
                $vec($(self.$field.$method(rhs)),+)
            }
        }
    };
}

impl_scalar_op!(Vec3 { 0, 1, 2 }, Mul, mul);
impl_scalar_op!(Vec3 { 0, 1, 2 }, Div, div);

macro_rules! impl_index {
    ($vec:ident, $len:expr, [$($idx:expr => $field:tt),+]) => {
        impl<T> Index<usize> for $vec<T> {
            type Output = T;

            fn index(&self, index: usize) -> &T {
                match index {
                    $($idx => &self.$field,)+
                    _ => panic!("index {} out of bounds for {}", index, stringify!($vec)),
                }
            }
        }

        impl<T> IndexMut<usize> for $vec<T> {
            fn index_mut(&mut self, index: usize) -> &mut T {
                match index {
                    $($idx => &mut self.$field,)+
                    _ => panic!("index {} out of bounds for {}", index, stringify!($vec)),
                }
            }
        }
    };
}

impl_index!(Vec3, 3, [0 => 0, 1 => 1, 2 => 2]);
impl_index!(Vec4, 4, [0 => 0, 1 => 1, 2 => 2, 3 => 3]);
