//! Axis-aligned bounding boxes on the host side.
//!
//! The device pipeline keeps per-node bounds in its own buffers; this type
//! backs the host-facing surface and the brute-force references in tests.

use crate::dtype::CoordScalar;
use crate::vector::{vec3, Vec3};

/// Axis aligned bounding box, a `(min, max)` pair of 3-vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb<T: CoordScalar> {
    pub min: Vec3<T>,
    pub max: Vec3<T>,
}

impl<T: CoordScalar> Aabb<T> {
    /// An empty box: any point or box included into it becomes the bound.
    pub fn empty() -> Self {
        Self {
            min: vec3(T::INFINITY, T::INFINITY, T::INFINITY),
            max: vec3(T::NEG_INFINITY, T::NEG_INFINITY, T::NEG_INFINITY),
        }
    }

    /// The box of a sphere: `[center - radius, center + radius]` per axis.
    pub fn from_sphere(center: Vec3<T>, radius: T) -> Self {
        let r = vec3(radius, radius, radius);
        Self {
            min: center - r,
            max: center + r,
        }
    }

    /// Grow to include the given point.
    pub fn include_point(&mut self, p: Vec3<T>) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grow to include the other box.
    pub fn include(&mut self, other: &Self) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Strict overlap test: touching faces do not count as overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.0 < other.max.0
            && other.min.0 < self.max.0
            && self.min.1 < other.max.1
            && other.min.1 < self.max.1
            && self.min.2 < other.max.2
            && other.min.2 < self.max.2
    }
}
