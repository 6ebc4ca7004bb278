//! GPU broad-phase collision detection.
//!
//! Finds all axis-aligned bounding-box overlaps among a set of spheres,
//! entirely on an OpenCL device: a reduction computes the scene bounds,
//! sphere centers are Morton-encoded and radix sorted, a linear BVH is
//! built over the sorted order, and a stackless traversal enumerates the
//! overlapping pairs. The building blocks (prefix scan, reduction, radix
//! sort, gather/scatter, offset search) are exposed on their own.
//!
//! ```no_run
//! use collide::{device::ClHandles, Collider, CollisionPair};
//! use ocl::Buffer;
//!
//! # fn main() -> collide::Result<()> {
//! let handles = ClHandles::new()?;
//! let mut collider = Collider::<f32>::new(&handles.context, 1024, 32, 64)?;
//!
//! // Centers are packed four scalars per sphere, lane 3 unused.
//! let coords = Buffer::<f32>::builder()
//!     .queue(handles.queue.clone())
//!     .len(1024 * 4)
//!     .build()?;
//! let radii = Buffer::<f32>::builder()
//!     .queue(handles.queue.clone())
//!     .len(1024)
//!     .build()?;
//! let count = Buffer::<u32>::builder()
//!     .queue(handles.queue.clone())
//!     .len(1)
//!     .build()?;
//! let pairs = Buffer::<CollisionPair>::builder()
//!     .queue(handles.queue.clone())
//!     .len(4096)
//!     .build()?;
//!
//! let done = collider.get_collisions(
//!     &handles.queue, &coords, &radii, &count, Some(&pairs), 4096, None,
//! )?;
//! done.wait_for()?;
//! # Ok(())
//! # }
//! ```

pub mod aabb;
pub mod collider;
pub mod device;
pub mod dtype;
mod error;
pub mod index;
pub mod offset;
mod program;
pub mod radix;
pub mod reduce;
pub mod scan;
pub mod vector;

pub use aabb::Aabb;
pub use collider::{Collider, CollisionPair, CollisionProgram, Node};
pub use error::{Error, Result};
pub use index::Indexer;
pub use offset::OffsetFinder;
pub use radix::RadixSorter;
pub use reduce::Reducer;
pub use scan::PrefixScanner;
