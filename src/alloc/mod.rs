//! alloc: bitmap regions and the size-class allocator of the object heap.

pub mod composite;
pub mod persist;
pub mod region;

pub use composite::{CompositeAllocator, SizeClass};
pub use region::RegionBitmap;
