//! Memory management: guest memory access and the fixed-capacity
//! allocators used for backend data cells and request ids.

pub mod allocator;
pub mod guest;

pub use allocator::{CellAllocator, IndexAllocator};
pub use guest::{GuestMemory, MappedRegion};
