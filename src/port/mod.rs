//! Public port pool.

mod allocator;

pub use allocator::{PortAllocator, PortOwner, PortUsage};
