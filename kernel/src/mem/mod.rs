//! Demand paging: where each user page lives, and moving it between memory,
//! files and swap.

pub mod address_space;
pub mod evict;
pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod phys;
pub mod spt;
pub mod swap;

pub use address_space::{AddressSpace, AddressSpaceId, AddressSpaces, ExecutionContext, Tid};
pub use fault::{FaultAttributes, PageFaultResolver};
pub use frame_allocator::FrameAllocator;
pub use frame_table::{FrameTable, FrameTableEntry};
pub use phys::{FrameId, Page, PhysicalMemory};
pub use spt::{FileBacking, PageDescriptor, PageState, SupplementalPageTable};
pub use swap::{SwapSlot, SwapStore};
