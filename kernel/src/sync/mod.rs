pub mod holder;
pub mod mutex;

pub use holder::{HolderLock, HolderLockGuard};
pub use mutex::{Mutex, MutexGuard};
