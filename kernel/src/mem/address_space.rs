use super::spt::SupplementalPageTable;
use crate::sync::{Mutex, MutexGuard};
use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

pub type Tid = u16;

/// Opaque handle naming an address space.
///
/// Frame table entries refer to their owner by id, never by pointer, so a
/// frame table entry cannot outlive the space it points at unnoticed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A user address space: its id and its supplemental page table.
pub struct AddressSpace {
    id: AddressSpaceId,
    spt: Mutex<SupplementalPageTable>,
}

impl AddressSpace {
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Locks the supplemental page table.
    ///
    /// Lock order: the frame table lock, if needed, must be taken first.
    pub fn spt(&self) -> MutexGuard<SupplementalPageTable> {
        self.spt.lock()
    }
}

/// Every live address space, by id.
pub struct AddressSpaces {
    next_id: AtomicU32,
    spaces: Mutex<BTreeMap<AddressSpaceId, Arc<AddressSpace>>>,
}

impl AddressSpaces {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    /// Creates and registers an empty address space.
    pub fn create(&self) -> Arc<AddressSpace> {
        let id = AddressSpaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let space = Arc::new(AddressSpace {
            id,
            spt: Mutex::new(SupplementalPageTable::new()),
        });
        self.spaces.lock().insert(id, Arc::clone(&space));
        space
    }

    pub fn get(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.spaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddressSpaces {
    fn default() -> Self {
        Self::new()
    }
}

/// The thread a fault is resolved for, and the address space it runs in.
#[derive(Clone)]
pub struct ExecutionContext {
    pub tid: Tid,
    pub space: Arc<AddressSpace>,
}

impl ExecutionContext {
    pub fn new(tid: Tid, space: Arc<AddressSpace>) -> Self {
        Self { tid, space }
    }
}
