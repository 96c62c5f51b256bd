//! Frame acquisition and release, with eviction when the pool runs dry.

use super::address_space::AddressSpaceId;
use super::evict::Evictor;
use super::frame_table::{FrameTable, FrameTableEntry};
use super::phys::FrameId;
use crate::paging::PageTableOps;
use crate::sync::Mutex;
use crate::{Result, VmError};
use alloc::{sync::Arc, vec::Vec};
use clockwork_shared::mem::VirtPage;
use log::{debug, trace};

/// The single owner of the frame table.
///
/// One lock covers the table, the clock hand and every eviction, so at most
/// one eviction runs system-wide and acquiring, releasing and evicting never
/// observe each other half done.
pub struct FrameAllocator {
    table: Mutex<FrameTable>,
    page_tables: Arc<dyn PageTableOps>,
    evictor: Evictor,
}

impl FrameAllocator {
    pub fn new(capacity: usize, page_tables: Arc<dyn PageTableOps>, evictor: Evictor) -> Self {
        Self {
            table: Mutex::new(FrameTable::new(capacity)),
            page_tables,
            evictor,
        }
    }

    /// Gets a frame for `vpage` of `owner`, evicting another page if no frame
    /// is free.
    ///
    /// The frame comes back pinned; the caller unpins it once the page is
    /// filled and mapped.
    pub fn acquire(&self, owner: AddressSpaceId, vpage: VirtPage) -> Result<FrameId> {
        let mut table = self.table.lock();
        if let Some(frame) = table.register(owner, vpage) {
            trace!("acquire: {frame:?} for {vpage:?} of {owner}");
            return Ok(frame);
        }

        self.evictor.evict(&mut table)?;
        let frame = table.register(owner, vpage).ok_or(VmError::OutOfMemory)?;
        trace!("acquire: {frame:?} for {vpage:?} of {owner} after eviction");
        Ok(frame)
    }

    /// Unmaps `frame` from its owner and returns it to the pool.
    pub fn release(&self, frame: FrameId) -> Result<()> {
        let mut table = self.table.lock();
        let entry = *table
            .get(frame)
            .ok_or(VmError::CorruptState("releasing a frame that is not registered"))?;
        self.page_tables.clear(entry.owner, entry.vpage);
        table.unregister(frame)?;
        Ok(())
    }

    /// Returns `frame` to the pool without touching any mapping, for a frame
    /// whose page never got installed. The page may be mapped to some other
    /// frame, and that mapping must survive.
    pub fn abandon(&self, frame: FrameId) -> Result<()> {
        self.table.lock().unregister(frame)?;
        Ok(())
    }

    /// Releases every frame owned by `owner` and returns how many there were.
    pub fn release_owner(&self, owner: AddressSpaceId) -> Result<usize> {
        let mut table = self.table.lock();
        let frames = table.frames_of(owner);
        for &frame in &frames {
            if let Some(entry) = table.get(frame) {
                self.page_tables.clear(entry.owner, entry.vpage);
            }
            table.unregister(frame)?;
        }
        debug!("release: {} frames of {owner}", frames.len());
        Ok(frames.len())
    }

    pub fn pin(&self, frame: FrameId) -> Result<()> {
        self.table.lock().set_pinned(frame, true)
    }

    pub fn unpin(&self, frame: FrameId) -> Result<()> {
        self.table.lock().set_pinned(frame, false)
    }

    /// Runs `f` with the frame table locked, so no frame is acquired,
    /// released or evicted while it runs.
    pub fn serialize<R>(&self, f: impl FnOnce() -> R) -> R {
        let _table = self.table.lock();
        f()
    }

    pub fn resident_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().capacity()
    }

    /// A snapshot of every registered frame.
    pub fn entries(&self) -> Vec<(FrameId, FrameTableEntry)> {
        self.table
            .lock()
            .iter()
            .map(|(frame, entry)| (frame, *entry))
            .collect()
    }
}
