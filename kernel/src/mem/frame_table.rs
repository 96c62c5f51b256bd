//! Which user page each physical frame currently holds.

use super::address_space::AddressSpaceId;
use super::phys::{FrameId, FramePool};
use crate::{Result, VmError};
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;
use clockwork_shared::mem::VirtPage;
use core::fmt;

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    /// Pinned frames are being filled, or are otherwise in transition, and
    /// must not be picked by the evictor.
    #[bit(0, rw)]
    pinned: bool,
}

#[derive(Clone, Copy)]
pub struct FrameTableEntry {
    pub owner: AddressSpaceId,
    pub vpage: VirtPage,
    flags: FrameFlags,
}

impl FrameTableEntry {
    pub fn pinned(&self) -> bool {
        self.flags.pinned()
    }
}

impl fmt::Debug for FrameTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTableEntry")
            .field("owner", &self.owner)
            .field("vpage", &self.vpage)
            .field("pinned", &self.pinned())
            .finish()
    }
}

/// The frame table, indexed by frame id.
///
/// Entries are created only by [`FrameTable::register`] and destroyed only by
/// [`FrameTable::unregister`], and the slot of a frame is never shared, so a
/// frame id can appear in at most one entry.
pub struct FrameTable {
    entries: Box<[Option<FrameTableEntry>]>,
    pool: FramePool,
    /// Position of the clock hand used by the evictor.
    pub(super) clock_hand: usize,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity].into_boxed_slice(),
            pool: FramePool::new(capacity),
            clock_hand: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of registered frames.
    pub fn len(&self) -> usize {
        self.pool.frames_allocated()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes a free frame from the pool and records it as holding `vpage`
    /// of `owner`. The new entry starts out pinned.
    pub fn register(&mut self, owner: AddressSpaceId, vpage: VirtPage) -> Option<FrameId> {
        let frame = self.pool.get_page()?;
        self.entries[frame.index()] = Some(FrameTableEntry {
            owner,
            vpage,
            flags: FrameFlags::DEFAULT.with_pinned(true),
        });
        Some(frame)
    }

    /// Removes the entry for `frame` and returns the frame to the pool.
    pub fn unregister(&mut self, frame: FrameId) -> Result<FrameTableEntry> {
        let entry = self
            .entries
            .get_mut(frame.index())
            .and_then(Option::take)
            .ok_or(VmError::CorruptState("frame is not registered"))?;
        self.pool.free_page(frame)?;
        Ok(entry)
    }

    pub fn get(&self, frame: FrameId) -> Option<&FrameTableEntry> {
        self.entries.get(frame.index())?.as_ref()
    }

    pub fn set_pinned(&mut self, frame: FrameId, pinned: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(frame.index())
            .and_then(Option::as_mut)
            .ok_or(VmError::CorruptState("pinning a frame that is not registered"))?;
        entry.flags = entry.flags.with_pinned(pinned);
        Ok(())
    }

    /// Every frame held by `owner`.
    pub fn frames_of(&self, owner: AddressSpaceId) -> Vec<FrameId> {
        self.iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(frame, _)| frame)
            .collect()
    }

    /// Registered frames in frame id order.
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &FrameTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| Some((FrameId::new(index), entry.as_ref()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: AddressSpaceId = AddressSpaceId::new(1);

    fn page(n: usize) -> VirtPage {
        VirtPage::containing(n * 4096)
    }

    #[test]
    fn register_until_full() {
        let mut table = FrameTable::new(3);
        let frames: Vec<_> = (0..3)
            .map(|n| table.register(OWNER, page(n)).unwrap())
            .collect();
        assert_eq!(table.len(), 3);
        assert!(table.register(OWNER, page(3)).is_none());

        let mut indices: Vec<_> = frames.iter().map(|frame| frame.index()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 3);

        for (n, frame) in frames.iter().enumerate() {
            let entry = table.get(*frame).unwrap();
            assert_eq!(entry.vpage, page(n));
            assert!(entry.pinned());
        }
    }

    #[test]
    fn unregister_frees_the_frame() {
        let mut table = FrameTable::new(1);
        let frame = table.register(OWNER, page(0)).unwrap();
        let entry = table.unregister(frame).unwrap();
        assert_eq!(entry.owner, OWNER);
        assert!(table.is_empty());
        assert!(table.get(frame).is_none());
        assert!(table.unregister(frame).is_err());
        assert_eq!(table.register(OWNER, page(1)), Some(frame));
    }

    #[test]
    fn pin_and_unpin() {
        let mut table = FrameTable::new(2);
        let frame = table.register(OWNER, page(0)).unwrap();
        table.set_pinned(frame, false).unwrap();
        assert!(!table.get(frame).unwrap().pinned());
        table.set_pinned(frame, true).unwrap();
        assert!(table.get(frame).unwrap().pinned());
        assert!(table.set_pinned(FrameId::new(1), true).is_err());
        assert!(table.set_pinned(FrameId::new(7), true).is_err());
    }

    #[test]
    fn frames_of_filters_by_owner() {
        let other = AddressSpaceId::new(2);
        let mut table = FrameTable::new(4);
        let a = table.register(OWNER, page(0)).unwrap();
        let b = table.register(other, page(0)).unwrap();
        let c = table.register(OWNER, page(1)).unwrap();
        assert_eq!(table.frames_of(OWNER), vec![a, c]);
        assert_eq!(table.frames_of(other), vec![b]);
        assert_eq!(table.iter().count(), 3);
    }

    #[test]
    fn zero_capacity_table() {
        let mut table = FrameTable::new(0);
        assert!(table.register(OWNER, page(0)).is_none());
        assert_eq!(table.capacity(), 0);
    }
}
