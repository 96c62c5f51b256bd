//! Second-chance (clock) page replacement.

use super::address_space::AddressSpaces;
use super::frame_table::FrameTable;
use super::phys::{FrameId, PhysicalMemory};
use super::swap::SwapStore;
use crate::paging::PageTableOps;
use crate::{Result, VmError};
use alloc::sync::Arc;
use log::{debug, warn};

/// Picks the frame to evict.
///
/// The clock hand sweeps the frame table, skipping empty slots and pinned
/// frames. A frame whose page was accessed since the last sweep gets its
/// accessed bit cleared and a second chance; the first frame found with the
/// bit clear is the victim, and the hand is left just past it.
///
/// The first lap clears every accessed bit it passes, so two laps are enough
/// to find a victim whenever any frame is unpinned. Returns `None` if the
/// table is empty or every frame is pinned.
pub fn select_victim(table: &mut FrameTable, page_tables: &dyn PageTableOps) -> Option<FrameId> {
    let capacity = table.capacity();
    if capacity == 0 {
        return None;
    }

    for _ in 0..2 * capacity {
        let frame = FrameId::new(table.clock_hand);
        table.clock_hand = (table.clock_hand + 1) % capacity;

        let Some(entry) = table.get(frame).filter(|entry| !entry.pinned()) else {
            continue;
        };
        if page_tables.is_accessed(entry.owner, entry.vpage) {
            page_tables.clear_accessed(entry.owner, entry.vpage);
        } else {
            return Some(frame);
        }
    }

    None
}

/// Moves resident pages out to swap to make room for new ones.
pub struct Evictor {
    page_tables: Arc<dyn PageTableOps>,
    swap: Arc<SwapStore>,
    memory: Arc<PhysicalMemory>,
    spaces: Arc<AddressSpaces>,
}

impl Evictor {
    pub fn new(
        page_tables: Arc<dyn PageTableOps>,
        swap: Arc<SwapStore>,
        memory: Arc<PhysicalMemory>,
        spaces: Arc<AddressSpaces>,
    ) -> Self {
        Self {
            page_tables,
            swap,
            memory,
            spaces,
        }
    }

    /// Evicts one page and returns the frame it occupied, which is back in
    /// the free pool when this returns.
    ///
    /// The caller holds the frame table lock for the whole call, swap I/O
    /// included, so only one eviction runs at a time.
    pub fn evict(&self, table: &mut FrameTable) -> Result<FrameId> {
        let Some(victim) = select_victim(table, &*self.page_tables) else {
            warn!("evict: no unpinned frame among {}", table.len());
            return Err(VmError::OutOfMemory);
        };
        let entry = *table
            .get(victim)
            .ok_or(VmError::CorruptState("victim frame is not registered"))?;
        let space = self
            .spaces
            .get(entry.owner)
            .ok_or(VmError::CorruptState("frame owned by an unknown address space"))?;

        let mut spt = space.spt();
        let writable = match spt.lookup(entry.vpage) {
            Some(descriptor) if descriptor.frame() == Some(victim) => descriptor.writable(),
            _ => {
                return Err(VmError::CorruptState(
                    "registered frame has no matching descriptor",
                ))
            }
        };

        // Unmap first so the owner faults instead of writing to the frame
        // while it is copied out.
        self.page_tables.clear(entry.owner, entry.vpage);
        let swapped = self
            .memory
            .with_frame(victim, |bytes| self.swap.swap_out(bytes))
            .and_then(|result| result);
        let slot = match swapped {
            Ok(slot) => slot,
            Err(err) => {
                if !self
                    .page_tables
                    .install(entry.owner, entry.vpage, victim, writable)
                {
                    return Err(VmError::CorruptState("victim remapped during eviction"));
                }
                warn!("evict: swap out of {:?} failed: {err}", entry.vpage);
                return Err(err);
            }
        };

        spt.mark_swapped(entry.vpage, slot)?;
        drop(spt);
        table.unregister(victim)?;

        debug!(
            "evict: {:?} of {} from {victim:?} to slot {}",
            entry.vpage,
            entry.owner,
            slot.index()
        );
        Ok(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::address_space::AddressSpaceId;
    use crate::sync::Mutex;
    use alloc::collections::BTreeSet;
    use clockwork_shared::mem::VirtPage;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Page tables that only track accessed bits and count how often they
    /// are read.
    #[derive(Default)]
    struct AccessedBits {
        accessed: Mutex<BTreeSet<(AddressSpaceId, VirtPage)>>,
        probes: AtomicUsize,
    }

    impl AccessedBits {
        fn touch(&self, owner: AddressSpaceId, vpage: VirtPage) {
            self.accessed.lock().insert((owner, vpage));
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::Relaxed)
        }
    }

    impl PageTableOps for AccessedBits {
        fn install(&self, _: AddressSpaceId, _: VirtPage, _: FrameId, _: bool) -> bool {
            true
        }

        fn clear(&self, _: AddressSpaceId, _: VirtPage) {}

        fn is_accessed(&self, owner: AddressSpaceId, vpage: VirtPage) -> bool {
            self.probes.fetch_add(1, Ordering::Relaxed);
            self.accessed.lock().contains(&(owner, vpage))
        }

        fn clear_accessed(&self, owner: AddressSpaceId, vpage: VirtPage) {
            self.accessed.lock().remove(&(owner, vpage));
        }
    }

    const OWNER: AddressSpaceId = AddressSpaceId::new(1);

    fn page(n: usize) -> VirtPage {
        VirtPage::containing(0x0804_8000 + n * 4096)
    }

    fn unpinned_table(frames: usize) -> FrameTable {
        let mut table = FrameTable::new(frames);
        for n in 0..frames {
            let frame = table.register(OWNER, page(n)).unwrap();
            table.set_pinned(frame, false).unwrap();
        }
        table
    }

    #[test]
    fn untouched_frame_is_picked_first() {
        let bits = AccessedBits::default();
        let mut table = unpinned_table(4);
        bits.touch(OWNER, page(0));
        bits.touch(OWNER, page(1));

        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(2)));
        assert_eq!(bits.probes(), 3);
        // The skipped pages lost their second chance.
        assert!(bits.accessed.lock().is_empty());
        assert_eq!(table.clock_hand, 3);
    }

    #[test]
    fn hand_moves_on_after_each_pick() {
        let bits = AccessedBits::default();
        let mut table = unpinned_table(3);
        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(0)));
        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(1)));
        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(2)));
        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(0)));
    }

    #[test]
    fn all_accessed_terminates_within_two_laps() {
        let bits = AccessedBits::default();
        let frames = 8;
        let mut table = unpinned_table(frames);
        for n in 0..frames {
            bits.touch(OWNER, page(n));
        }
        table.clock_hand = 5;

        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(5)));
        assert!(bits.probes() <= 2 * frames);
        assert_eq!(bits.probes(), frames + 1);
    }

    #[test]
    fn pinned_frames_are_never_picked() {
        let bits = AccessedBits::default();
        let mut table = unpinned_table(4);
        for n in [0, 1, 3] {
            table.set_pinned(FrameId::new(n), true).unwrap();
        }
        bits.touch(OWNER, page(2));

        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(2)));
        // Pinned frames are skipped without looking at their accessed bit.
        assert_eq!(bits.probes(), 2);
    }

    #[test]
    fn fully_pinned_or_empty_table_has_no_victim() {
        let bits = AccessedBits::default();
        let mut table = FrameTable::new(3);
        assert_eq!(select_victim(&mut table, &bits), None);

        for n in 0..3 {
            table.register(OWNER, page(n)).unwrap();
        }
        assert_eq!(select_victim(&mut table, &bits), None);
        assert_eq!(bits.probes(), 0);

        assert_eq!(select_victim(&mut FrameTable::new(0), &bits), None);
    }

    #[test]
    fn holes_in_the_table_are_skipped() {
        let bits = AccessedBits::default();
        let mut table = unpinned_table(4);
        table.unregister(FrameId::new(0)).unwrap();
        table.unregister(FrameId::new(1)).unwrap();
        assert_eq!(select_victim(&mut table, &bits), Some(FrameId::new(2)));
        assert_eq!(bits.probes(), 1);
    }
}
