//! Page-sized slots on the swap device.

use crate::dev::block::{BlockDevice, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use crate::{Result, VmError};
use alloc::sync::Arc;
use bitvec::{bitvec, order::Lsb0, vec::BitVec};
use clockwork_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    /// One bit per slot, set while the slot holds an evicted page.
    occupied: Mutex<BitVec<usize, Lsb0>>,
}

impl SwapStore {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() as usize / SECTORS_PER_PAGE;
        info!("swap: {slot_count} slots");
        Self {
            device,
            occupied: Mutex::new(bitvec![usize, Lsb0; 0; slot_count]),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.occupied.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.occupied.lock().count_zeros()
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        self.occupied
            .lock()
            .get(slot.index())
            .is_some_and(|bit| *bit)
    }

    /// Writes `page` to a free slot and returns the slot.
    ///
    /// The slot is claimed before the write starts, so no other eviction can
    /// pick it while the device is busy.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot> {
        if page.len() != PAGE_FRAME_SIZE {
            return Err(VmError::CorruptState("swapping out a partial page"));
        }

        let slot = {
            let mut occupied = self.occupied.lock();
            let index = occupied.first_zero().ok_or(VmError::SwapExhausted)?;
            occupied.set(index, true);
            SwapSlot(index)
        };

        for (sector, data) in (slot.first_sector()..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            self.device.write_sector(sector, data);
        }

        debug!("swap: wrote slot {}", slot.index());
        Ok(slot)
    }

    /// Reads the page in `slot` into `dest` and frees the slot.
    ///
    /// The slot stays claimed until the read has finished, so it cannot be
    /// handed to a concurrent [`Self::swap_out`] and overwritten mid-read.
    pub fn swap_in(&self, slot: SwapSlot, dest: &mut [u8]) -> Result<()> {
        if dest.len() != PAGE_FRAME_SIZE {
            return Err(VmError::CorruptState("swapping into a partial page"));
        }
        self.check_occupied(slot)?;

        for (sector, data) in (slot.first_sector()..).zip(dest.chunks_exact_mut(BLOCK_SECTOR_SIZE))
        {
            self.device.read_sector(sector, data);
        }

        self.occupied.lock().set(slot.index(), false);
        debug!("swap: read and freed slot {}", slot.index());
        Ok(())
    }

    /// Frees `slot` without reading it, for pages whose address space is
    /// being torn down.
    pub fn discard(&self, slot: SwapSlot) -> Result<()> {
        let mut occupied = self.occupied.lock();
        match occupied.get(slot.index()).map(|bit| *bit) {
            Some(true) => {
                occupied.set(slot.index(), false);
                Ok(())
            }
            Some(false) => Err(VmError::CorruptState("swap slot is already free")),
            None => Err(VmError::CorruptState("swap slot out of range")),
        }
    }

    fn check_occupied(&self, slot: SwapSlot) -> Result<()> {
        match self.occupied.lock().get(slot.index()).map(|bit| *bit) {
            Some(true) => Ok(()),
            Some(false) => Err(VmError::CorruptState("reading a free swap slot")),
            None => Err(VmError::CorruptState("swap slot out of range")),
        }
    }
}
