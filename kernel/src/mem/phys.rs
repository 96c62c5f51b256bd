//! Physical frames handed out to user pages.

use crate::sync::Mutex;
use crate::{Result, VmError};
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;
use clockwork_shared::mem::PAGE_FRAME_SIZE;
use core::fmt;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Page table entries address frames with 20 bits.
pub const MAX_FRAMES: usize = 1 << 20;

/// Index of a physical frame in the user pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// The contents of one frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Page([u8; PAGE_FRAME_SIZE]);

/// Backing memory for every frame in the user pool.
///
/// Each frame's bytes sit behind their own lock so a fault can fill its
/// (pinned) frame while the frame table is busy with other frames.
pub struct PhysicalMemory {
    frames: Box<[Mutex<Page>]>,
}

impl PhysicalMemory {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= MAX_FRAMES,
            "{capacity} frames cannot be addressed by a page table entry"
        );
        let frames: Vec<Mutex<Page>> = (0..capacity)
            .map(|_| Mutex::new(Page::new_zeroed()))
            .collect();
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Runs `f` on the bytes of `frame`.
    pub fn with_frame<R>(&self, frame: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let page = self
            .frames
            .get(frame.index())
            .ok_or(VmError::CorruptState("frame id outside physical memory"))?;
        Ok(f(page.lock().as_bytes_mut()))
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The allocation map of the user pool, with next-fit placement: the search
/// for a free frame starts where the previous one left off.
pub struct FramePool {
    core_map: Box<[CoreMapEntry]>,
    /// The next frame number to start searching for free frames.
    position: usize,
    frames_allocated: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            core_map: vec![CoreMapEntry::DEFAULT; capacity].into_boxed_slice(),
            position: 0,
            frames_allocated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn get_page(&mut self) -> Option<FrameId> {
        let total_frames = self.core_map.len();
        if self.frames_allocated == total_frames {
            return None;
        }

        let index = (0..total_frames)
            .map(|step| (self.position + step) % total_frames)
            .find(|&index| !self.core_map[index].allocated())?;

        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.position = (index + 1) % total_frames;
        self.frames_allocated += 1;
        Some(FrameId(index))
    }

    pub fn free_page(&mut self, frame: FrameId) -> Result<()> {
        let index = frame.index();
        match self.core_map.get(index).copied() {
            Some(entry) if entry.allocated() => {
                self.core_map[index] = entry.with_allocated(false);
                self.frames_allocated -= 1;
                Ok(())
            }
            _ => Err(VmError::CorruptState("freeing a frame that is not allocated")),
        }
    }
}
