//! The supplemental page table: for every user page of an address space,
//! where its contents currently come from.

use super::phys::FrameId;
use super::swap::SwapSlot;
use crate::fs::File;
use crate::{Result, VmError};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use clockwork_shared::mem::{VirtPage, PAGE_FRAME_SIZE};
use core::fmt;

/// Where the bytes of a file-backed page come from.
#[derive(Clone)]
pub struct FileBacking {
    /// Shared with whoever opened the file; the descriptor never closes it.
    pub file: Arc<dyn File>,
    pub offset: u64,
    /// Bytes read from `offset`.
    pub read_len: usize,
    /// Bytes zeroed after the `read_len` file bytes.
    pub zero_len: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_len", &self.read_len)
            .field("zero_len", &self.zero_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum PageState {
    /// Not yet touched; filled with zeros on first access.
    Zero,
    /// Not yet touched; read from a file on first access.
    File(FileBacking),
    /// Resident in a frame.
    Frame(FrameId),
    /// Evicted to a swap slot.
    Swap(SwapSlot),
}

#[derive(Debug, Clone)]
pub struct PageDescriptor {
    vpage: VirtPage,
    writable: bool,
    state: PageState,
}

impl PageDescriptor {
    pub fn vpage(&self) -> VirtPage {
        self.vpage
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn is_resident(&self) -> bool {
        self.frame().is_some()
    }

    /// The frame holding the page, if it is resident.
    pub fn frame(&self) -> Option<FrameId> {
        match self.state {
            PageState::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtPage, PageDescriptor>,
    /// Pages some thread is bringing into a frame right now.
    loading: BTreeSet<VirtPage>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, vpage: VirtPage, writable: bool, state: PageState) -> bool {
        if self.pages.contains_key(&vpage) {
            return false;
        }
        self.pages.insert(
            vpage,
            PageDescriptor {
                vpage,
                writable,
                state,
            },
        );
        true
    }

    /// Describes `vpage` as a zero-filled page. Returns `false` if `vpage`
    /// already has a descriptor.
    #[must_use]
    pub fn insert_zero(&mut self, vpage: VirtPage, writable: bool) -> bool {
        self.insert(vpage, writable, PageState::Zero)
    }

    /// Describes `vpage` as `read_len` bytes of `file` at `offset`, followed
    /// by `zero_len` zero bytes. Returns `false` if `vpage` already has a
    /// descriptor or the two lengths do not fit in one page.
    #[must_use]
    pub fn insert_file(
        &mut self,
        vpage: VirtPage,
        file: Arc<dyn File>,
        offset: u64,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) -> bool {
        if !matches!(read_len.checked_add(zero_len), Some(len) if len <= PAGE_FRAME_SIZE) {
            return false;
        }
        let backing = FileBacking {
            file,
            offset,
            read_len,
            zero_len,
        };
        self.insert(vpage, writable, PageState::File(backing))
    }

    /// `None` means the page is not part of the address space at all.
    pub fn lookup(&self, vpage: VirtPage) -> Option<&PageDescriptor> {
        self.pages.get(&vpage)
    }

    pub fn mark_resident(&mut self, vpage: VirtPage, frame: FrameId) -> Result<()> {
        let descriptor = self
            .pages
            .get_mut(&vpage)
            .ok_or(VmError::CorruptState("resident page has no descriptor"))?;
        descriptor.state = PageState::Frame(frame);
        Ok(())
    }

    /// Records that the resident `vpage` now lives in `slot`.
    pub fn mark_swapped(&mut self, vpage: VirtPage, slot: SwapSlot) -> Result<()> {
        let descriptor = self
            .pages
            .get_mut(&vpage)
            .ok_or(VmError::CorruptState("evicted page has no descriptor"))?;
        if !descriptor.is_resident() {
            return Err(VmError::CorruptState("evicted page was not resident"));
        }
        descriptor.state = PageState::Swap(slot);
        Ok(())
    }

    /// Claims `vpage` for the calling thread, which is about to bring it into
    /// a frame. Returns `false` if another thread already holds the claim.
    #[must_use]
    pub fn begin_load(&mut self, vpage: VirtPage) -> bool {
        self.loading.insert(vpage)
    }

    /// Gives up the claim taken by [`Self::begin_load`], whether or not the
    /// page made it into a frame.
    pub fn finish_load(&mut self, vpage: VirtPage) {
        self.loading.remove(&vpage);
    }

    pub fn is_loading(&self, vpage: VirtPage) -> bool {
        self.loading.contains(&vpage)
    }

    /// Forgets `vpage`. The frame or swap slot it refers to, if any, must
    /// already have been released by the caller.
    pub fn remove(&mut self, vpage: VirtPage) -> Option<PageDescriptor> {
        self.pages.remove(&vpage)
    }

    /// Forgets every page. Same caveat as [`Self::remove`].
    pub fn destroy(&mut self) {
        self.pages.clear();
        self.loading.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFile;
    use alloc::vec;

    fn page(addr: usize) -> VirtPage {
        VirtPage::from_aligned(addr).unwrap()
    }

    #[test]
    fn one_descriptor_per_page() {
        let mut spt = SupplementalPageTable::new();
        let file: Arc<dyn File> = Arc::new(MemoryFile::new(b"abc".to_vec()));
        assert!(spt.insert_zero(page(0x1000), true));
        assert!(!spt.insert_zero(page(0x1000), false));
        assert!(!spt.insert_file(page(0x1000), Arc::clone(&file), 0, 3, 4093, false));
        assert!(spt.insert_file(page(0x2000), file, 0, 3, 4093, false));
        assert_eq!(spt.len(), 2);

        let descriptor = spt.lookup(page(0x1000)).unwrap();
        assert!(descriptor.writable());
        assert!(matches!(descriptor.state(), PageState::Zero));
        let descriptor = spt.lookup(page(0x2000)).unwrap();
        assert!(!descriptor.writable());
        assert!(matches!(
            descriptor.state(),
            PageState::File(FileBacking { read_len: 3, zero_len: 4093, .. })
        ));
        assert!(spt.lookup(page(0x3000)).is_none());
    }

    #[test]
    fn file_lengths_must_fit_in_a_page() {
        let mut spt = SupplementalPageTable::new();
        let file: Arc<dyn File> = Arc::new(MemoryFile::new(vec![7; 2 * PAGE_FRAME_SIZE]));
        assert!(!spt.insert_file(page(0x1000), Arc::clone(&file), 0, PAGE_FRAME_SIZE + 1, 0, true));
        assert!(!spt.insert_file(page(0x1000), Arc::clone(&file), 0, 100, PAGE_FRAME_SIZE, true));
        assert!(!spt.insert_file(page(0x1000), Arc::clone(&file), 0, usize::MAX, 1, true));
        assert!(spt.is_empty());
        assert!(spt.insert_file(page(0x1000), file, 0, PAGE_FRAME_SIZE, 0, true));
    }

    #[test]
    fn one_loader_per_page() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert_zero(page(0x1000), true));
        assert!(spt.begin_load(page(0x1000)));
        assert!(!spt.begin_load(page(0x1000)));
        assert!(spt.is_loading(page(0x1000)));
        assert!(!spt.is_loading(page(0x2000)));

        spt.finish_load(page(0x1000));
        assert!(!spt.is_loading(page(0x1000)));
        assert!(spt.begin_load(page(0x1000)));
        spt.destroy();
        assert!(!spt.is_loading(page(0x1000)));
    }

    #[test]
    fn resident_then_swapped() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert_zero(page(0x1000), true));

        // Only a resident page can be swapped out.
        assert!(spt.mark_swapped(page(0x1000), SwapSlot::new(0)).is_err());

        spt.mark_resident(page(0x1000), FrameId::new(4)).unwrap();
        assert!(spt.lookup(page(0x1000)).unwrap().is_resident());

        spt.mark_swapped(page(0x1000), SwapSlot::new(2)).unwrap();
        assert!(matches!(
            spt.lookup(page(0x1000)).unwrap().state(),
            PageState::Swap(slot) if *slot == SwapSlot::new(2)
        ));
        // Writability survives state changes.
        assert!(spt.lookup(page(0x1000)).unwrap().writable());
    }

    #[test]
    fn missing_pages_are_corrupt_state() {
        let mut spt = SupplementalPageTable::new();
        assert!(matches!(
            spt.mark_resident(page(0x1000), FrameId::new(0)),
            Err(VmError::CorruptState(_))
        ));
        assert!(matches!(
            spt.mark_swapped(page(0x1000), SwapSlot::new(0)),
            Err(VmError::CorruptState(_))
        ));
    }

    #[test]
    fn remove_and_destroy() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert_zero(page(0x1000), true));
        assert!(spt.insert_zero(page(0x2000), true));
        assert!(spt.remove(page(0x1000)).is_some());
        assert!(spt.remove(page(0x1000)).is_none());
        spt.destroy();
        assert!(spt.is_empty());
    }
}
