//! Page-table primitives used by the paging subsystem.
//!
//! The subsystem only ever needs four operations on a page table, all keyed
//! by the owning address space and a user page. [`SoftPageTables`] keeps real
//! x86 page table entries in kernel memory and plays the part of the MMU for
//! machines (and tests) without paging hardware behind them.

#![allow(clippy::cast_possible_truncation)]

use crate::mem::{address_space::AddressSpaceId, phys::FrameId};
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::u20;
use clockwork_shared::mem::{page_offset, VirtPage};
use clockwork_shared::paging::{PageTable, PageTableEntry, VirtualAddress};

pub trait PageTableOps: Send + Sync {
    /// Maps `vpage` to `frame` in `owner`'s page table.
    ///
    /// Returns `false`, leaving the table untouched, if `vpage` is already
    /// mapped.
    #[must_use]
    fn install(&self, owner: AddressSpaceId, vpage: VirtPage, frame: FrameId, writable: bool)
        -> bool;

    /// Removes the mapping for `vpage`, if any.
    fn clear(&self, owner: AddressSpaceId, vpage: VirtPage);

    /// Whether `vpage` has been accessed since its accessed bit was last
    /// cleared. Unmapped pages report `false`.
    fn is_accessed(&self, owner: AddressSpaceId, vpage: VirtPage) -> bool;

    fn clear_accessed(&self, owner: AddressSpaceId, vpage: VirtPage);

    /// Drops the whole page table of `owner` once its address space is gone.
    fn forget(&self, _owner: AddressSpaceId) {}
}

/// A two-level page directory kept in kernel memory. Page tables are
/// allocated the first time a page in their 4 MB range is mapped.
#[derive(Default)]
struct PageDirectory {
    tables: BTreeMap<u16, Box<PageTable>>,
}

fn split(vpage: VirtPage) -> (u16, usize) {
    let addr = VirtualAddress::new_with_raw_value(vpage.addr() as u32);
    (
        addr.page_directory_index().value(),
        usize::from(addr.page_table_index().value()),
    )
}

impl PageDirectory {
    fn entry(&self, vpage: VirtPage) -> Option<PageTableEntry> {
        let (directory_index, table_index) = split(vpage);
        self.tables
            .get(&directory_index)
            .map(|table| table[table_index])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, vpage: VirtPage) -> &mut PageTableEntry {
        let (directory_index, table_index) = split(vpage);
        &mut self.tables.entry(directory_index).or_default()[table_index]
    }

    fn mapped_pages(&self) -> usize {
        self.tables
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }
}

#[derive(Default)]
pub struct SoftPageTables {
    directories: Mutex<BTreeMap<AddressSpaceId, PageDirectory>>,
}

impl SoftPageTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates a user access the way the MMU would: `None` if the page is
    /// not present or a write hits a read-only page, otherwise the frame and
    /// the offset within it. A successful access sets the accessed bit, and
    /// the dirty bit for writes.
    pub fn translate(
        &self,
        owner: AddressSpaceId,
        address: usize,
        write: bool,
    ) -> Option<(FrameId, usize)> {
        let vpage = VirtPage::containing(address);
        let mut directories = self.directories.lock();
        let directory = directories.get_mut(&owner)?;
        let entry = directory.entry(vpage)?;
        if write && !entry.read_write() {
            return None;
        }
        *directory.entry_mut(vpage) = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        let frame = FrameId::new(entry.page_frame_address().value() as usize);
        Some((frame, page_offset(address)))
    }

    /// The frame `vpage` is mapped to and whether it is writable. Does not
    /// touch the accessed bit.
    pub fn mapping(&self, owner: AddressSpaceId, vpage: VirtPage) -> Option<(FrameId, bool)> {
        let directories = self.directories.lock();
        let entry = directories.get(&owner)?.entry(vpage)?;
        Some((
            FrameId::new(entry.page_frame_address().value() as usize),
            entry.read_write(),
        ))
    }

    pub fn is_dirty(&self, owner: AddressSpaceId, vpage: VirtPage) -> bool {
        let directories = self.directories.lock();
        directories
            .get(&owner)
            .and_then(|directory| directory.entry(vpage))
            .is_some_and(|entry| entry.dirty())
    }

    pub fn mapped_pages(&self, owner: AddressSpaceId) -> usize {
        self.directories
            .lock()
            .get(&owner)
            .map_or(0, PageDirectory::mapped_pages)
    }
}

impl PageTableOps for SoftPageTables {
    fn install(
        &self,
        owner: AddressSpaceId,
        vpage: VirtPage,
        frame: FrameId,
        writable: bool,
    ) -> bool {
        let mut directories = self.directories.lock();
        let directory = directories.entry(owner).or_default();
        if directory.entry(vpage).is_some() {
            return false;
        }
        *directory.entry_mut(vpage) = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame.index() as u32));
        true
    }

    fn clear(&self, owner: AddressSpaceId, vpage: VirtPage) {
        if let Some(directory) = self.directories.lock().get_mut(&owner) {
            if directory.entry(vpage).is_some() {
                *directory.entry_mut(vpage) = PageTableEntry::DEFAULT;
            }
        }
    }

    fn is_accessed(&self, owner: AddressSpaceId, vpage: VirtPage) -> bool {
        self.directories
            .lock()
            .get(&owner)
            .and_then(|directory| directory.entry(vpage))
            .is_some_and(|entry| entry.accessed())
    }

    fn clear_accessed(&self, owner: AddressSpaceId, vpage: VirtPage) {
        if let Some(directory) = self.directories.lock().get_mut(&owner) {
            if let Some(entry) = directory.entry(vpage) {
                *directory.entry_mut(vpage) = entry.with_accessed(false);
            }
        }
    }

    fn forget(&self, owner: AddressSpaceId) {
        self.directories.lock().remove(&owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: AddressSpaceId = AddressSpaceId::new(1);

    fn page(addr: usize) -> VirtPage {
        VirtPage::from_aligned(addr).unwrap()
    }

    #[test]
    fn install_rejects_double_mapping() {
        let tables = SoftPageTables::new();
        assert!(tables.install(OWNER, page(0x1000), FrameId::new(3), true));
        assert!(!tables.install(OWNER, page(0x1000), FrameId::new(4), true));
        assert_eq!(tables.mapping(OWNER, page(0x1000)), Some((FrameId::new(3), true)));

        tables.clear(OWNER, page(0x1000));
        assert_eq!(tables.mapping(OWNER, page(0x1000)), None);
        assert!(tables.install(OWNER, page(0x1000), FrameId::new(4), false));
    }

    #[test]
    fn translate_sets_accessed_and_dirty() {
        let tables = SoftPageTables::new();
        assert!(tables.install(OWNER, page(0x0804_8000), FrameId::new(9), true));
        assert!(!tables.is_accessed(OWNER, page(0x0804_8000)));

        assert_eq!(
            tables.translate(OWNER, 0x0804_8010, false),
            Some((FrameId::new(9), 0x10))
        );
        assert!(tables.is_accessed(OWNER, page(0x0804_8000)));
        assert!(!tables.is_dirty(OWNER, page(0x0804_8000)));

        tables.clear_accessed(OWNER, page(0x0804_8000));
        assert!(!tables.is_accessed(OWNER, page(0x0804_8000)));

        tables.translate(OWNER, 0x0804_8FFF, true).unwrap();
        assert!(tables.is_dirty(OWNER, page(0x0804_8000)));
    }

    #[test]
    fn translate_refuses_read_only_writes_and_holes() {
        let tables = SoftPageTables::new();
        assert!(tables.install(OWNER, page(0x2000), FrameId::new(1), false));
        assert!(tables.translate(OWNER, 0x2000, true).is_none());
        assert!(tables.translate(OWNER, 0x3000, false).is_none());
        assert!(tables.translate(AddressSpaceId::new(2), 0x2000, false).is_none());
    }

    #[test]
    fn address_spaces_are_separate() {
        let tables = SoftPageTables::new();
        let other = AddressSpaceId::new(2);
        assert!(tables.install(OWNER, page(0x5000), FrameId::new(1), true));
        assert!(tables.install(other, page(0x5000), FrameId::new(2), true));
        assert_eq!(tables.mapped_pages(OWNER), 1);

        tables.forget(OWNER);
        assert_eq!(tables.mapped_pages(OWNER), 0);
        assert_eq!(tables.mapping(other, page(0x5000)), Some((FrameId::new(2), true)));
    }
}
