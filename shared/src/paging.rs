//! x86 two-level paging formats, limited to the bits the VM subsystem reads
//! or writes.
//!
//! https://wiki.osdev.org/Paging

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::mem::size_of;
use core::ops::{Index, IndexMut};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

/// One page-aligned table of entries, covering 4 MB of address space.
#[repr(align(4096))]
pub struct PageTable([PageTableEntry; PAGE_TABLE_LEN]);

impl PageTable {
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.0.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.0[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.0[index]
    }
}

/// Caching and global bits (3, 4, 7, 8) stay zero.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    /// Set by the MMU on any access; the clock hand clears it.
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

/// The error code the CPU pushes for a page fault (#PF).
#[bitfield(u32)]
pub struct PageFaultErrorCode {
    /// Clear for a not-present page, set for a protection violation.
    #[bit(0, r)]
    present: bool,
    #[bit(1, r)]
    write: bool,
    /// Set when the access came from ring 3.
    #[bit(2, r)]
    user: bool,
}
