use crate::sizes::SECTOR_SIZE;
use core::fmt;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * crate::sizes::KB;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x8000_0000;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, or `None` if that overflows.
#[inline]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_FRAME_SIZE - 1) {
        Some(addr) => Some(page_round_down(addr)),
        None => None,
    }
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

/// The page-aligned base address of a virtual page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(usize);

impl VirtPage {
    /// The page that contains `addr`.
    pub const fn containing(addr: usize) -> Self {
        Self(page_round_down(addr))
    }

    /// Returns `None` unless `addr` is page-aligned.
    pub const fn from_aligned(addr: usize) -> Option<Self> {
        if page_offset(addr) == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// The page `pages` pages above this one.
    pub fn forward(self, pages: usize) -> Option<Self> {
        pages
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPage({:#010X})", self.0)
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}
