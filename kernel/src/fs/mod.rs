use alloc::vec::Vec;
use core::cmp::min;

/// An open file, as seen by the paging code.
///
/// Page descriptors share the handle with the process that opened the file;
/// they never close it.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset` and returns the
    /// number of bytes read. Reading at or past the end of the file returns 0.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A read-only file whose contents live in kernel memory, e.g. an
/// executable bundled into the kernel image.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl File for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= self.data.len() {
            return 0;
        }
        let n = min(buf.len(), self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
