use crate::sync::Mutex;
use alloc::{string::String, vec, vec::Vec};
use clockwork_shared::sizes::SECTOR_SIZE;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Sector-granular access to a block device.
///
/// Reads and writes are synchronous: they return once the device has
/// transferred the sector.
pub trait BlockDevice: Send + Sync {
    /// The size of the device in sectors.
    fn sector_count(&self) -> BlockSector;
    /// Reads sector `sector` into `buf`, which must be `BLOCK_SECTOR_SIZE` bytes.
    fn read_sector(&self, sector: BlockSector, buf: &mut [u8]);
    /// Writes `buf`, which must be `BLOCK_SECTOR_SIZE` bytes, to sector `sector`.
    fn write_sector(&self, sector: BlockSector, buf: &[u8]);
}

/// A block device backed by kernel memory.
///
/// Used as the swap device on machines without a dedicated swap disk.
pub struct MemoryBlockDevice {
    name: String,
    sectors: Mutex<Vec<[u8; BLOCK_SECTOR_SIZE]>>,
    size: BlockSector,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl MemoryBlockDevice {
    pub fn new(name: &str, size: BlockSector) -> Self {
        Self {
            name: String::from(name),
            sectors: Mutex::new(vec![[0; BLOCK_SECTOR_SIZE]; size as usize]),
            size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Panics if the buffer is not exactly one sector long.
    fn verify_buffer(buf: &[u8]) {
        if buf.len() != BLOCK_SECTOR_SIZE {
            panic!("Invalid buffer size {}", buf.len());
        }
    }

    /// Panics if `sector` is past the end of the device.
    fn check_sector(&self, sector: BlockSector) {
        if sector >= self.size {
            panic!(
                "{}: Invalid sector {} (block size: {})",
                self.name, sector, self.size
            );
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn sector_count(&self) -> BlockSector {
        self.size
    }

    fn read_sector(&self, sector: BlockSector, buf: &mut [u8]) {
        self.check_sector(sector);
        Self::verify_buffer(buf);

        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: BlockSector, buf: &[u8]) {
        self.check_sector(sector);
        Self::verify_buffer(buf);

        self.sectors.lock()[sector as usize].copy_from_slice(buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for MemoryBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\": {:04} sectors, {:04} read, {:04} write",
            self.name,
            self.size,
            self.read_count(),
            self.write_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trip_counts_io() {
        let device = MemoryBlockDevice::new("swap", 4);
        let data = [0xA5; BLOCK_SECTOR_SIZE];
        device.write_sector(3, &data);

        let mut buf = [0; BLOCK_SECTOR_SIZE];
        device.read_sector(3, &mut buf);
        assert_eq!(buf, data);
        device.read_sector(0, &mut buf);
        assert_eq!(buf, [0; BLOCK_SECTOR_SIZE]);

        assert_eq!(device.read_count(), 2);
        assert_eq!(device.write_count(), 1);
    }

    #[test]
    #[should_panic(expected = "Invalid sector")]
    fn out_of_range_sector_panics() {
        let device = MemoryBlockDevice::new("swap", 4);
        device.read_sector(4, &mut [0; BLOCK_SECTOR_SIZE]);
    }

    #[test]
    #[should_panic(expected = "Invalid buffer size")]
    fn short_buffer_panics() {
        let device = MemoryBlockDevice::new("swap", 4);
        device.write_sector(0, &[0; 16]);
    }
}
