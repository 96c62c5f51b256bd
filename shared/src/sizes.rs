pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Size of one block device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Default size of the swap device: 4 MB, i.e. 1024 page-sized slots.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: usize = SECTOR_SIZE * SWAP_SECTORS as usize;

/// Default number of frames in the user pool.
pub const USER_FRAMES: usize = 256;
