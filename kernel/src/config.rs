use clockwork_shared::{
    mem::{OFFSET, PAGE_FRAME_SIZE},
    sizes::{SWAP_SECTORS, USER_FRAMES},
};

/// Boot-time parameters of the virtual memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames handed to user pages.
    pub user_frames: usize,
    /// Size in sectors of the RAM swap device built by
    /// [`VmSystem::with_ram_swap`](crate::system::VmSystem::with_ram_swap).
    pub swap_sectors: u32,
    /// Exclusive upper bound of user virtual addresses.
    pub user_top: usize,
    /// Zero-filled stack pages placed right below `user_top` by the loader.
    pub stack_pages: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_FRAMES,
            swap_sectors: SWAP_SECTORS,
            user_top: OFFSET,
            stack_pages: 1,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(self, user_frames: usize) -> Self {
        Self { user_frames, ..self }
    }

    pub fn with_swap_sectors(self, swap_sectors: u32) -> Self {
        Self {
            swap_sectors,
            ..self
        }
    }

    /// Lowest address of the initial stack.
    pub fn stack_bottom(&self) -> usize {
        self.user_top - self.stack_pages * PAGE_FRAME_SIZE
    }
}
