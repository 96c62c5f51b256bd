//! The virtual memory system as a whole, and the instance the kernel boots
//! with.

use crate::config::VmConfig;
use crate::dev::block::{BlockDevice, MemoryBlockDevice};
use crate::fs::File;
use crate::mem::evict::Evictor;
use crate::mem::{
    AddressSpace, AddressSpaceId, AddressSpaces, ExecutionContext, FaultAttributes, FrameAllocator,
    FrameId, PageFaultResolver, PageState, PhysicalMemory, SwapStore,
};
use crate::paging::PageTableOps;
use crate::sync::HolderLock;
use crate::user_program::{load_executable, LoadError, LoadedProgram};
use crate::Result;
use alloc::{boxed::Box, sync::Arc};
use log::{debug, info, warn};
use once_cell::race::OnceBox;

pub struct VmSystem {
    config: VmConfig,
    spaces: Arc<AddressSpaces>,
    page_tables: Arc<dyn PageTableOps>,
    swap: Arc<SwapStore>,
    memory: Arc<PhysicalMemory>,
    frames: Arc<FrameAllocator>,
    fs_lock: Arc<HolderLock>,
    resolver: PageFaultResolver,
}

impl VmSystem {
    pub fn new(
        config: VmConfig,
        swap_device: Arc<dyn BlockDevice>,
        page_tables: Arc<dyn PageTableOps>,
    ) -> Self {
        let spaces = Arc::new(AddressSpaces::new());
        let swap = Arc::new(SwapStore::new(swap_device));
        let memory = Arc::new(PhysicalMemory::new(config.user_frames));
        let evictor = Evictor::new(
            Arc::clone(&page_tables),
            Arc::clone(&swap),
            Arc::clone(&memory),
            Arc::clone(&spaces),
        );
        let frames = Arc::new(FrameAllocator::new(
            config.user_frames,
            Arc::clone(&page_tables),
            evictor,
        ));
        let fs_lock = Arc::new(HolderLock::new());
        let resolver = PageFaultResolver::new(
            Arc::clone(&frames),
            Arc::clone(&swap),
            Arc::clone(&memory),
            Arc::clone(&page_tables),
            Arc::clone(&fs_lock),
            config.user_top,
        );

        info!(
            "vm: {} user frames, {} swap slots",
            config.user_frames,
            swap.slot_count()
        );
        Self {
            config,
            spaces,
            page_tables,
            swap,
            memory,
            frames,
            fs_lock,
            resolver,
        }
    }

    /// Builds a system that swaps to a RAM disk of `config.swap_sectors`
    /// sectors.
    pub fn with_ram_swap(config: VmConfig, page_tables: Arc<dyn PageTableOps>) -> Self {
        let device = Arc::new(MemoryBlockDevice::new("swap", config.swap_sectors));
        Self::new(config, device, page_tables)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn create_address_space(&self) -> Arc<AddressSpace> {
        let space = self.spaces.create();
        debug!("vm: created {}", space.id());
        space
    }

    pub fn address_space(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.get(id)
    }

    /// Describes the executable `file` in `space` and its initial stack.
    pub fn load_program(
        &self,
        space: &AddressSpace,
        file: Arc<dyn File>,
    ) -> core::result::Result<LoadedProgram, LoadError> {
        load_executable(&mut space.spt(), file, &self.config)
    }

    pub fn resolve_fault(
        &self,
        address: usize,
        attributes: FaultAttributes,
        context: &ExecutionContext,
    ) -> Result<FrameId> {
        self.resolver.resolve_fault(address, attributes, context)
    }

    /// Releases everything `space` holds: its frames and their mappings
    /// first, then its swap slots, then its descriptors.
    ///
    /// Teardown always runs to the end. If a step finds the bookkeeping
    /// inconsistent, the rest still runs and the first such error is
    /// returned afterwards.
    ///
    /// No thread may run in `space` any more.
    pub fn destroy_address_space(&self, space: &AddressSpace) -> Result<()> {
        let id = space.id();
        let mut first_error = None;
        let frames = self.frames.release_owner(id).unwrap_or_else(|err| {
            first_error.get_or_insert(err);
            0
        });

        let mut spt = space.spt();
        let mut slots = 0;
        for descriptor in spt.iter() {
            if let PageState::Swap(slot) = descriptor.state() {
                match self.swap.discard(*slot) {
                    Ok(()) => slots += 1,
                    Err(err) => {
                        warn!("vm: {id} held {slot:?}: {err}");
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        spt.destroy();
        drop(spt);

        self.spaces.remove(id);
        self.page_tables.forget(id);
        debug!("vm: destroyed {id}, released {frames} frames and {slots} swap slots");
        first_error.map_or(Ok(()), Err)
    }

    /// Lock held by the filesystem around file operations.
    pub fn fs_lock(&self) -> &HolderLock {
        &self.fs_lock
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn page_tables(&self) -> &Arc<dyn PageTableOps> {
        &self.page_tables
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn resident_frames(&self) -> usize {
        self.frames.resident_count()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.swap.free_slots()
    }
}

static VM: OnceBox<VmSystem> = OnceBox::new();

/// Installs the system the kernel runs with. Panics if called twice.
pub fn init(system: VmSystem) {
    if VM.set(Box::new(system)).is_err() {
        panic!("VM system initialized twice.");
    }
}

pub fn vm() -> Option<&'static VmSystem> {
    VM.get()
}

pub fn unwrap_vm() -> &'static VmSystem {
    VM.get().expect("VM system not initialized.")
}
