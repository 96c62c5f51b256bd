//! Resolving user page faults.

use super::address_space::{ExecutionContext, Tid};
use super::frame_allocator::FrameAllocator;
use super::phys::{FrameId, PhysicalMemory};
use super::spt::{PageDescriptor, PageState};
use super::swap::SwapStore;
use crate::paging::PageTableOps;
use crate::sync::HolderLock;
use crate::{Result, VmError};
use alloc::sync::Arc;
use clockwork_shared::mem::VirtPage;
use clockwork_shared::paging::PageFaultErrorCode;
use log::{debug, warn};

/// How the faulting access was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultAttributes {
    /// The page was present, so the access broke its protection.
    pub present: bool,
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
}

impl FaultAttributes {
    pub fn from_error_code(error_code: u32) -> Self {
        let code = PageFaultErrorCode::new_with_raw_value(error_code);
        Self {
            present: code.present(),
            write: code.write(),
            user: code.user(),
        }
    }

    pub fn read() -> Self {
        Self {
            user: true,
            ..Self::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            user: true,
            ..Self::default()
        }
    }
}

/// What a faulting thread found when it looked its page up.
enum Claim {
    Missing,
    ReadOnly,
    Resident(FrameId),
    /// Another thread of the same space is loading the page.
    Busy,
    /// The page is ours to load.
    Load(PageDescriptor),
}

pub struct PageFaultResolver {
    frames: Arc<FrameAllocator>,
    swap: Arc<SwapStore>,
    memory: Arc<PhysicalMemory>,
    page_tables: Arc<dyn PageTableOps>,
    /// Serializes file reads with the rest of the filesystem.
    fs_lock: Arc<HolderLock>,
    user_top: usize,
}

impl PageFaultResolver {
    pub fn new(
        frames: Arc<FrameAllocator>,
        swap: Arc<SwapStore>,
        memory: Arc<PhysicalMemory>,
        page_tables: Arc<dyn PageTableOps>,
        fs_lock: Arc<HolderLock>,
        user_top: usize,
    ) -> Self {
        Self {
            frames,
            swap,
            memory,
            page_tables,
            fs_lock,
            user_top,
        }
    }

    /// Brings in the page containing `address` for the address space of
    /// `context` and maps it, returning the frame that now holds it.
    ///
    /// Errors are fatal to the faulting process; terminating it is up to the
    /// caller.
    pub fn resolve_fault(
        &self,
        address: usize,
        attributes: FaultAttributes,
        context: &ExecutionContext,
    ) -> Result<FrameId> {
        let violation = VmError::AccessViolation { address };
        if attributes.present || address >= self.user_top {
            warn!("fault: {violation} ({attributes:?})");
            return Err(violation);
        }

        let owner = context.space.id();
        let vpage = VirtPage::containing(address);
        let descriptor = loop {
            // Evictions rewrite descriptors of other address spaces under the
            // frame table lock.
            let claim = self.frames.serialize(|| {
                let mut spt = context.space.spt();
                match spt.lookup(vpage).cloned() {
                    None => Claim::Missing,
                    Some(descriptor) if attributes.write && !descriptor.writable() => {
                        Claim::ReadOnly
                    }
                    Some(descriptor) => match descriptor.frame() {
                        Some(frame) => Claim::Resident(frame),
                        None if spt.begin_load(vpage) => Claim::Load(descriptor),
                        None => Claim::Busy,
                    },
                }
            });
            match claim {
                Claim::Missing => {
                    warn!("fault: {violation}, no page in {owner}");
                    return Err(violation);
                }
                Claim::ReadOnly => {
                    warn!("fault: {violation}, page is read-only");
                    return Err(violation);
                }
                // Another thread of this address space brought it in.
                Claim::Resident(frame) => return Ok(frame),
                Claim::Busy => core::hint::spin_loop(),
                Claim::Load(descriptor) => break descriptor,
            }
        };

        let loaded = self.load(vpage, &descriptor, context);
        context.space.spt().finish_load(vpage);
        let frame = loaded?;
        debug!("fault: {vpage:?} of {owner} in {frame:?}");
        Ok(frame)
    }

    /// Brings `vpage` into a frame and maps it. The caller holds the page's
    /// load claim, so no other thread of the space is doing the same.
    fn load(
        &self,
        vpage: VirtPage,
        descriptor: &PageDescriptor,
        context: &ExecutionContext,
    ) -> Result<FrameId> {
        let owner = context.space.id();
        let frame = self.frames.acquire(owner, vpage)?;
        if let Err(err) = self.populate(frame, descriptor, context.tid) {
            self.frames.abandon(frame)?;
            return Err(err);
        }

        if !self
            .page_tables
            .install(owner, vpage, frame, descriptor.writable())
        {
            // The mapping found there is not ours to remove.
            self.frames.abandon(frame)?;
            if let PageState::Swap(_) = descriptor.state() {
                // The read freed the slot, so nothing holds the page any more.
                context.space.spt().remove(vpage);
            }
            return Err(VmError::CorruptState("faulting page is already mapped"));
        }

        context.space.spt().mark_resident(vpage, frame)?;
        self.frames.unpin(frame)?;
        Ok(frame)
    }

    /// Fills the pinned `frame` with the contents `descriptor` points at.
    fn populate(&self, frame: FrameId, descriptor: &PageDescriptor, tid: Tid) -> Result<()> {
        match descriptor.state() {
            PageState::Zero => self.memory.with_frame(frame, |bytes| bytes.fill(0)),
            PageState::File(backing) => {
                // A syscall may fault on a user buffer while it already holds
                // the filesystem lock.
                let _fs = (!self.fs_lock.held_by(tid)).then(|| self.fs_lock.acquire(tid));
                let actual = self.memory.with_frame(frame, |bytes| {
                    let (head, tail) = bytes.split_at_mut(backing.read_len);
                    tail.fill(0);
                    backing.file.read_at(head, backing.offset)
                })?;
                if actual == backing.read_len {
                    Ok(())
                } else {
                    Err(VmError::ShortRead {
                        expected: backing.read_len,
                        actual,
                    })
                }
            }
            PageState::Swap(slot) => self
                .memory
                .with_frame(frame, |bytes| self.swap.swap_in(*slot, bytes))?,
            PageState::Frame(_) => Err(VmError::CorruptState("populating a resident page")),
        }
    }
}
