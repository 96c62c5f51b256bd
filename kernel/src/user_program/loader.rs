//! Lazy loading of ELF executables into an address space.
//!
//! Nothing is read from the executable beyond its headers. Every page of
//! every loadable segment gets a descriptor saying where its bytes are, and
//! the fault handler reads them the first time the page is touched.

use super::elf::{
    ElfHeader, ElfProgramHeader, ElfProgramType, ELF_HEADER_SIZE, EM_386, ET_EXEC,
    PROGRAM_HEADER_SIZE,
};
use crate::config::VmConfig;
use crate::fs::File;
use crate::mem::spt::SupplementalPageTable;
use alloc::{sync::Arc, vec};
use clockwork_shared::mem::{page_offset, page_round_down, page_round_up, VirtPage, PAGE_FRAME_SIZE};
use core::cmp::min;
use core::fmt::{self, Display, Formatter};
use log::{debug, warn};
use nom::number::Endianness;

/// More program headers than this is taken as a corrupt file.
const MAX_PROGRAM_HEADERS: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The file ended before the headers did.
    Truncated { offset: u64 },
    /// Not a 32-bit little-endian x86 executable.
    InvalidHeader,
    /// The executable needs a dynamic linker or an interpreter.
    UnsupportedSegment(ElfProgramType),
    InvalidSegment { virtual_address: u32 },
    /// Two segments, or a segment and the stack, claim the same page.
    Overlap { vpage: VirtPage },
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "file truncated at offset {offset}"),
            Self::InvalidHeader => write!(f, "not an x86 ELF32 executable"),
            Self::UnsupportedSegment(kind) => write!(f, "unsupported segment type {kind:?}"),
            Self::InvalidSegment { virtual_address } => {
                write!(f, "invalid segment at {virtual_address:#010X}")
            }
            Self::Overlap { vpage } => write!(f, "{vpage:?} is loaded twice"),
        }
    }
}

impl core::error::Error for LoadError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
    pub entry: usize,
    /// Initial stack pointer, the top of the stack.
    pub stack_pointer: usize,
}

/// Describes every page of `file`'s loadable segments and the initial stack
/// in `spt`.
pub fn load_executable(
    spt: &mut SupplementalPageTable,
    file: Arc<dyn File>,
    config: &VmConfig,
) -> Result<LoadedProgram, LoadError> {
    let mut header_bytes = [0; ELF_HEADER_SIZE];
    read_exact(&*file, &mut header_bytes, 0)?;
    let (_, header) = ElfHeader::parse(&header_bytes).map_err(|_| LoadError::InvalidHeader)?;
    if !is_supported(&header) {
        warn!("load: rejecting header {header:?}");
        return Err(LoadError::InvalidHeader);
    }

    let mut table = vec![0; usize::from(header.program_header_count) * PROGRAM_HEADER_SIZE];
    read_exact(&*file, &mut table, u64::from(header.program_headers_offset))?;
    let (_, program_headers) =
        ElfProgramHeader::parse_table(&table, &header).map_err(|_| LoadError::InvalidHeader)?;

    for program_header in &program_headers {
        match program_header.program_type {
            ElfProgramType::Load => load_segment(spt, &file, program_header, config)?,
            kind @ (ElfProgramType::Dynamic
            | ElfProgramType::Interpret
            | ElfProgramType::SharedLibrary) => {
                warn!("load: {kind:?} segment");
                return Err(LoadError::UnsupportedSegment(kind));
            }
            _ => {}
        }
    }

    let stack_pointer = setup_stack(spt, config)?;
    debug!(
        "load: {} pages described, entry {:#010X}",
        spt.len(),
        header.entry
    );
    Ok(LoadedProgram {
        entry: header.entry as usize,
        stack_pointer,
    })
}

fn is_supported(header: &ElfHeader) -> bool {
    header.endian == Endianness::Little
        && header.object_type == ET_EXEC
        && header.machine == EM_386
        && header.version == 1
        && usize::from(header.program_header_size) == PROGRAM_HEADER_SIZE
        && header.program_header_count <= MAX_PROGRAM_HEADERS
}

fn read_exact(file: &dyn File, buf: &mut [u8], offset: u64) -> Result<(), LoadError> {
    if file.read_at(buf, offset) == buf.len() {
        Ok(())
    } else {
        Err(LoadError::Truncated { offset })
    }
}

/// Checks that a PT_LOAD segment describes a valid region of user memory
/// backed by `file`.
fn validate_segment(
    program_header: &ElfProgramHeader,
    file: &dyn File,
    config: &VmConfig,
) -> bool {
    let offset = program_header.file_offset as usize;
    let start = program_header.virtual_address as usize;
    let memory_size = program_header.memory_size as usize;

    // The file offset and the address must be congruent modulo the page
    // size so each page maps to exactly one page-sized run of the file.
    if page_offset(offset) != page_offset(start) {
        return false;
    }
    if u64::from(program_header.file_offset) > file.len() {
        return false;
    }
    if program_header.memory_size < program_header.file_size || memory_size == 0 {
        return false;
    }
    // Page 0 stays unmapped so null pointer dereferences fault.
    if start < PAGE_FRAME_SIZE {
        return false;
    }
    start
        .checked_add(memory_size)
        .is_some_and(|end| end < config.user_top)
}

/// Describes the pages of one PT_LOAD segment.
///
/// Pages with file data become file-backed, the rest of the segment
/// (the bss) becomes zero-filled pages.
pub fn load_segment(
    spt: &mut SupplementalPageTable,
    file: &Arc<dyn File>,
    program_header: &ElfProgramHeader,
    config: &VmConfig,
) -> Result<(), LoadError> {
    let invalid = LoadError::InvalidSegment {
        virtual_address: program_header.virtual_address,
    };
    if !validate_segment(program_header, &**file, config) {
        warn!("load: {invalid}");
        return Err(invalid);
    }

    let writable = program_header.writable;
    let first_page = page_round_down(program_header.virtual_address as usize);
    let lead = page_offset(program_header.virtual_address as usize);
    let mut file_offset = page_round_down(program_header.file_offset as usize) as u64;

    let mut read_bytes = if program_header.file_size > 0 {
        lead + program_header.file_size as usize
    } else {
        0
    };
    let end = page_round_up(lead + program_header.memory_size as usize).ok_or(invalid)?;
    let mut zero_bytes = end - read_bytes;

    let mut vpage = VirtPage::from_aligned(first_page).ok_or(invalid)?;
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = min(read_bytes, PAGE_FRAME_SIZE);
        let page_zero = PAGE_FRAME_SIZE - page_read;

        let inserted = if page_read > 0 {
            spt.insert_file(vpage, Arc::clone(file), file_offset, page_read, page_zero, writable)
        } else {
            spt.insert_zero(vpage, writable)
        };
        if !inserted {
            return Err(LoadError::Overlap { vpage });
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        file_offset += page_read as u64;
        if read_bytes > 0 || zero_bytes > 0 {
            vpage = vpage.forward(1).ok_or(invalid)?;
        }
    }

    Ok(())
}

/// Describes the initial stack, `config.stack_pages` writable zero pages
/// right below `config.user_top`, and returns the initial stack pointer.
pub fn setup_stack(spt: &mut SupplementalPageTable, config: &VmConfig) -> Result<usize, LoadError> {
    let bottom = VirtPage::from_aligned(config.stack_bottom()).ok_or(LoadError::InvalidHeader)?;
    for index in 0..config.stack_pages {
        let vpage = bottom.forward(index).ok_or(LoadError::InvalidHeader)?;
        if !spt.insert_zero(vpage, true) {
            return Err(LoadError::Overlap { vpage });
        }
    }
    Ok(config.user_top)
}
