//! The parts of ELF32 the loader reads: the file header fields that say
//! whether the file is an x86 executable, and the program header table.

use alloc::vec::Vec;
use nom::bytes::complete::{tag, take};
use nom::combinator::{map_opt, verify};
use nom::multi::count;
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::sequence::tuple;
use nom::IResult;

/// Size of an ELF32 file header.
pub const ELF_HEADER_SIZE: usize = 52;
/// Size of an ELF32 program header.
pub const PROGRAM_HEADER_SIZE: usize = 32;

/// `e_type` of an executable file.
pub const ET_EXEC: u16 = 2;
/// `e_machine` of Intel 80386.
pub const EM_386: u16 = 3;

const MAGIC: &[u8] = b"\x7FELF";
const CLASS_32: u8 = 1;

#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endian: Endianness,
    pub object_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub program_headers_offset: u32,
    pub program_header_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    /// Parses a 32-bit header. 64-bit files fail on the class byte.
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], Self> {
        let (bytes, _) = tag(MAGIC)(bytes)?;
        let (bytes, _) = verify(u8, |class| *class == CLASS_32)(bytes)?;
        let (bytes, endian) = map_opt(u8, |data| match data {
            1 => Some(Endianness::Little),
            2 => Some(Endianness::Big),
            _ => None,
        })(bytes)?;
        // Identification version, ABI and padding.
        let (bytes, _) = take(10usize)(bytes)?;

        let (bytes, (object_type, machine, version, entry, program_headers_offset)) =
            tuple((u16(endian), u16(endian), u32(endian), u32(endian), u32(endian)))(bytes)?;
        // Section header offset, flags, header size.
        let (bytes, _) = take(10usize)(bytes)?;
        let (bytes, (program_header_size, program_header_count)) =
            tuple((u16(endian), u16(endian)))(bytes)?;
        // Section header table shape.
        let (bytes, _) = take(6usize)(bytes)?;

        Ok((
            bytes,
            Self {
                endian,
                object_type,
                machine,
                version,
                entry,
                program_headers_offset,
                program_header_size,
                program_header_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Load,
    Dynamic,
    Interpret,
    SharedLibrary,
    /// Anything the loader skips: notes, `PT_PHDR`, `GNU_STACK` and so on.
    Other(u32),
}

impl From<u32> for ElfProgramType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Load,
            2 => Self::Dynamic,
            3 => Self::Interpret,
            5 => Self::SharedLibrary,
            other => Self::Other(other),
        }
    }
}

/// A program header. Segment contents stay in the file; only their
/// location is recorded, so pages can be read when they are first touched.
#[derive(Copy, Clone, Debug)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub writable: bool,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, (program_type, file_offset, virtual_address)) =
            tuple((u32(endian), u32(endian), u32(endian)))(bytes)?;
        // Physical address.
        let (bytes, _) = take(4usize)(bytes)?;
        let (bytes, (file_size, memory_size, flags)) =
            tuple((u32(endian), u32(endian), u32(endian)))(bytes)?;
        // Alignment.
        let (bytes, _) = take(4usize)(bytes)?;

        Ok((
            bytes,
            Self {
                program_type: program_type.into(),
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                writable: flags & PF_WRITE != 0,
            },
        ))
    }

    /// Parses the program header table `bytes` starts with. Entries must be
    /// [`PROGRAM_HEADER_SIZE`] bytes long.
    pub fn parse_table<'a>(bytes: &'a [u8], header: &ElfHeader) -> IResult<&'a [u8], Vec<Self>> {
        let endian = header.endian;
        count(
            move |bytes| Self::parse(bytes, endian),
            usize::from(header.program_header_count),
        )(bytes)
    }
}

const PF_WRITE: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn header_bytes(machine: u16, phnum: u16) -> Vec<u8> {
        let mut bytes = vec![0x7F, b'E', b'L', b'F', 1, 1, 1, 0];
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&ET_EXEC.to_le_bytes());
        bytes.extend_from_slice(&machine.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0x0804_8080u32.to_le_bytes());
        bytes.extend_from_slice(&52u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&52u16.to_le_bytes());
        bytes.extend_from_slice(&32u16.to_le_bytes());
        bytes.extend_from_slice(&phnum.to_le_bytes());
        bytes.extend_from_slice(&[0; 6]);
        bytes
    }

    fn program_header_bytes(kind: u32, offset: u32, vaddr: u32, filesz: u32, memsz: u32, flags: u32) -> Vec<u8> {
        [kind, offset, vaddr, vaddr, filesz, memsz, flags, 0x1000]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    #[test]
    fn parses_x86_executable_header() {
        let bytes = header_bytes(EM_386, 2);
        assert_eq!(bytes.len(), ELF_HEADER_SIZE);
        let (rest, header) = ElfHeader::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.endian, Endianness::Little);
        assert_eq!(header.object_type, ET_EXEC);
        assert_eq!(header.machine, EM_386);
        assert_eq!(header.version, 1);
        assert_eq!(header.entry, 0x0804_8080);
        assert_eq!(header.program_headers_offset, 52);
        assert_eq!(header.program_header_count, 2);
        assert_eq!(usize::from(header.program_header_size), PROGRAM_HEADER_SIZE);
    }

    #[test]
    fn rejects_bad_magic_class_and_truncation() {
        let mut bytes = header_bytes(EM_386, 0);
        assert!(ElfHeader::parse(&bytes[..20]).is_err());
        bytes[4] = 2;
        assert!(ElfHeader::parse(&bytes).is_err());
        bytes[4] = 1;
        bytes[5] = 3;
        assert!(ElfHeader::parse(&bytes).is_err());
        bytes[5] = 1;
        bytes[1] = b'X';
        assert!(ElfHeader::parse(&bytes).is_err());
    }

    #[test]
    fn parses_program_header_table() {
        let (_, header) = ElfHeader::parse(&header_bytes(EM_386, 3)).unwrap();
        let mut table = program_header_bytes(1, 0x1000, 0x0804_8000, 0x234, 0x234, 5);
        table.extend(program_header_bytes(0x6474_E551, 0, 0, 0, 0, 6));
        table.extend(program_header_bytes(3, 0x2000, 0, 0x13, 0x13, 4));

        let (rest, headers) = ElfProgramHeader::parse_table(&table, &header).unwrap();
        assert!(rest.is_empty());
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].program_type, ElfProgramType::Load);
        assert_eq!(headers[0].file_offset, 0x1000);
        assert_eq!(headers[0].virtual_address, 0x0804_8000);
        assert_eq!(headers[0].file_size, 0x234);
        assert!(!headers[0].writable);
        assert_eq!(headers[1].program_type, ElfProgramType::Other(0x6474_E551));
        assert!(headers[1].writable);
        assert_eq!(headers[2].program_type, ElfProgramType::Interpret);

        assert!(ElfProgramHeader::parse_table(&table[..40], &header).is_err());
    }
}
