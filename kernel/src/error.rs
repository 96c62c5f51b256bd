use core::fmt::{self, Display, Formatter};

/// Failures of the paging subsystem.
///
/// Every variant is fatal to the process that caused it. The paging code
/// only reports them; deciding to terminate the process is left to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The faulting address is outside the user region, has no descriptor,
    /// or was accessed in a way its mapping does not permit.
    AccessViolation { address: usize },
    /// No frame could be obtained, even after trying to evict one.
    OutOfMemory,
    /// Every swap slot is occupied, so nothing can be evicted.
    SwapExhausted,
    /// An internal invariant does not hold. This is a kernel bug.
    CorruptState(&'static str),
    /// A file-backed page could not be read in full.
    ShortRead { expected: usize, actual: usize },
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessViolation { address } => write!(f, "access violation at {address:#010X}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::SwapExhausted => write!(f, "swap space exhausted"),
            Self::CorruptState(what) => write!(f, "corrupt paging state: {what}"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: wanted {expected} bytes, got {actual}")
            }
        }
    }
}

impl core::error::Error for VmError {}

pub type Result<T> = core::result::Result<T, VmError>;
