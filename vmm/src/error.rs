use crate::page::Permissions;
use thiserror::Error;

/// Failures of address space construction and of individual accesses.
#[derive(Debug, Error)]
pub enum VmmError {
    /// Machine type or optional header the emulator cannot run.
    #[error("unsupported architecture: machine {machine:#x}, optional header magic {magic:#x}")]
    UnsupportedArchitecture { machine: u16, magic: u16 },

    #[error("image has no sections, nothing to emulate")]
    NoSections,

    /// Holes, overlaps or virtual disorder between consecutive sections.
    #[error("section {index} starts at rva {rva:#x}, expected {expected:#x}")]
    MalformedImage { index: usize, rva: u32, expected: u64 },

    /// A mapped position exceeds the page table or the backing capacity.
    #[error("offset {offset:#x} out of range, limit is {limit:#x}")]
    OutOfRange { offset: u64, limit: u64 },

    #[error("address {address:#010x} is outside the mapped extent")]
    OutOfBounds { address: u64 },

    #[error("permission denied at {address:#010x}: required {required}, page has {actual}")]
    PermissionDenied {
        address: u32,
        required: Permissions,
        actual: Permissions,
    },

    #[error("backing store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmmError>;
