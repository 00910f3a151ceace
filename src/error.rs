//! The error taxonomy shared by every layer of the crate.
//!
//! The MTD layer and header parsers surface errors; the scanner classifies and continues
//! where per-PEB locality permits; the driver surfaces in [`crate::ubi::image`] aggregate
//! and choose exit behavior. Only the binaries translate these into process exit codes.

use thiserror::Error;

/// How a header failed validation.
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum CorruptKind {
    #[error("magic mismatch")]
    MagicMismatch,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("field out of range")]
    FieldRange,
}

/// Why a static volume could not be reconstructed in full.
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum StaticVolumeFault {
    #[error("LEB {0} is missing")]
    MissingLnum(u32),

    #[error("LEB {0} fails its data CRC")]
    BadCrcLnum(u32),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied parameters are inconsistent (bad geometry, duplicate auto-resize,
    /// name too long, out-of-range eraseblock access).
    #[error("invalid parameters: {0}")]
    Usage(String),

    /// Underlying device or file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bad eraseblock was reported by the bad-block probe or by write-failure policy.
    /// This surfaces to the caller but does not abort an enclosing multi-PEB operation.
    #[error("bad eraseblock {peb}")]
    BadBlock { peb: u32 },

    /// A header failed validation during a scan. Non-fatal; recorded and skipped.
    #[error("corrupt header in PEB {peb}: {kind}")]
    CorruptHeader { kind: CorruptKind, peb: u32 },

    /// A static volume cannot be reconstructed. Skips that volume, not the scan.
    #[error("broken static volume {vol_id}: {fault}")]
    BrokenStaticVolume { vol_id: u32, fault: StaticVolumeFault },

    /// Hard error on decompression. (Compression failures are absorbed into the
    /// plain-storage fallback and merely counted.)
    #[error("decompression failed: {0}")]
    Compression(String),
}

impl Error {
    /// The process exit code the CLI tools report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 1,
            Error::Io(_) | Error::BadBlock { .. } => 2,
            Error::CorruptHeader { .. } | Error::Compression(_) => 3,
            Error::BrokenStaticVolume { .. } => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
