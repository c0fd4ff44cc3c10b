//! Engine-level error kinds
//!
//! One error enum covers every fatal condition the engine can surface to its
//! caller. Repair feasibility is deliberately *not* an error: verify returns
//! a [`crate::verify::VerifyVerdict`] value, and only the binary translates
//! verdicts and errors into process exit codes.

use thiserror::Error;

/// Fatal error kinds returned by create/verify/repair.
#[derive(Debug, Error)]
pub enum Error {
    /// A command or option combination the engine cannot act on.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// An allocation request exceeded the configured memory limit.
    #[error("out of memory: {0}")]
    Memory(String),

    /// Any failure to open, seek, read, write, truncate or rename a file.
    #[error("file I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    /// A malformed packet, impossible mapping, or failed internal
    /// self-check (for example a parity mismatch after decode).
    #[error("logic error: {0}")]
    Logic(String),

    /// Repair ran but one or more files could not be restored.
    #[error("repair failed: {0}")]
    RepairFailed(String),
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Logic(_) => 1,
            Error::InvalidCommand(_) => 2,
            Error::FileIo(_) => 3,
            Error::Memory(_) => 4,
            Error::RepairFailed(_) => 7,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
