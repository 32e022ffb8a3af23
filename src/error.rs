use std::io;

use thiserror::Error;

/// Errors raised by key derivation, the cipher engine and header maintenance.
///
/// `Cancelled` is kept apart from every failure so callers can tell
/// "the user declined" from "the operation failed".
#[derive(Debug, Error)]
pub enum Error {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid key derivation parameters: {0}")]
    InvalidParams(String),

    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("buffer length {0} is not a multiple of the block size")]
    InvalidLength(usize),

    #[error("corrupt round key schedule: {0}")]
    CorruptSchedule(String),

    #[error("malformed volume header: {0}")]
    MalformedHeader(String),

    #[error("keyfile error: {0}")]
    Keyfile(String),

    #[error("incorrect password or keyfiles, or not a volume")]
    WrongCredential,

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("cannot allocate {0} KiB for the key derivation matrix")]
    Allocation(u64),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("OS random generator unavailable")]
    Random,

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Returns `true` when the user cancelled rather than something failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Wraps an IO error with a description of what was being attempted.
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
