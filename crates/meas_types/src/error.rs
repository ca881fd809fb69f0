//! Library-wide error type with stable status codes.

use thiserror::Error;

/// Stable numeric status codes. These never change meaning and are never
/// reused; frontends may match on them across library versions.
pub mod status {
    pub const OK: i32 = 0;
    pub const ERR: i32 = -1;
    pub const ERR_MALLOC: i32 = -2;
    pub const ERR_ARG: i32 = -3;
    pub const ERR_BUG: i32 = -4;
    pub const ERR_SAMPLERATE: i32 = -5;
}

/// Errors reported by drivers, the session loop and the transport layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic failure with no more specific classification.
    #[error("{0}")]
    General(String),
    /// Buffer allocation failed.
    #[error("allocation failed")]
    Malloc,
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    Arg(String),
    /// Internal inconsistency. Continuing is possible but the library is in
    /// a state it never should have reached.
    #[error("internal error: {0}")]
    Bug(String),
    /// The requested samplerate cannot be delivered by the device.
    #[error("unsupported samplerate: {0} Hz")]
    Samplerate(u64),
    /// Communication with the device failed.
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The stable status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::General(_) | Error::Transport(_) | Error::Io(_) => status::ERR,
            Error::Malloc => status::ERR_MALLOC,
            Error::Arg(_) => status::ERR_ARG,
            Error::Bug(_) => status::ERR_BUG,
            Error::Samplerate(_) => status::ERR_SAMPLERATE,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
