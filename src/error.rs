//! Crate-wide error type.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// An enum containing either a wrapped I/O/codec error or a contract
/// violation raised by this crate itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("BGZF decode error: {0}")]
    Decode(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("contract violation: {0}")]
    Contract(String),
}

impl From<flate2::DecompressError> for Error {
    fn from(err: flate2::DecompressError) -> Error {
        Error::Decode(err.to_string())
    }
}
