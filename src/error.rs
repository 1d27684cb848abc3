//! Error types for packing and unpacking.
//!
//! Every failure the core can produce falls into one of a small set of
//! kinds. `CantPack` means the input is a valid PE but unsupported or
//! suspicious; the message names the reason and, where applicable, suggests
//! `--force`. `CantUnpack` means a packed image failed an integrity check.
//! `InternalError` marks invariant violations that should never trigger on
//! well-formed input.

use std::io;
use thiserror::Error;

/// Result type alias for pepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during packing or unpacking.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Input is valid but cannot be packed (unsupported or suspicious).
    #[error("{0}")]
    CantPack(String),

    /// Packed stream fails integrity checks or appears tampered.
    #[error("{0}")]
    CantUnpack(String),

    /// Input is already packed.
    #[error("this file is already packed")]
    AlreadyPacked,

    /// Invariant violation inside the core.
    #[error("internal error: {0}")]
    InternalError(String),

    /// Final compression ratio check failed.
    #[error("this file is not compressible")]
    NotCompressible,

    /// I/O error from the input source or output sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a `CantPack` error.
    pub fn cant_pack(msg: impl Into<String>) -> Self {
        Self::CantPack(msg.into())
    }

    /// Create a `CantUnpack` error.
    pub fn cant_unpack(msg: impl Into<String>) -> Self {
        Self::CantUnpack(msg.into())
    }

    /// Create an `InternalError`.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cant_pack_message() {
        let e = Error::cant_pack("PE and MZ header overlap: 0x20 < 0x40");
        assert_eq!(e.to_string(), "PE and MZ header overlap: 0x20 < 0x40");
    }

    #[test]
    fn test_io_conversion() {
        let ioe = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let e: Error = ioe.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
