// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{CompressionType, DecodeError, EncodeError};
use std::sync::Arc;

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Invalid checksum value (got, expected)
    InvalidChecksum((u32, u32)),

    /// Persistent data violated a format invariant
    Corruption(String),

    /// API misuse
    InvalidArgument(String),

    /// A previous background write failed; the engine only allows reads now
    Background(Arc<Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KvError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Background(e) => Some(&**e),
            Self::Decompress(_)
            | Self::InvalidChecksum(_)
            | Self::Corruption(_)
            | Self::InvalidArgument(_) => None,
        }
    }
}

impl Error {
    /// Returns `true` if this is a corruption-class error
    /// (checksum mismatch, malformed block or manifest).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_) | Self::InvalidChecksum(_) | Self::Decode(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
