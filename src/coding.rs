// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodeError({})", match self {
            Self::Io(e) => e.to_string(),
        })
    }
}

impl std::error::Error for EncodeError {}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid enum tag
    InvalidTag((&'static str, u8)),

    /// Invalid block/file header
    InvalidHeader(&'static str),

    /// Payload is shorter than expected
    UnexpectedEof(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({})", match self {
            Self::Io(e) => e.to_string(),
            Self::InvalidTag((ty, tag)) => format!("invalid tag for {ty}: {tag}"),
            Self::InvalidHeader(ty) => format!("invalid header for {ty}"),
            Self::UnexpectedEof(ty) => format!("unexpected EOF in {ty}"),
        })
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        #[expect(
            clippy::expect_used,
            reason = "encoding into a vec is not expected to fail"
        )]
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Writes a length-prefixed byte string (varint length + raw bytes).
pub fn write_delimited<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    use varint_rs::VarintWriter;

    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed byte string.
pub fn read_delimited<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    use varint_rs::VarintReader;

    let len = reader.read_u32_varint()? as usize;
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let mut buf = vec![];
        write_delimited(&mut buf, b"hello")?;
        write_delimited(&mut buf, b"")?;
        write_delimited(&mut buf, &[0u8; 300])?;

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(b"hello".to_vec(), read_delimited(&mut cursor)?);
        assert_eq!(Vec::<u8>::new(), read_delimited(&mut cursor)?);
        assert_eq!(vec![0u8; 300], read_delimited(&mut cursor)?);

        Ok(())
    }
}
