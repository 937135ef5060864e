// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Compression applied to table blocks
///
/// The type tag is stored in every block trailer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    None,

    /// Snappy compression
    #[default]
    Snappy,
}

impl From<CompressionType> for u8 {
    fn from(value: CompressionType) -> Self {
        match value {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",
                Self::Snappy => "snappy",
            }
        )
    }
}

pub fn compress(compression: CompressionType, raw: &[u8]) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(raw.to_vec()),
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|_| crate::Error::Decompress(compression)),
    }
}

pub fn decompress(compression: CompressionType, block: &[u8]) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(block.to_vec()),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(block)
            .map_err(|_| crate::Error::Decompress(compression)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_roundtrip() -> crate::Result<()> {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(10);

        for compression in [CompressionType::None, CompressionType::Snappy] {
            let compressed = compress(compression, &payload)?;
            assert_eq!(payload, decompress(compression, &compressed)?);
        }

        Ok(())
    }

    #[test]
    fn compression_shrinks_repetitive_data() -> crate::Result<()> {
        let payload = vec![0u8; 4_096];
        let compressed = compress(CompressionType::Snappy, &payload)?;
        assert!(compressed.len() < payload.len());
        Ok(())
    }
}
