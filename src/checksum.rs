// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

const MASK_DELTA: u32 = 0xa282_ead8;

/// Computes the CRC32 checksum of a byte chunk.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Computes the CRC32 checksum of two concatenated chunks.
#[must_use]
pub fn checksum_chained(a: &[u8], b: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize()
}

/// Masks a checksum before it is stored.
///
/// Storing raw CRCs of data that itself embeds CRCs weakens them,
/// so stored values are rotated and offset first.
#[must_use]
pub fn mask(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Inverse of [`mask`].
#[must_use]
pub fn unmask(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let crc = checksum(b"foobarbaz");
        assert_eq!(crc, unmask(mask(crc)));
        assert_ne!(crc, mask(crc));
        // Masking twice must not be a no-op either
        assert_ne!(crc, mask(mask(crc)));
    }

    #[test]
    fn checksum_chained_matches_flat() {
        assert_eq!(checksum(b"helloworld"), checksum_chained(b"hello", b"world"));
    }
}
