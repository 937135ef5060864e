// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::xxh3_64;

/// A policy for building per-table key filters
///
/// Filters short-circuit point lookups for keys that are
/// definitely not present in a data block.
pub trait FilterPolicy: Send + Sync {
    /// Name of the policy, recorded in the meta-index block.
    fn name(&self) -> &'static str;

    /// Builds a filter over the given keys.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Returns `false` if the key is definitely not covered by the filter.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Standard bloom filter with double hashing
pub struct BloomPolicy {
    bits_per_key: usize,

    /// Number of probes per key
    k: usize,
}

impl Default for BloomPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl BloomPolicy {
    /// Creates a bloom policy with the given bits per key.
    #[must_use]
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to something sane
        let k = ((bits_per_key as f64) * core::f64::consts::LN_2) as usize;
        let k = k.clamp(1, 30);

        Self { bits_per_key, k }
    }

    fn probes(key: &[u8]) -> (u64, u64) {
        let h = xxh3_64(key);
        let delta = h.rotate_right(17) | 1;
        (h, delta)
    }
}

impl FilterPolicy for BloomPolicy {
    fn name(&self) -> &'static str {
        "lsm_kv.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Round up to reduce false positives for tiny key sets
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        let bits = (bytes * 8) as u64;

        let mut filter = vec![0u8; bytes + 1];

        // Remember number of probes so the filter stays readable
        // if the policy parameters change
        #[allow(clippy::indexing_slicing)]
        {
            filter[bytes] = self.k as u8;
        }

        for key in keys {
            let (mut h, delta) = Self::probes(key);

            for _ in 0..self.k {
                let bit = h % bits;

                #[allow(clippy::indexing_slicing)]
                {
                    filter[(bit / 8) as usize] |= 1 << (bit % 8);
                }

                h = h.wrapping_add(delta);
            }
        }

        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let Some((&k, bitmap)) = filter.split_last() else {
            return true;
        };

        if k > 30 || bitmap.is_empty() {
            // Reserved for future encodings, treat as a match
            return true;
        }

        let bits = (bitmap.len() * 8) as u64;
        let (mut h, delta) = Self::probes(key);

        for _ in 0..k {
            let bit = h % bits;

            #[allow(clippy::indexing_slicing)]
            if bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }

            h = h.wrapping_add(delta);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key{i:08}").into_bytes()).collect()
    }

    #[test]
    fn bloom_no_false_negatives() {
        let policy = BloomPolicy::default();
        let keys = keys(10_000);
        let filter = policy.create_filter(&keys);

        for key in &keys {
            assert!(policy.key_may_match(key, &filter));
        }
    }

    #[test]
    fn bloom_false_positive_rate() {
        let policy = BloomPolicy::default();
        let filter = policy.create_filter(&keys(10_000));

        let hits = (0..10_000)
            .filter(|i| policy.key_may_match(format!("other{i:08}").as_bytes(), &filter))
            .count();

        // 10 bits per key should stay well below 2% false positives
        assert!(hits < 200, "{hits} false positives out of 10000");
    }

    #[test]
    fn bloom_empty_filter_matches() {
        let policy = BloomPolicy::default();
        assert!(policy.key_may_match(b"anything", &[]));
    }
}
