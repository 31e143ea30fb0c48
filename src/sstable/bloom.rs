//! Fixed-size bloom filter used by every sstable, backed by the
//! `bloomfilter` crate's explicit-bitmap-size constructor so the
//! serialized filter always occupies exactly [`BLOOM_BYTES`] bytes on
//! disk and the sstable header never needs a variable-length bloom
//! block.

use bloomfilter::Bloom as RawBloom;

/// On-disk size of the bloom filter region, in bytes.
pub const BLOOM_BYTES: usize = 10_240;

/// Expected population used to size the filter's hash-function count.
/// Pinning the bitmap size itself (rather than deriving it from a
/// target false-positive rate) is what keeps the serialized filter at
/// exactly [`BLOOM_BYTES`] regardless of how many keys actually land
/// in a given sstable.
const EXPECTED_ITEMS: usize = 1 << 16;

/// A fixed-size bloom filter keyed on `u64`.
impl std::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bloom").finish_non_exhaustive()
    }
}

pub struct Bloom(RawBloom<u64>);

impl Bloom {
    /// Creates an empty filter sized to exactly [`BLOOM_BYTES`].
    pub fn new() -> Self {
        Bloom(RawBloom::new(BLOOM_BYTES, EXPECTED_ITEMS).expect("fixed bloom parameters are valid"))
    }

    /// Wraps an existing bitset read from disk. The checksum guarding
    /// the header region this bitset lives in has already been
    /// verified by the time this is called, so a malformed slice here
    /// would indicate a bug rather than routine corruption.
    pub fn from_bytes(bytes: [u8; BLOOM_BYTES]) -> Self {
        Bloom(RawBloom::from_slice(&bytes).expect("bloom bytes passed header checksum"))
    }

    /// Returns the raw bitset for serialization.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Records `key` as present.
    pub fn insert(&mut self, key: u64) {
        self.0.set(&key);
    }

    /// Returns `false` if `key` is definitely absent, `true` if it may
    /// be present (subject to the filter's false-positive rate).
    pub fn may_contain(&self, key: u64) -> bool {
        self.0.check(&key)
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_false_negative() {
        let mut b = Bloom::new();
        for k in 0..1000u64 {
            b.insert(k);
        }
        for k in 0..1000u64 {
            assert!(b.may_contain(k));
        }
    }

    #[test]
    fn bytes_len_is_fixed() {
        let b = Bloom::new();
        assert_eq!(b.as_bytes().len(), BLOOM_BYTES);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut b = Bloom::new();
        for k in 0..200u64 {
            b.insert(k * 7919);
        }
        let mut bytes = [0u8; BLOOM_BYTES];
        bytes.copy_from_slice(b.as_bytes());
        let restored = Bloom::from_bytes(bytes);
        for k in 0..200u64 {
            assert!(restored.may_contain(k * 7919));
        }
    }

    #[test]
    fn low_false_positive_rate_for_sparse_set() {
        let mut b = Bloom::new();
        for k in 0..200u64 {
            b.insert(k * 7919);
        }
        let mut false_positives = 0;
        for k in 1_000_000..1_010_000u64 {
            if b.may_contain(k) {
                false_positives += 1;
            }
        }
        assert!(false_positives < 50, "fp count {false_positives}");
    }
}
