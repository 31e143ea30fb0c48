//! Writer side of the sstable format: turns a set of (key, value) pairs
//! into the fixed-offset layout documented in [`super`].

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::encoding::{Encode, EncodingError};

use super::bloom::Bloom;
use super::SSTableError;

impl From<EncodingError> for SSTableError {
    fn from(e: EncodingError) -> Self {
        SSTableError::Corrupt(e.to_string())
    }
}

/// Accumulates (key, value) pairs and serializes them into a single
/// sstable file once [`SSTableBuilder::write_to`] is called.
pub struct SSTableBuilder {
    timestamp: u64,
    entries: Vec<(u64, Vec<u8>)>,
}

impl SSTableBuilder {
    /// Starts a new builder that will stamp the resulting file with
    /// `timestamp`.
    pub fn new(timestamp: u64) -> Self {
        SSTableBuilder {
            timestamp,
            entries: Vec::new(),
        }
    }

    /// Adds one record. Keys may be pushed out of order; they are
    /// sorted at write time.
    pub fn push(&mut self, key: u64, value: Vec<u8>) {
        self.entries.push((key, value));
    }

    /// Number of records accumulated so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no records have been pushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Projected on-disk size of the file this builder would produce.
    pub fn projected_size(&self) -> usize {
        let payload: usize = self.entries.iter().map(|(_, v)| v.len()).sum();
        32 + super::bloom::BLOOM_BYTES + 4 + 12 * self.entries.len() + payload
    }

    /// Serializes and writes the accumulated entries to `path`.
    ///
    /// Keys must be unique; duplicate keys keep the last value pushed.
    pub fn write_to(self, path: impl AsRef<Path>) -> Result<(), SSTableError> {
        let timestamp = self.timestamp;

        // Fold in insertion order so a later push of the same key
        // overwrites an earlier one, matching compaction's merge rule.
        let mut by_key: std::collections::BTreeMap<u64, Vec<u8>> = std::collections::BTreeMap::new();
        for (key, value) in self.entries {
            by_key.insert(key, value);
        }
        let entries: Vec<(u64, Vec<u8>)> = by_key.into_iter().collect();

        let count = entries.len() as u64;
        let (min_key, max_key) = if entries.is_empty() {
            (0, 0)
        } else {
            (entries[0].0, entries[entries.len() - 1].0)
        };

        let mut bloom = Bloom::new();
        for (k, _) in &entries {
            bloom.insert(*k);
        }

        let mut header = Vec::with_capacity(32 + super::bloom::BLOOM_BYTES);
        timestamp.encode_to(&mut header)?;
        count.encode_to(&mut header)?;
        min_key.encode_to(&mut header)?;
        max_key.encode_to(&mut header)?;
        header.extend_from_slice(bloom.as_bytes());

        let checksum = crc32fast::hash(&header);
        let mut checksum_bytes = Vec::with_capacity(4);
        checksum.encode_to(&mut checksum_bytes)?;

        let mut index = Vec::with_capacity(12 * entries.len());
        let mut payload = Vec::new();
        for (key, value) in &entries {
            key.encode_to(&mut index)?;
            (payload.len() as u32).encode_to(&mut index)?;
            payload.extend_from_slice(value);
        }

        let mut file = File::create(path)?;
        file.write_all(&header)?;
        file.write_all(&checksum_bytes)?;
        file.write_all(&index)?;
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn duplicate_keys_keep_last_pushed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.sst");
        let mut builder = SSTableBuilder::new(1);
        builder.push(5, b"first".to_vec());
        builder.push(5, b"second".to_vec());
        builder.write_to(&path).unwrap();

        let head = super::super::SSTableHead::open(&path).unwrap();
        assert_eq!(head.count(), 1);
        assert_eq!(head.get(5), Some(b"second".to_vec()));
    }

    #[test]
    fn empty_builder_produces_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.sst");
        SSTableBuilder::new(7).write_to(&path).unwrap();
        let head = super::super::SSTableHead::open(&path).unwrap();
        assert_eq!(head.count(), 0);
        assert_eq!(head.timestamp(), 7);
    }
}
