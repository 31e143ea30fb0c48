//! Immutable, disk-backed sorted segment with a fixed-offset binary layout.
//!
//! # On-disk layout
//!
//! ```text
//! [0..8)    timestamp (u64 LE)
//! [8..16)   count N (u64 LE)
//! [16..24)  minKey (u64 LE)
//! [24..32)  maxKey (u64 LE)
//! [32..32+10240)          bloom filter bitset
//! [32+10240..+4)          header checksum (crc32 over the preceding region)
//! [.. +12*N)              key/offset table: (key u64, valueOffset u32) * N, ascending
//! [.. end)                 concatenated value bytes, in key order
//! ```
//!
//! There is no block structure and no per-record framing: the whole
//! header and index are read once via a memory map, and value bytes are
//! located by direct offset arithmetic. The header checksum is an
//! ambient integrity check — not part of the logical record format —
//! letting [`SSTable::open`] refuse a torn or corrupted file instead of
//! misreading it as empty.

mod builder;
pub mod bloom;

pub use builder::SSTableBuilder;

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::Decode;
use bloom::{Bloom, BLOOM_BYTES};

/// Byte offset where the bloom filter region begins.
pub const BLOOM_OFFSET: usize = 32;
/// Byte offset where the trailing header checksum begins.
pub const CHECKSUM_OFFSET: usize = BLOOM_OFFSET + BLOOM_BYTES;
/// Byte offset where the key/offset table begins.
pub const INDEX_OFFSET: usize = CHECKSUM_OFFSET + 4;
/// Byte size of one key/offset table entry.
pub const INDEX_ENTRY_SIZE: usize = 12;

/// Errors produced by sstable operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file's header, bloom, or index region failed to decode.
    #[error("corrupt sstable header: {0}")]
    Corrupt(String),

    /// The header checksum did not match the recomputed value.
    #[error("sstable checksum mismatch")]
    ChecksumMismatch,
}

type Result<T> = std::result::Result<T, SSTableError>;

/// In-memory projection of an sstable's header, bloom filter, and
/// key/offset index — enough to answer "is key possibly here, and if
/// so at what offset" without touching the value payload.
#[derive(Debug)]
pub struct SSTableHead {
    path: std::path::PathBuf,
    mmap: Mmap,
    timestamp: u64,
    count: u64,
    min_key: u64,
    max_key: u64,
    bloom: Bloom,
    /// (key, valueOffset) ascending by key.
    index: Vec<(u64, u32)>,
}

impl SSTableHead {
    /// Opens and validates the sstable at `path`, mapping it into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: sstables are never mutated after creation by this
        // process; external truncation would be visible as a short
        // read, which `decode` below treats as `Corrupt` rather than UB.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < INDEX_OFFSET {
            return Err(SSTableError::Corrupt(format!(
                "file too small: {} bytes",
                mmap.len()
            )));
        }

        let (timestamp, _) = u64::decode_from(&mmap[0..8])
            .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
        let (count, _) = u64::decode_from(&mmap[8..16])
            .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
        let (min_key, _) = u64::decode_from(&mmap[16..24])
            .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
        let (max_key, _) = u64::decode_from(&mmap[24..32])
            .map_err(|e| SSTableError::Corrupt(e.to_string()))?;

        let mut bloom_bytes = [0u8; BLOOM_BYTES];
        bloom_bytes.copy_from_slice(&mmap[BLOOM_OFFSET..BLOOM_OFFSET + BLOOM_BYTES]);
        let bloom = Bloom::from_bytes(bloom_bytes);

        let (stored_checksum, _) = u32::decode_from(&mmap[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4])
            .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
        let computed = crc32fast::hash(&mmap[0..CHECKSUM_OFFSET]);
        if stored_checksum != computed {
            warn!(path = %path.display(), "sstable header checksum mismatch");
            return Err(SSTableError::ChecksumMismatch);
        }

        let index_bytes = count as usize * INDEX_ENTRY_SIZE;
        if mmap.len() < INDEX_OFFSET + index_bytes {
            return Err(SSTableError::Corrupt(
                "index table exceeds file length".into(),
            ));
        }
        let mut index = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let base = INDEX_OFFSET + i * INDEX_ENTRY_SIZE;
            let (key, _) = u64::decode_from(&mmap[base..base + 8])
                .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
            let (offset, _) = u32::decode_from(&mmap[base + 8..base + 12])
                .map_err(|e| SSTableError::Corrupt(e.to_string()))?;
            index.push((key, offset));
        }

        debug!(path = %path.display(), count, timestamp, "opened sstable");

        Ok(SSTableHead {
            path,
            mmap,
            timestamp,
            count,
            min_key,
            max_key,
            bloom,
            index,
        })
    }

    /// Byte offset where value payload begins, relative to the file start.
    fn value_region_offset(&self) -> usize {
        INDEX_OFFSET + self.count as usize * INDEX_ENTRY_SIZE
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creation timestamp recorded in the header.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Number of records in this sstable.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Inclusive key range covered by this sstable.
    pub fn key_range(&self) -> (u64, u64) {
        (self.min_key, self.max_key)
    }

    /// Whether `key` falls within this sstable's key range.
    pub fn in_range(&self, key: u64) -> bool {
        self.count > 0 && key >= self.min_key && key <= self.max_key
    }

    /// Whether `[lo, hi]` overlaps this sstable's key range.
    pub fn overlaps(&self, lo: u64, hi: u64) -> bool {
        self.count > 0 && lo <= self.max_key && hi >= self.min_key
    }

    /// Looks up `key`, returning its raw value bytes if present.
    ///
    /// A bloom-filter miss short-circuits without touching the index.
    pub fn get(&self, key: u64) -> Option<Vec<u8>> {
        if !self.in_range(key) || !self.bloom.may_contain(key) {
            return None;
        }
        let pos = self.index.binary_search_by_key(&key, |(k, _)| *k).ok()?;
        Some(self.read_value_at(pos))
    }

    /// Returns every (key, value) pair with `lo <= key <= hi`.
    pub fn scan(&self, lo: u64, hi: u64) -> Vec<(u64, Vec<u8>)> {
        if !self.overlaps(lo, hi) {
            return Vec::new();
        }
        let start = self.index.partition_point(|(k, _)| *k < lo);
        let mut out = Vec::new();
        for pos in start..self.index.len() {
            let (key, _) = self.index[pos];
            if key > hi {
                break;
            }
            out.push((key, self.read_value_at(pos)));
        }
        out
    }

    /// Iterates every (key, value) pair in ascending order.
    pub fn iter_all(&self) -> Vec<(u64, Vec<u8>)> {
        (0..self.index.len())
            .map(|pos| (self.index[pos].0, self.read_value_at(pos)))
            .collect()
    }

    fn read_value_at(&self, pos: usize) -> Vec<u8> {
        let base = self.value_region_offset();
        let start = base + self.index[pos].1 as usize;
        let end = if pos + 1 < self.index.len() {
            base + self.index[pos + 1].1 as usize
        } else {
            self.mmap.len()
        };
        self.mmap[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build(dir: &Path, name: &str, entries: &[(u64, &[u8])], timestamp: u64) -> SSTableHead {
        let path = dir.join(name);
        let mut builder = SSTableBuilder::new(timestamp);
        for (k, v) in entries {
            builder.push(*k, v.to_vec());
        }
        builder.write_to(&path).unwrap();
        SSTableHead::open(&path).unwrap()
    }

    #[test]
    fn roundtrips_simple_table() {
        let dir = tempdir().unwrap();
        let head = build(
            dir.path(),
            "a.sst",
            &[(1, b"one"), (2, b"two"), (3, b"three")],
            100,
        );
        assert_eq!(head.get(1), Some(b"one".to_vec()));
        assert_eq!(head.get(2), Some(b"two".to_vec()));
        assert_eq!(head.get(3), Some(b"three".to_vec()));
        assert_eq!(head.get(4), None);
        assert_eq!(head.key_range(), (1, 3));
        assert_eq!(head.timestamp(), 100);
    }

    #[test]
    fn scan_respects_bounds() {
        let dir = tempdir().unwrap();
        let entries: Vec<(u64, Vec<u8>)> = (0..50).map(|k| (k, vec![k as u8])).collect();
        let refs: Vec<(u64, &[u8])> = entries.iter().map(|(k, v)| (*k, v.as_slice())).collect();
        let head = build(dir.path(), "b.sst", &refs, 1);
        let got = head.scan(10, 20);
        let keys: Vec<u64> = got.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (10..=20).collect::<Vec<_>>());
    }

    #[test]
    fn bloom_rejects_absent_key_range_check() {
        let dir = tempdir().unwrap();
        let head = build(dir.path(), "c.sst", &[(10, b"x"), (20, b"y")], 1);
        assert_eq!(head.get(15), None);
        assert_eq!(head.get(5), None);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        use std::io::{Read, Seek, SeekFrom, Write};
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.sst");
        let mut builder = SSTableBuilder::new(1);
        builder.push(1, b"x".to_vec());
        builder.write_to(&path).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).read(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&byte).unwrap();

        let err = SSTableHead::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::ChecksumMismatch));
    }

    #[test]
    fn iter_all_returns_every_entry_in_order() {
        let dir = tempdir().unwrap();
        let head = build(dir.path(), "e.sst", &[(3, b"c"), (1, b"a"), (2, b"b")], 1);
        let all = head.iter_all();
        assert_eq!(
            all,
            vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())]
        );
    }
}
