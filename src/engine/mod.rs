//! LSM key-value engine: memtable + leveled sstables + compaction.
//!
//! Writes land in the [`Memtable`]. Once the memtable's projected
//! on-disk size would exceed [`EngineConfig::flush_threshold`], it is
//! flushed to a new level-0 sstable and [`crate::compaction::compact`]
//! runs to keep every level within its soft size bound. Reads check the
//! memtable first, then sstables level by level, newest timestamp wins
//! on ties across overlapping level-0 heads.
//!
//! There is no write-ahead log: a crash before flush loses unflushed
//! writes. Durability comes from sstable immutability once written.

use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, trace};

use crate::compaction::{self, CompactionError, Level, TOMBSTONE};
use crate::memtable::{Memtable, MemtableError};
use crate::sstable::{SSTableBuilder, SSTableError, SSTableHead};

/// Errors produced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memtable operation failed.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// An sstable failed to read or write.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Compaction failed partway through.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),
}

type Result<T> = std::result::Result<T, EngineError>;

/// Tuning knobs for the LSM engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memtable flush threshold, in bytes of projected sstable size.
    /// Defaults to 2 MiB; the memtable's own byte accounting already
    /// bakes in the 10240+32 byte header/bloom overhead, so this value
    /// is compared directly against [`Memtable::byte_size`].
    pub flush_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flush_threshold: 2 * 1024 * 1024,
        }
    }
}

/// Embedded LSM key-value engine rooted at a single base directory.
pub struct Engine {
    base_dir: PathBuf,
    config: EngineConfig,
    memtable: Memtable,
    levels: Vec<Level>,
    timestamp: u64,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `base_dir`, scanning any
    /// existing `level-0, level-1, …` subdirectories and rebuilding the
    /// in-memory level index. The global timestamp watermark is
    /// advanced to the maximum timestamp observed across all headers.
    pub fn open(base_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let mut levels = Vec::new();
        let mut max_timestamp = 0u64;
        let mut level_idx = 0;
        loop {
            let dir = base_dir.join(format!("level-{level_idx}"));
            if !dir.exists() {
                break;
            }
            let mut heads = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("sst") {
                    let head = SSTableHead::open(&path)?;
                    max_timestamp = max_timestamp.max(head.timestamp());
                    heads.push(head);
                }
            }
            heads.sort_by_key(|h| h.timestamp());
            levels.push(Level { dir, heads });
            level_idx += 1;
        }

        info!(
            base_dir = %base_dir.display(),
            levels = levels.len(),
            watermark = max_timestamp,
            "opened engine"
        );

        Ok(Engine {
            base_dir,
            config,
            memtable: Memtable::new(),
            levels,
            timestamp: max_timestamp,
        })
    }

    fn next_timestamp(&mut self) -> u64 {
        self.timestamp += 1;
        self.timestamp
    }

    /// Inserts or overwrites `key` with `value`, flushing the memtable
    /// first if this write would push it past the flush threshold.
    pub fn put(&mut self, key: u64, value: Vec<u8>) -> Result<()> {
        let projected = self.memtable.projected_byte_size_with(key, &value)?;
        if projected > self.config.flush_threshold && !self.memtable.is_empty()? {
            self.flush()?;
        }
        self.memtable.insert(key, value)?;
        Ok(())
    }

    /// Returns the live value for `key`, or `None` if absent or tombstoned.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.memtable.search(key)? {
            return Ok(if value == TOMBSTONE { None } else { Some(value) });
        }

        let mut best: Option<(u64, Vec<u8>)> = None;
        for level in &self.levels {
            for head in &level.heads {
                if let Some(value) = head.get(key) {
                    let ts = head.timestamp();
                    if best.as_ref().is_none_or(|(best_ts, _)| ts > *best_ts) {
                        best = Some((ts, value));
                    }
                }
            }
        }
        match best {
            Some((_, value)) if value != TOMBSTONE => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Deletes `key`. Returns whether it was previously live.
    pub fn del(&mut self, key: u64) -> Result<bool> {
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        self.put(key, TOMBSTONE.to_vec())?;
        Ok(true)
    }

    /// Returns every live `(key, value)` pair with `lo <= key <= hi`,
    /// ascending, newest version per key.
    pub fn scan(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        // (key asc, timestamp desc) ordering via a min-heap over
        // Reverse-wrapped candidates, draining one distinct key at a time.
        #[derive(Eq, PartialEq)]
        struct Candidate {
            key: u64,
            timestamp: u64,
            value: Vec<u8>,
        }
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // min-heap on key ascending, then timestamp descending
                other
                    .key
                    .cmp(&self.key)
                    .then_with(|| self.timestamp.cmp(&other.timestamp))
            }
        }
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap = BinaryHeap::new();
        for (key, value) in self.memtable.scan(lo, hi)? {
            heap.push(Candidate {
                key,
                timestamp: u64::MAX,
                value,
            });
        }
        for level in &self.levels {
            for head in &level.heads {
                for (key, value) in head.scan(lo, hi) {
                    heap.push(Candidate {
                        key,
                        timestamp: head.timestamp(),
                        value,
                    });
                }
            }
        }

        let mut out = Vec::new();
        let mut last_key: Option<u64> = None;
        while let Some(candidate) = heap.pop() {
            if last_key == Some(candidate.key) {
                continue;
            }
            last_key = Some(candidate.key);
            if candidate.value != TOMBSTONE {
                out.push((candidate.key, candidate.value));
            }
        }
        Ok(out)
    }

    /// Clears the memtable and deletes every level's files and directory
    /// entries.
    pub fn reset(&mut self) -> Result<()> {
        self.memtable.reset()?;
        for level in &self.levels {
            if level.dir.exists() {
                fs::remove_dir_all(&level.dir)?;
            }
        }
        self.levels.clear();
        Ok(())
    }

    /// Flushes the current memtable into a new level-0 sstable (if
    /// non-empty) and runs compaction.
    pub fn flush(&mut self) -> Result<()> {
        if self.memtable.is_empty()? {
            return Ok(());
        }
        if self.levels.is_empty() {
            let dir = self.base_dir.join("level-0");
            fs::create_dir_all(&dir)?;
            self.levels.push(Level {
                dir,
                heads: Vec::new(),
            });
        }

        let timestamp = self.next_timestamp();
        let entries = self.memtable.iter_for_flush()?;
        let mut builder = SSTableBuilder::new(timestamp);
        for (key, value) in entries {
            builder.push(key, value);
        }
        let suffix = compaction::next_file_suffix(&self.levels[0].dir)?;
        let path = self.levels[0].dir.join(format!("{timestamp}-{suffix}.sst"));
        builder.write_to(&path)?;
        let head = SSTableHead::open(&path)?;
        trace!(timestamp, path = %path.display(), "flushed memtable to level 0");
        self.levels[0].heads.push(head);
        self.memtable.reset()?;

        compaction::compact(&mut self.levels, &self.base_dir)?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "failed to flush memtable on engine drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(1, b"SE".to_vec()).unwrap();
        assert_eq!(engine.get(1).unwrap(), Some(b"SE".to_vec()));
    }

    #[test]
    fn del_then_get_is_empty() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(1, b"SE".to_vec()).unwrap();
        assert!(engine.del(1).unwrap());
        assert_eq!(engine.get(1).unwrap(), None);
        assert!(!engine.del(1).unwrap());
    }

    #[test]
    fn flush_survives_across_reads() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(
            dir.path(),
            EngineConfig {
                flush_threshold: 200,
            },
        )
        .unwrap();
        for i in 0..50u64 {
            engine.put(i, vec![b'x'; 10]).unwrap();
        }
        for i in 0..50u64 {
            assert_eq!(engine.get(i).unwrap(), Some(vec![b'x'; 10]), "key {i}");
        }
        assert!(!engine.levels.is_empty());
    }

    #[test]
    fn scan_returns_ascending_live_values() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        for i in 0..10u64 {
            engine.put(i, vec![i as u8]).unwrap();
        }
        engine.del(3).unwrap();
        let got = engine.scan(0, 9).unwrap();
        let keys: Vec<u64> = got.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn newest_value_wins_after_flush_and_overwrite() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(
            dir.path(),
            EngineConfig {
                flush_threshold: 100,
            },
        )
        .unwrap();
        engine.put(1, vec![b'a'; 20]).unwrap();
        for i in 0..20u64 {
            engine.put(100 + i, vec![b'x'; 20]).unwrap();
        }
        engine.put(1, vec![b'b'; 20]).unwrap();
        assert_eq!(engine.get(1).unwrap(), Some(vec![b'b'; 20]));
    }

    #[test]
    fn reset_clears_all_state() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::open(
            dir.path(),
            EngineConfig {
                flush_threshold: 100,
            },
        )
        .unwrap();
        for i in 0..20u64 {
            engine.put(i, vec![b'x'; 20]).unwrap();
        }
        engine.reset().unwrap();
        assert_eq!(engine.get(0).unwrap(), None);
        assert_eq!(engine.scan(0, 20).unwrap().len(), 0);
    }

    #[test]
    fn reopen_rebuilds_levels_from_disk() {
        let dir = tempdir().unwrap();
        {
            let mut engine = Engine::open(
                dir.path(),
                EngineConfig {
                    flush_threshold: 100,
                },
            )
            .unwrap();
            for i in 0..20u64 {
                engine.put(i, vec![b'x'; 20]).unwrap();
            }
            engine.flush().unwrap();
        }
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        for i in 0..20u64 {
            assert_eq!(engine.get(i).unwrap(), Some(vec![b'x'; 20]), "key {i}");
        }
    }
}
