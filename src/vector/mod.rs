//! Append-only log mapping keys to fixed-dimensional float vectors.
//!
//! [`KVecTable`] is the primary store behind vector search: every
//! `put`/`del` is appended to an in-memory log, and `flush` fans the log
//! out across parallel worker threads into numbered `<n>.kvec` segment
//! files. Loading a table back in from disk is deliberately destructive:
//! each segment is replayed into memory and then unlinked, so the
//! on-disk state is always a clean snapshot of whatever was flushed
//! since the last load.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{Decode, Encode, EncodingError};

/// Errors produced by kvec table operations.
#[derive(Debug, Error)]
pub enum KVecError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment file's record stream was malformed.
    #[error("corrupt kvec segment: {0}")]
    Corrupt(String),

    /// A vector had a different dimension than the table's established one.
    #[error("dimension mismatch: table dim {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The internal lock was poisoned by a panicking thread.
    #[error("kvec table lock poisoned")]
    LockPoisoned,
}

impl From<EncodingError> for KVecError {
    fn from(e: EncodingError) -> Self {
        KVecError::Corrupt(e.to_string())
    }
}

type Result<T> = std::result::Result<T, KVecError>;

/// Default number of worker threads used by [`KVecTable::flush`].
pub const DEFAULT_FLUSH_THREADS: usize = 4;

#[derive(Clone)]
enum LogEntry {
    Put(u64, Vec<f32>),
    Del(u64),
}

struct Inner {
    dim: usize,
    log: Vec<LogEntry>,
    live_keys: HashSet<u64>,
}

/// Append-only (key, vector) store with segmented disk persistence.
pub struct KVecTable {
    inner: RwLock<Inner>,
    flush_threads: usize,
}

impl KVecTable {
    /// Creates an empty table. `dim` is established lazily from the
    /// first vector put.
    pub fn new() -> Self {
        KVecTable {
            inner: RwLock::new(Inner {
                dim: 0,
                log: Vec::new(),
                live_keys: HashSet::new(),
            }),
            flush_threads: DEFAULT_FLUSH_THREADS,
        }
    }

    /// Sets how many worker threads [`Self::flush`] uses.
    pub fn with_flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads.max(1);
        self
    }

    /// Appends `(key, vec)`. The first call establishes the table's
    /// dimension; later calls with a mismatched length are rejected.
    pub fn put(&self, key: u64, vec: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| KVecError::LockPoisoned)?;
        if inner.dim == 0 {
            inner.dim = vec.len();
        } else if vec.len() != inner.dim {
            return Err(KVecError::DimensionMismatch {
                expected: inner.dim,
                actual: vec.len(),
            });
        }
        inner.live_keys.insert(key);
        inner.log.push(LogEntry::Put(key, vec));
        Ok(())
    }

    /// Marks `key` deleted by appending a delete-sentinel record.
    pub fn del(&self, key: u64) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| KVecError::LockPoisoned)?;
        inner.live_keys.remove(&key);
        inner.log.push(LogEntry::Del(key));
        Ok(())
    }

    /// Returns the vector last recorded for `key`, or `None` if the key
    /// was never put or was deleted.
    pub fn get(&self, key: u64) -> Result<Option<Vec<f32>>> {
        let inner = self.inner.read().map_err(|_| KVecError::LockPoisoned)?;
        if !inner.live_keys.contains(&key) {
            return Ok(None);
        }
        for entry in inner.log.iter().rev() {
            match entry {
                LogEntry::Put(k, v) if *k == key => return Ok(Some(v.clone())),
                LogEntry::Del(k) if *k == key => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Every key currently considered live.
    pub fn live_keys(&self) -> Result<Vec<u64>> {
        let inner = self.inner.read().map_err(|_| KVecError::LockPoisoned)?;
        Ok(inner.live_keys.iter().copied().collect())
    }

    /// The vector dimension established by the first `put`, or 0 if
    /// nothing has been put yet.
    pub fn dim(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(|_| KVecError::LockPoisoned)?.dim)
    }

    /// Writes the in-memory log to `root` as one or more `<n>.kvec`
    /// segment files, fanned out across up to `flush_threads` worker
    /// threads over disjoint chunks of the log. A no-op if the log is
    /// empty or no dimension has been established.
    pub fn flush(&self, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        let (dim, chunks) = {
            let inner = self.inner.read().map_err(|_| KVecError::LockPoisoned)?;
            if inner.dim == 0 || inner.log.is_empty() {
                return Ok(());
            }
            let chunk_count = self.flush_threads.min(inner.log.len()).max(1);
            let chunk_size = inner.log.len().div_ceil(chunk_count);
            let chunks: Vec<Vec<LogEntry>> = inner
                .log
                .chunks(chunk_size)
                .map(<[LogEntry]>::to_vec)
                .collect();
            (inner.dim, chunks)
        };

        fs::create_dir_all(root)?;
        let next_suffix = next_segment_number(root)?;

        let results: Vec<std::result::Result<(), KVecError>> = crossbeam::scope(|scope| {
            let mut handles = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                let path = root.join(format!("{}.kvec", next_suffix + i as u64));
                handles.push(scope.spawn(move |_| write_segment(&path, dim, chunk)));
            }
            handles.into_iter().map(|h| h.join().unwrap_or_else(|_| {
                Err(KVecError::Corrupt("kvec flush worker panicked".into()))
            })).collect()
        })
        .map_err(|_| KVecError::Corrupt("kvec flush thread scope panicked".into()))?;

        for r in results {
            r?;
        }

        info!(root = %root.display(), dim, "flushed kvec log");
        Ok(())
    }

    /// Loads every `<n>.kvec` segment under `root` in ascending numeric
    /// order, replaying each record into the in-memory state, then
    /// deletes the file. This is a destructive rotate-on-load: calling
    /// [`Self::flush`] again afterward starts a fresh segment sequence.
    pub fn load(&self, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        if !root.exists() {
            return Ok(());
        }
        let mut segments = list_segments(root)?;
        segments.sort();

        for path in segments {
            let entries = read_segment(&path)?;
            let mut inner = self.inner.write().map_err(|_| KVecError::LockPoisoned)?;
            for (key, vec) in entries {
                if inner.dim == 0 {
                    inner.dim = vec.len();
                }
                if is_delete_vec(&vec) {
                    inner.live_keys.remove(&key);
                    inner.log.push(LogEntry::Del(key));
                } else {
                    inner.live_keys.insert(key);
                    inner.log.push(LogEntry::Put(key, vec));
                }
            }
            drop(inner);
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "loaded and removed kvec segment");
        }
        Ok(())
    }

    /// Clears all in-memory state and deletes every file under `root`.
    pub fn reset(&self, root: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| KVecError::LockPoisoned)?;
        inner.dim = 0;
        inner.log.clear();
        inner.live_keys.clear();
        drop(inner);
        let root = root.as_ref();
        if root.exists() {
            for path in list_segments(root)? {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }
}

impl Default for KVecTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A vector of `dim` copies of the largest finite `f32`, used as the
/// on-disk delete sentinel.
pub fn delete_sentinel(dim: usize) -> Vec<f32> {
    vec![f32::MAX; dim]
}

fn is_delete_vec(vec: &[f32]) -> bool {
    !vec.is_empty() && vec.iter().all(|v| *v == f32::MAX)
}

fn write_segment(path: &Path, dim: usize, entries: &[LogEntry]) -> Result<()> {
    let mut buf = Vec::new();
    (dim as u64).encode_to(&mut buf)?;
    for entry in entries {
        match entry {
            LogEntry::Put(key, vec) => {
                key.encode_to(&mut buf)?;
                for v in vec {
                    v.encode_to(&mut buf)?;
                }
            }
            LogEntry::Del(key) => {
                key.encode_to(&mut buf)?;
                for v in delete_sentinel(dim) {
                    v.encode_to(&mut buf)?;
                }
            }
        }
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

fn read_segment(path: &Path) -> Result<Vec<(u64, Vec<f32>)>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 8 {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        return Err(KVecError::Corrupt("segment shorter than dim header".into()));
    }
    let (dim, mut offset) = u64::decode_from(&bytes)?;
    let dim = dim as usize;
    let record_size = 8 + dim * 4;
    let mut out = Vec::new();
    while offset + record_size <= bytes.len() {
        let (key, consumed) = u64::decode_from(&bytes[offset..])?;
        offset += consumed;
        let mut vec = Vec::with_capacity(dim);
        for _ in 0..dim {
            let (v, consumed) = f32::decode_from(&bytes[offset..])?;
            offset += consumed;
            vec.push(v);
        }
        out.push((key, vec));
    }
    if offset != bytes.len() {
        warn!(path = %path.display(), trailing = bytes.len() - offset, "ignoring partial trailing kvec record");
    }
    Ok(out)
}

fn list_segments(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("kvec") {
            out.push(path);
        }
    }
    out.sort_by_key(|p| {
        p.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    });
    Ok(out)
}

fn next_segment_number(root: &Path) -> Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut max_seen = 0u64;
    for path in list_segments(root)? {
        if let Some(n) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            max_seen = max_seen.max(n + 1);
        }
    }
    Ok(max_seen)
}
