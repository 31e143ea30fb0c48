//! Top-level composition of the LSM engine, vector log, and HNSW index
//! behind a single embedded API.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::embedding::{EmbeddingError, Embedder};
use crate::engine::{Engine, EngineConfig, EngineError};
use crate::hnsw::{self, Hnsw, HnswConfig, HnswError};
use crate::vector::{KVecError, KVecTable};

/// Errors surfaced by [`Store`], wrapping every subsystem's own error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key/value engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The vector log failed.
    #[error(transparent)]
    KVec(#[from] KVecError),

    /// The HNSW index failed.
    #[error(transparent)]
    Hnsw(#[from] HnswError),

    /// The embedding adapter failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Construction parameters for [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Configuration for the underlying LSM engine.
    pub engine: EngineConfig,
    /// Configuration for the HNSW index.
    pub hnsw: HnswConfig,
    /// Number of worker threads used to flush the vector log.
    pub kvec_flush_threads: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            engine: EngineConfig::default(),
            hnsw: HnswConfig::default(),
            kvec_flush_threads: crate::vector::DEFAULT_FLUSH_THREADS,
        }
    }
}

const KVEC_DIR: &str = "embedding_data";
const HNSW_DIR: &str = "hnsw_data";

/// Embedded key-value store with an attached vector similarity index.
pub struct Store {
    base_dir: PathBuf,
    engine: Engine,
    kvec: KVecTable,
    hnsw: Hnsw,
}

impl Store {
    /// Opens (or creates) a store rooted at `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let engine = Engine::open(&base_dir, config.engine)?;
        let kvec = KVecTable::new().with_flush_threads(config.kvec_flush_threads);
        let hnsw = Hnsw::new(config.hnsw);
        info!(base_dir = %base_dir.display(), "opened store");
        Ok(Store {
            base_dir,
            engine,
            kvec,
            hnsw,
        })
    }

    /// Inserts or overwrites the byte value stored under `key`.
    pub fn put(&mut self, key: u64, value: Vec<u8>) -> Result<()> {
        Ok(self.engine.put(key, value)?)
    }

    /// Records `vec` as the vector associated with `key`.
    pub fn put_vector(&mut self, key: u64, vec: Vec<f32>) -> Result<()> {
        self.kvec.put(key, vec)?;
        Ok(())
    }

    /// Returns the byte value stored under `key`, if live.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.engine.get(key)?)
    }

    /// Deletes `key` from the byte store, forwarding to the vector log
    /// only when the byte key was actually live.
    /// Returns whether the byte-valued key was previously live.
    pub fn del(&mut self, key: u64) -> Result<bool> {
        let existed = self.engine.del(key)?;
        if existed {
            self.kvec.del(key)?;
        }
        Ok(existed)
    }

    /// Returns every live `(key, value)` pair with `lo <= key <= hi`.
    pub fn scan(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        Ok(self.engine.scan(lo, hi)?)
    }

    /// Clears the byte store and the vector log (HNSW index is
    /// unaffected; callers managing a graph alongside should reset it
    /// themselves if desired).
    pub fn reset(&mut self) -> Result<()> {
        self.engine.reset()?;
        self.kvec.reset(self.base_dir.join(KVEC_DIR))?;
        Ok(())
    }

    /// Loads a previously flushed vector log from disk (destructive:
    /// loaded segment files are removed after replay).
    pub fn load_embedding_from_disk(&mut self) -> Result<()> {
        self.kvec.load(self.base_dir.join(KVEC_DIR))?;
        Ok(())
    }

    /// Inserts `vec` under `key` into the HNSW index.
    pub fn hnsw_insert(&mut self, key: u64, vec: Vec<f32>) -> Result<()> {
        self.hnsw.insert(key, vec)?;
        Ok(())
    }

    /// Logically removes `(key, vec)` from the HNSW index.
    pub fn hnsw_erase(&mut self, key: u64, vec: &[f32]) {
        self.hnsw.erase(key, vec);
    }

    /// Brute-force cosine-similarity search: embeds `text`, scores it
    /// against every live key in the vector log, and hydrates the top-k
    /// byte values via the key/value engine.
    pub fn search_knn(&self, text: &str, k: usize, embedder: &dyn Embedder) -> Result<Vec<(u64, Vec<u8>)>> {
        let query = embedder.embed(text)?;
        self.search_knn_vector(&query, k)
    }

    /// Same as [`Self::search_knn`] but takes an already-computed query vector.
    pub fn search_knn_vector(&self, query: &[f32], k: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut scored: Vec<(u64, f32)> = Vec::new();
        for key in self.kvec.live_keys()? {
            if let Some(vec) = self.kvec.get(key)? {
                let sim = 1.0 - hnsw::distance(&query, &vec);
                scored.push((key, sim));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut out = Vec::new();
        for (key, _) in scored.into_iter().take(k) {
            if let Some(value) = self.get(key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// HNSW-backed approximate nearest-neighbor search: an opt-in faster
    /// alternative to [`Self::search_knn`] for large vector logs.
    pub fn search_knn_hnsw(&self, text: &str, k: usize, embedder: &dyn Embedder) -> Result<Vec<(u64, Vec<u8>)>> {
        let query = embedder.embed(text)?;
        let keys = self.hnsw.query(&query, k)?;
        let mut out = Vec::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Flushes the memtable and persists the vector log. Called
    /// automatically on drop, but exposed for explicit checkpointing.
    pub fn flush(&mut self) -> Result<()> {
        self.engine.flush()?;
        self.kvec.flush(self.base_dir.join(KVEC_DIR))?;
        Ok(())
    }

    /// Persists the HNSW index to `hnsw_data` under the base directory.
    pub fn persist_hnsw(&self) -> Result<()> {
        hnsw::persist::save(&self.hnsw, self.base_dir.join(HNSW_DIR))?;
        Ok(())
    }

    /// Loads a previously persisted HNSW index, replacing the in-memory
    /// graph (destructive: the on-disk dump is removed after loading).
    pub fn load_hnsw(&mut self) -> Result<()> {
        self.hnsw = hnsw::persist::load(self.base_dir.join(HNSW_DIR))?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "failed to flush store on drop");
        }
    }
}
