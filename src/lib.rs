//! # vekv
//!
//! An embeddable key-value store with an attached vector similarity
//! index, built on a **Log-Structured Merge Tree (LSM-tree)** for byte
//! values and a parallel append-only log plus HNSW graph for vectors.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Store                           │
//! │  ┌────────────────────┐   ┌─────────────────────────┐ │
//! │  │       Engine        │   │        KVecTable         │ │
//! │  │  Memtable (skiplist) │   │  append-only vector log  │ │
//! │  │  + leveled SSTables  │   │  + parallel flush        │ │
//! │  │  + leveled compaction│   └──────────┬──────────────┘ │
//! │  └─────────┬───────────┘              │                │
//! │            │                  ┌────────▼───────────┐    │
//! │            │                  │        Hnsw          │    │
//! │            │                  │  layered proximity    │    │
//! │            │                  │  graph, opt-in ANN     │    │
//! │            │                  └────────────────────┘    │
//! │            └──────────────┬─────────────────────────────┘
//! │                           │ hydrate byte values by key
//! └───────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Top-level composition: byte values, vectors, and ANN search behind one API |
//! | [`engine`] | LSM key-value engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | Skiplist write buffer ordered for sstable flush |
//! | [`sstable`] | Immutable, fixed-offset, bloom-filtered on-disk tables |
//! | [`compaction`] | Leveled compaction that merges overflowing levels downward |
//! | [`vector`] | Append-only key-to-vector log with segmented, parallel-flushed persistence |
//! | [`hnsw`] | Hierarchical Navigable Small World approximate nearest-neighbor graph |
//! | [`embedding`] | Pluggable text-to-vector adapter trait |
//! | [`encoding`] | Minimal fixed-width binary codec shared by every on-disk format |
//!
//! ## Key Features
//!
//! - **Skiplist memtable** — ordered writes with no write-ahead log;
//!   durability comes from sstable immutability once flushed.
//! - **Fixed-offset sstables** — deterministic byte layout with a
//!   10 KiB bloom filter per table for fast negative lookups.
//! - **Leveled compaction** — each level holds at most `2^(level+1)`
//!   tables before the oldest overflow is merged into the next level.
//! - **Parallel vector flush** — the vector log fans its flush out
//!   across worker threads, one per disjoint chunk of pending writes.
//! - **Two search paths** — an always-correct brute-force cosine scan
//!   and an opt-in HNSW index for larger vector sets.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vekv::store::{Store, StoreConfig};
//! use vekv::embedding::ClosureEmbedder;
//!
//! let mut store = Store::open("/tmp/my_db", StoreConfig::default()).unwrap();
//!
//! store.put(1, b"hello".to_vec()).unwrap();
//! assert_eq!(store.get(1).unwrap(), Some(b"hello".to_vec()));
//!
//! store.put_vector(1, vec![1.0, 0.0, 0.0]).unwrap();
//! let embedder = ClosureEmbedder::new(|_text: &str| Ok(vec![1.0, 0.0, 0.0]));
//! let hits = store.search_knn("hello", 5, &embedder).unwrap();
//! assert_eq!(hits[0].0, 1);
//!
//! store.del(1).unwrap();
//! assert_eq!(store.get(1).unwrap(), None);
//! ```

#![allow(dead_code)]

pub mod compaction;
pub mod embedding;
pub mod encoding;
pub mod engine;
pub mod hnsw;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod vector;
