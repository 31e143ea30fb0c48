//! Hierarchical Navigable Small World (HNSW) approximate nearest-neighbor
//! graph index over fixed-dimensional float vectors.
//!
//! Nodes live in a flat arena and are referenced by index rather than
//! pointer, so the layered, cyclic neighbor graph needs no unsafe code
//! or reference counting. Deletion is logical: an erased (key, vector)
//! pair is recorded in a tombstone list and skipped during traversal,
//! but its edges remain in place as routing scaffolding for the rest of
//! the graph.
//!
//! Distance is `1 - cosine_similarity`, with an explicit convention for
//! zero vectors: two zero vectors are maximally similar (similarity 1),
//! a zero vector compared to a non-zero one is maximally dissimilar
//! (similarity 0).

pub mod persist;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use thiserror::Error;
use tracing::trace;

/// Errors produced by HNSW operations.
#[derive(Debug, Error)]
pub enum HnswError {
    /// A vector's dimension did not match the graph's established dimension.
    #[error("dimension mismatch: graph dim {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A vector contained a NaN or infinite component.
    #[error("vector contains a non-finite component")]
    NonFiniteVector,

    /// Persistence I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data was structurally inconsistent.
    #[error("corrupt HNSW persistence data: {0}")]
    Corrupt(String),
}

impl From<crate::encoding::EncodingError> for HnswError {
    fn from(e: crate::encoding::EncodingError) -> Self {
        HnswError::Corrupt(e.to_string())
    }
}

type Result<T> = std::result::Result<T, HnswError>;

/// Construction and search parameters.
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Target number of bidirectional neighbors made per insertion.
    pub m: usize,
    /// Hard cap on neighbors per node per layer.
    pub m_max: usize,
    /// Candidate pool size used during both insertion and query search.
    pub ef_construction: usize,
    /// Layer-assignment scale: larger values produce taller towers.
    pub m_l: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        HnswConfig {
            m: 24,
            m_max: 38,
            ef_construction: 30,
            m_l: 6.0,
        }
    }
}

struct Node {
    key: u64,
    vec: Vec<f32>,
    max_layer: usize,
    /// `neighbors[layer]` is the neighbor-index list at that layer.
    neighbors: Vec<Vec<usize>>,
}

/// A layered proximity graph supporting insert, logical erase, and
/// top-k nearest-neighbor query.
pub struct Hnsw {
    config: HnswConfig,
    nodes: Vec<Node>,
    deleted: Vec<(u64, Vec<f32>)>,
    entry_point: Option<usize>,
    top_layer: usize,
    dim: usize,
    rng: Rng,
}

struct Rng(u64);

impl Rng {
    fn new() -> Self {
        let x = 0u8;
        Rng((&x as *const u8 as u64) ^ 0xD1B54A32D192ED03 | 1)
    }

    fn next_f64(&mut self) -> f64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        // map to (0, 1]
        ((x >> 11) as f64 + 1.0) / ((1u64 << 53) as f64 + 1.0)
    }
}

impl Hnsw {
    /// Creates an empty graph with the given parameters.
    pub fn new(config: HnswConfig) -> Self {
        Hnsw {
            config,
            nodes: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            top_layer: 0,
            dim: 0,
            rng: Rng::new(),
        }
    }

    /// Number of nodes ever inserted (including logically deleted ones).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn random_layer(&mut self) -> usize {
        let u = self.rng.next_f64();
        (-u.ln() * self.config.m_l).floor() as usize
    }

    fn validate_vec(&self, vec: &[f32]) -> Result<()> {
        if self.dim != 0 && vec.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: vec.len(),
            });
        }
        if vec.iter().any(|v| !v.is_finite()) {
            return Err(HnswError::NonFiniteVector);
        }
        Ok(())
    }

    fn is_deleted_node(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        self.deleted.iter().any(|(k, v)| *k == node.key && v == &node.vec)
    }

    fn find_node_index(&self, key: u64) -> Option<usize> {
        self.nodes.iter().position(|n| n.key == key && !self.is_deleted_for(n))
    }

    fn is_deleted_for(&self, node: &Node) -> bool {
        self.deleted.iter().any(|(k, v)| *k == node.key && v == &node.vec)
    }

    /// Inserts `(key, vec)`. If `key` already has a live node, it is
    /// logically erased first, then the new vector is inserted fresh
    /// (re-inserting a previously erased `(key, vec)` pair also revives
    /// it by removing it from the tombstone list).
    pub fn insert(&mut self, key: u64, vec: Vec<f32>) -> Result<()> {
        self.validate_vec(&vec)?;
        if self.dim == 0 {
            self.dim = vec.len();
        }

        if let Some(existing) = self.find_node_index(key) {
            let existing_vec = self.nodes[existing].vec.clone();
            self.deleted.push((key, existing_vec));
        }
        self.deleted.retain(|(k, v)| !(*k == key && v == &vec));

        let layer = self.random_layer();

        if self.nodes.is_empty() {
            self.nodes.push(Node {
                key,
                vec,
                max_layer: layer,
                neighbors: vec![Vec::new(); layer + 1],
            });
            self.entry_point = Some(0);
            self.top_layer = layer;
            trace!(key, layer, "inserted first HNSW node");
            return Ok(());
        }

        let new_idx = self.nodes.len();
        self.nodes.push(Node {
            key,
            vec: vec.clone(),
            max_layer: layer,
            neighbors: vec![Vec::new(); layer + 1],
        });

        let mut ep = self.entry_point.expect("non-empty graph has an entry point");
        for l in ((layer + 1)..=self.top_layer).rev() {
            ep = self.search_layer_greedy(&vec, l, ep);
        }

        for l in (0..=layer.min(self.top_layer)).rev() {
            let candidates = self.search_layer(&vec, l, Some(ep), self.config.ef_construction);
            let chosen: Vec<usize> = candidates
                .into_iter()
                .take(self.config.m)
                .map(|c| c.idx)
                .collect();
            if let Some(&closest) = chosen.first() {
                ep = closest;
            }
            for &neighbor_idx in &chosen {
                self.connect(new_idx, neighbor_idx, l);
            }
        }

        if layer > self.top_layer {
            self.top_layer = layer;
            self.entry_point = Some(new_idx);
        }

        trace!(key, layer, "inserted HNSW node");
        Ok(())
    }

    /// Logically removes `(key, vec)`: the pair is recorded as deleted
    /// and skipped by future traversals, but its edges are left intact.
    pub fn erase(&mut self, key: u64, vec: &[f32]) {
        self.deleted.push((key, vec.to_vec()));
    }

    fn connect(&mut self, a: usize, b: usize, layer: usize) {
        if !self.nodes[a].neighbors[layer].contains(&b) {
            self.nodes[a].neighbors[layer].push(b);
        }
        if !self.nodes[b].neighbors[layer].contains(&a) {
            self.nodes[b].neighbors[layer].push(a);
        }
        self.prune_if_overflowing(a, layer);
        self.prune_if_overflowing(b, layer);
    }

    fn prune_if_overflowing(&mut self, idx: usize, layer: usize) {
        if self.nodes[idx].neighbors[layer].len() <= self.config.m_max {
            return;
        }
        let anchor = self.nodes[idx].vec.clone();
        let neighbors = self.nodes[idx].neighbors[layer].clone();
        let farthest = neighbors
            .iter()
            .copied()
            .max_by(|&a, &b| {
                distance(&anchor, &self.nodes[a].vec)
                    .partial_cmp(&distance(&anchor, &self.nodes[b].vec))
                    .unwrap_or(Ordering::Equal)
            })
            .expect("overflowing neighbor list is non-empty");
        self.nodes[idx].neighbors[layer].retain(|&n| n != farthest);
        self.nodes[farthest].neighbors[layer].retain(|&n| n != idx);
    }

    /// Single-pass greedy descent: repeatedly hop to the live neighbor
    /// strictly closer to `query` than the current point, starting from
    /// `entry`.
    fn search_layer_greedy(&self, query: &[f32], layer: usize, entry: usize) -> usize {
        let mut current = entry;
        let mut current_dist = distance(query, &self.nodes[current].vec);
        loop {
            let mut moved = false;
            if layer < self.nodes[current].neighbors.len() {
                for &neighbor in &self.nodes[current].neighbors[layer].clone() {
                    if self.is_deleted_node(neighbor) {
                        continue;
                    }
                    let d = distance(query, &self.nodes[neighbor].vec);
                    if d < current_dist {
                        current = neighbor;
                        current_dist = d;
                        moved = true;
                    }
                }
            }
            if !moved {
                return current;
            }
        }
    }

    /// Best-first search at `layer`, seeded from `entry` if given
    /// (falling back to the graph's global entry point only when none
    /// is supplied — unlike the buggy original this never silently
    /// discards a caller-supplied entry point), bounded to `ef`
    /// candidates.
    fn search_layer(&self, query: &[f32], layer: usize, entry: Option<usize>, ef: usize) -> Vec<ScoredNode> {
        let Some(start) = entry.or(self.entry_point) else {
            return Vec::new();
        };

        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(start);

        let start_dist = distance(query, &self.nodes[start].vec);
        let mut candidates: BinaryHeap<MinScored> = BinaryHeap::new();
        candidates.push(MinScored(ScoredNode { idx: start, dist: start_dist }));

        let mut results: BinaryHeap<MaxScored> = BinaryHeap::new();
        if !self.is_deleted_node(start) {
            results.push(MaxScored(ScoredNode { idx: start, dist: start_dist }));
        }

        while let Some(MinScored(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(MaxScored(worst)) = results.peek() {
                    if current.dist > worst.dist {
                        break;
                    }
                }
            }

            if layer > self.nodes[current.idx].max_layer {
                continue;
            }
            for &neighbor in &self.nodes[current.idx].neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = distance(query, &self.nodes[neighbor].vec);
                let improves = results.len() < ef
                    || results
                        .peek()
                        .is_some_and(|MaxScored(worst)| d < worst.dist);
                if improves {
                    candidates.push(MinScored(ScoredNode { idx: neighbor, dist: d }));
                    if !self.is_deleted_node(neighbor) {
                        results.push(MaxScored(ScoredNode { idx: neighbor, dist: d }));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<ScoredNode> = results.into_iter().map(|MaxScored(s)| s).collect();
        out.sort_by(|a, b| a.dist.partial_cmp(&b.dist).unwrap_or(Ordering::Equal));
        out
    }

    /// Returns up to `k` keys whose vectors are closest to `query`,
    /// skipping logically-deleted nodes.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<u64>> {
        if self.dim != 0 && query.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };
        for l in (1..=self.top_layer).rev() {
            ep = self.search_layer_greedy(query, l, ep);
        }
        let results = self.search_layer(query, 0, Some(ep), self.config.ef_construction);
        Ok(results.into_iter().take(k).map(|s| self.nodes[s.idx].key).collect())
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn config(&self) -> HnswConfig {
        self.config
    }

    pub(crate) fn top_layer(&self) -> usize {
        self.top_layer
    }

    pub(crate) fn entry_point_raw(&self) -> Option<usize> {
        self.entry_point
    }

    pub(crate) fn deleted_list(&self) -> &[(u64, Vec<f32>)] {
        &self.deleted
    }

    pub(crate) fn node_key(&self, idx: usize) -> u64 {
        self.nodes[idx].key
    }

    pub(crate) fn node_vec(&self, idx: usize) -> &[f32] {
        &self.nodes[idx].vec
    }

    pub(crate) fn node_max_layer(&self, idx: usize) -> usize {
        self.nodes[idx].max_layer
    }

    pub(crate) fn node_neighbors(&self, idx: usize, layer: usize) -> &[usize] {
        &self.nodes[idx].neighbors[layer]
    }

    /// Reconstructs a graph directly from its persisted parts, bypassing
    /// `insert`. Used only by [`persist::load`].
    pub(crate) fn from_raw_parts(
        config: HnswConfig,
        dim: usize,
        nodes: Vec<(u64, Vec<f32>, Vec<Vec<usize>>)>,
        deleted: Vec<(u64, Vec<f32>)>,
        entry_point: Option<usize>,
        top_layer: usize,
    ) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(key, vec, neighbors)| Node {
                key,
                vec,
                max_layer: neighbors.len().saturating_sub(1),
                neighbors,
            })
            .collect();
        Hnsw {
            config,
            nodes,
            deleted,
            entry_point,
            top_layer,
            dim,
            rng: Rng::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct ScoredNode {
    idx: usize,
    dist: f32,
}

struct MinScored(ScoredNode);
impl PartialEq for MinScored {
    fn eq(&self, other: &Self) -> bool {
        self.0.dist == other.0.dist
    }
}
impl Eq for MinScored {}
impl PartialOrd for MinScored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MinScored {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the smallest distance first
        other.0.dist.partial_cmp(&self.0.dist).unwrap_or(Ordering::Equal)
    }
}

struct MaxScored(ScoredNode);
impl PartialEq for MaxScored {
    fn eq(&self, other: &Self) -> bool {
        self.0.dist == other.0.dist
    }
}
impl Eq for MaxScored {}
impl PartialOrd for MaxScored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MaxScored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dist.partial_cmp(&other.0.dist).unwrap_or(Ordering::Equal)
    }
}

/// Cosine distance `1 - cosine_similarity`, with the zero-vector
/// convention: two zero vectors have similarity 1 (distance 0); a zero
/// vector against a non-zero one has similarity 0 (distance 1).
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 && norm_b == 0.0 {
        1.0
    } else if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
