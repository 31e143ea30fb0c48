//! Binary persistence for [`super::Hnsw`].
//!
//! Layout, relative to a root directory:
//!
//! ```text
//! global_header.bin      u32 M, M_max, ef_construction, m_L, top_layer, node_count, dim
//! deleted_nodes.bin      (u64 key, f32 vec[dim]) *
//! nodes/<i>/header.bin   u32 max_layer, u64 key, f32 vec[dim]
//! nodes/<i>/edges/<l>.bin  u32 num_neighbors, u32 neighbors[num_neighbors]
//! ```
//!
//! [`save`] removes any pre-existing contents of the target directory
//! before writing. [`load`] is the exact inverse and then clears the
//! directory, matching the destructive rotate-on-load semantics used
//! elsewhere in the crate's persistence (see [`crate::vector`]).

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::encoding::{Decode, Encode};

use super::{Hnsw, HnswConfig, HnswError};

type Result<T> = std::result::Result<T, HnswError>;

/// Serializes `graph` into `root`, overwriting any previous contents.
pub fn save(graph: &Hnsw, root: impl AsRef<Path>) -> Result<()> {
    let root = root.as_ref();
    if root.exists() {
        fs::remove_dir_all(root)?;
    }
    fs::create_dir_all(root)?;

    let dim = graph.dim();
    let config = graph.config();
    let mut header = Vec::new();
    (config.m as u32).encode_to(&mut header)?;
    (config.m_max as u32).encode_to(&mut header)?;
    (config.ef_construction as u32).encode_to(&mut header)?;
    (config.m_l as u32).encode_to(&mut header)?;
    (graph.top_layer() as u32).encode_to(&mut header)?;
    (graph.len() as u32).encode_to(&mut header)?;
    (dim as u32).encode_to(&mut header)?;
    File::create(root.join("global_header.bin"))?.write_all(&header)?;

    let mut deleted_buf = Vec::new();
    for (key, vec) in graph.deleted_list() {
        key.encode_to(&mut deleted_buf)?;
        for v in vec {
            v.encode_to(&mut deleted_buf)?;
        }
    }
    File::create(root.join("deleted_nodes.bin"))?.write_all(&deleted_buf)?;

    let nodes_dir = root.join("nodes");
    for i in 0..graph.len() {
        let node_dir = nodes_dir.join(i.to_string());
        let edges_dir = node_dir.join("edges");
        fs::create_dir_all(&edges_dir)?;

        let mut header_buf = Vec::new();
        (graph.node_max_layer(i) as u32).encode_to(&mut header_buf)?;
        graph.node_key(i).encode_to(&mut header_buf)?;
        for v in graph.node_vec(i) {
            v.encode_to(&mut header_buf)?;
        }
        File::create(node_dir.join("header.bin"))?.write_all(&header_buf)?;

        for layer in 0..=graph.node_max_layer(i) {
            let neighbors = graph.node_neighbors(i, layer);
            let mut buf = Vec::new();
            (neighbors.len() as u32).encode_to(&mut buf)?;
            for &n in neighbors {
                (n as u32).encode_to(&mut buf)?;
            }
            File::create(edges_dir.join(format!("{layer}.bin")))?.write_all(&buf)?;
        }
    }

    Ok(())
}

/// Loads a graph previously written by [`save`], then deletes `root`'s
/// contents (destructive rotate-on-load, matching the kvec table).
pub fn load(root: impl AsRef<Path>) -> Result<Hnsw> {
    let root = root.as_ref();
    let mut header_bytes = Vec::new();
    File::open(root.join("global_header.bin"))?.read_to_end(&mut header_bytes)?;
    let mut offset = 0;
    let (m, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (m_max, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (ef_construction, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (m_l, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (top_layer, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (node_count, c) = u32::decode_from(&header_bytes[offset..])?;
    offset += c;
    let (dim, _) = u32::decode_from(&header_bytes[offset..])?;
    let dim = dim as usize;

    let config = HnswConfig {
        m: m as usize,
        m_max: m_max as usize,
        ef_construction: ef_construction as usize,
        m_l: m_l as f64,
    };

    let mut deleted_bytes = Vec::new();
    File::open(root.join("deleted_nodes.bin"))?.read_to_end(&mut deleted_bytes)?;
    let mut deleted = Vec::new();
    let mut off = 0;
    let record_size = 8 + dim * 4;
    while off + record_size <= deleted_bytes.len() {
        let (key, c) = u64::decode_from(&deleted_bytes[off..])?;
        off += c;
        let mut vec = Vec::with_capacity(dim);
        for _ in 0..dim {
            let (v, c) = f32::decode_from(&deleted_bytes[off..])?;
            off += c;
            vec.push(v);
        }
        deleted.push((key, vec));
    }

    let mut nodes = Vec::with_capacity(node_count as usize);
    for i in 0..node_count as usize {
        let node_dir = root.join("nodes").join(i.to_string());
        let mut header_buf = Vec::new();
        File::open(node_dir.join("header.bin"))?.read_to_end(&mut header_buf)?;
        let (max_layer, c) = u32::decode_from(&header_buf)?;
        let mut off = c;
        let (key, c) = u64::decode_from(&header_buf[off..])?;
        off += c;
        let mut vec = Vec::with_capacity(dim);
        for _ in 0..dim {
            let (v, c) = f32::decode_from(&header_buf[off..])?;
            off += c;
            vec.push(v);
        }

        let mut neighbors = Vec::with_capacity(max_layer as usize + 1);
        for layer in 0..=max_layer {
            let mut buf = Vec::new();
            File::open(node_dir.join("edges").join(format!("{layer}.bin")))?.read_to_end(&mut buf)?;
            let (count, c) = u32::decode_from(&buf)?;
            let mut off = c;
            let mut layer_neighbors = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (n, c) = u32::decode_from(&buf[off..])?;
                off += c;
                layer_neighbors.push(n as usize);
            }
            neighbors.push(layer_neighbors);
        }

        nodes.push((key, vec, neighbors));
    }

    let entry_point = if nodes.is_empty() { None } else { Some(0) };
    let graph = Hnsw::from_raw_parts(config, dim, nodes, deleted, entry_point, top_layer as usize);

    fs::remove_dir_all(root)?;

    Ok(graph)
}
