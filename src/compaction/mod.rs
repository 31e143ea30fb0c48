//! Size-tiered-at-L0, leveled-beyond compaction over sstable levels.
//!
//! Compaction proceeds level by level starting at L0: whenever a level
//! holds more sstables than its soft limit `2^(L+1)`, the oldest
//! overflowing heads ("victims") are merged with any overlapping heads
//! from the next level, and the result is written out as new sstables
//! one level down. Tombstones are dropped only once they reach the
//! bottom level, since an older value could otherwise resurrect once
//! its shadowing tombstone disappears.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::sstable::{SSTableBuilder, SSTableError, SSTableHead};

/// Value that marks a key as logically deleted.
pub const TOMBSTONE: &[u8] = b"~DELETED~";

/// Errors produced while compacting.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A victim or merged sstable failed to read or write.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),
}

type Result<T> = std::result::Result<T, CompactionError>;

/// Number of oldest heads picked as victims when level 0 overflows.
pub const L0_BATCH_SIZE: usize = 3;

/// Soft cardinality limit for level `l`: `2^(l+1)`.
pub fn level_limit(level: usize) -> usize {
    1usize << (level + 1)
}

/// One level's sstable heads plus the directory they live in.
pub struct Level {
    pub dir: PathBuf,
    pub heads: Vec<SSTableHead>,
}

impl Level {
    fn sort(&mut self) {
        self.heads.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.path().cmp(b.path()))
        });
    }
}

/// Runs compaction across every level that currently overflows its
/// soft limit, mutating `levels` and the on-disk files in place.
///
/// `levels[l]` must exist for every level that could receive output;
/// callers should pre-create an empty `Level` for `levels.len()` before
/// calling if overflow could cascade into a brand-new bottom level.
pub fn compact(levels: &mut Vec<Level>, base_dir: &Path) -> Result<()> {
    let mut current = 0;
    while current < levels.len() && levels[current].heads.len() > level_limit(current) {
        let created_new_level = current + 1 == levels.len();
        if created_new_level {
            let dir = base_dir.join(format!("level-{}", current + 1));
            fs::create_dir_all(&dir)?;
            levels.push(Level {
                dir,
                heads: Vec::new(),
            });
        }
        let bottom_level = created_new_level || current + 2 == levels.len();

        levels[current].sort();
        let overflow = levels[current].heads.len() - level_limit(current);
        let victim_count = if current == 0 {
            L0_BATCH_SIZE.min(levels[current].heads.len())
        } else {
            overflow
        };

        // Oldest `victim_count` heads from the current level.
        let victim_idx: Vec<usize> = (0..victim_count).collect();
        let (min_key, max_key) = combined_range(&levels[current].heads, &victim_idx);

        let next_overlap_idx: Vec<usize> = levels[current + 1]
            .heads
            .iter()
            .enumerate()
            .filter(|(_, h)| h.overlaps(min_key, max_key))
            .map(|(i, _)| i)
            .collect();

        let max_timestamp = victim_idx
            .iter()
            .map(|&i| levels[current].heads[i].timestamp())
            .chain(next_overlap_idx.iter().map(|&i| levels[current + 1].heads[i].timestamp()))
            .max()
            .unwrap_or(0);

        // Merge victims in ascending-timestamp order so later (newer)
        // entries overwrite earlier ones in the map.
        let mut ordered: Vec<&SSTableHead> = victim_idx
            .iter()
            .map(|&i| &levels[current].heads[i])
            .chain(next_overlap_idx.iter().map(|&i| &levels[current + 1].heads[i]))
            .collect();
        ordered.sort_by_key(|h| h.timestamp());

        let mut merged: std::collections::BTreeMap<u64, Vec<u8>> = std::collections::BTreeMap::new();
        for head in &ordered {
            for (k, v) in head.iter_all() {
                merged.insert(k, v);
            }
        }

        if bottom_level {
            merged.retain(|_, v| v.as_slice() != TOMBSTONE);
        }

        debug!(
            level = current,
            victims = victim_count,
            overlapping_next = next_overlap_idx.len(),
            merged_keys = merged.len(),
            "compacting level"
        );

        let new_heads = write_partitioned(&levels[current + 1].dir, &merged, max_timestamp)?;

        // Unlink victim files.
        for &i in &victim_idx {
            let _ = fs::remove_file(levels[current].heads[i].path());
        }
        for &i in &next_overlap_idx {
            let _ = fs::remove_file(levels[current + 1].heads[i].path());
        }

        // Remove victims from their levels (highest index first to keep
        // indices valid while removing).
        let mut victim_idx_sorted = victim_idx.clone();
        victim_idx_sorted.sort_unstable_by(|a, b| b.cmp(a));
        for i in victim_idx_sorted {
            levels[current].heads.remove(i);
        }
        let mut next_idx_sorted = next_overlap_idx.clone();
        next_idx_sorted.sort_unstable_by(|a, b| b.cmp(a));
        for i in next_idx_sorted {
            levels[current + 1].heads.remove(i);
        }

        levels[current + 1].heads.extend(new_heads);
        levels[current + 1].sort();

        info!(level = current, next_level = current + 1, "compaction round complete");
        current += 1;
    }
    Ok(())
}

fn combined_range(heads: &[SSTableHead], idx: &[usize]) -> (u64, u64) {
    let mut min_key = u64::MAX;
    let mut max_key = 0u64;
    for &i in idx {
        let (lo, hi) = heads[i].key_range();
        min_key = min_key.min(lo);
        max_key = max_key.max(hi);
    }
    (min_key, max_key)
}

/// Maximum projected sstable size before a new output file is started.
const OUTPUT_SIZE_BUDGET: usize = 2 * 1024 * 1024;

fn write_partitioned(
    dir: &Path,
    merged: &std::collections::BTreeMap<u64, Vec<u8>>,
    timestamp: u64,
) -> Result<Vec<SSTableHead>> {
    fs::create_dir_all(dir)?;
    let mut next_suffix = next_file_suffix(dir)?;
    let mut heads = Vec::new();
    let mut builder = SSTableBuilder::new(timestamp);

    for (&key, value) in merged {
        builder.push(key, value.clone());
        if builder.projected_size() >= OUTPUT_SIZE_BUDGET {
            heads.push(flush_builder(dir, &mut builder, timestamp, &mut next_suffix)?);
        }
    }
    if !builder.is_empty() {
        heads.push(flush_builder(dir, &mut builder, timestamp, &mut next_suffix)?);
    }
    Ok(heads)
}

fn flush_builder(
    dir: &Path,
    builder: &mut SSTableBuilder,
    timestamp: u64,
    next_suffix: &mut u64,
) -> Result<SSTableHead> {
    let suffix = *next_suffix;
    *next_suffix += 1;
    let path = dir.join(format!("{timestamp}-{suffix}.sst"));
    let finished = std::mem::replace(builder, SSTableBuilder::new(timestamp));
    finished.write_to(&path)?;
    Ok(SSTableHead::open(&path)?)
}

/// Smallest filename suffix not already used by an `.sst` file in `dir`.
pub fn next_file_suffix(dir: &Path) -> Result<u64> {
    let mut max_suffix = 0u64;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(suffix) = name.strip_suffix(".sst").and_then(|s| s.rsplit('-').next()) {
                    if let Ok(n) = suffix.parse::<u64>() {
                        max_suffix = max_suffix.max(n + 1);
                    }
                }
            }
        }
    }
    Ok(max_suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn level_with(dir: &Path, entries: &[&[(u64, &[u8])]]) -> Level {
        fs::create_dir_all(dir).unwrap();
        let mut heads = Vec::new();
        for (i, group) in entries.iter().enumerate() {
            let mut builder = SSTableBuilder::new(i as u64);
            for (k, v) in *group {
                builder.push(*k, v.to_vec());
            }
            let path = dir.join(format!("{i}-0.sst"));
            builder.write_to(&path).unwrap();
            heads.push(SSTableHead::open(&path).unwrap());
        }
        Level {
            dir: dir.to_path_buf(),
            heads,
        }
    }

    #[test]
    fn level_limit_doubles_each_level() {
        assert_eq!(level_limit(0), 2);
        assert_eq!(level_limit(1), 4);
        assert_eq!(level_limit(2), 8);
    }

    #[test]
    fn compacts_overflowing_l0_into_l1() {
        let base = tempdir().unwrap();
        let l0 = level_with(
            &base.path().join("level-0"),
            &[
                &[(1, b"a".as_slice())],
                &[(2, b"b".as_slice())],
                &[(3, b"c".as_slice())],
            ],
        );
        let mut levels = vec![l0];
        compact(&mut levels, base.path()).unwrap();

        assert!(levels[0].heads.len() <= level_limit(0));
        assert_eq!(levels[1].heads.len(), 1);
        let merged = &levels[1].heads[0];
        assert_eq!(merged.get(1), Some(b"a".to_vec()));
        assert_eq!(merged.get(2), Some(b"b".to_vec()));
        assert_eq!(merged.get(3), Some(b"c".to_vec()));
    }

    #[test]
    fn newer_victim_overwrites_older_on_merge() {
        let base = tempdir().unwrap();
        let l0 = level_with(
            &base.path().join("level-0"),
            &[
                &[(1, b"old".as_slice())],
                &[(1, b"newer".as_slice())],
                &[(2, b"x".as_slice())],
            ],
        );
        let mut levels = vec![l0];
        compact(&mut levels, base.path()).unwrap();
        assert_eq!(levels[1].heads[0].get(1), Some(b"newer".to_vec()));
    }

    #[test]
    fn tombstone_dropped_at_bottom_level() {
        let base = tempdir().unwrap();
        let l0 = level_with(
            &base.path().join("level-0"),
            &[
                &[(1, b"value".as_slice())],
                &[(1, TOMBSTONE)],
                &[(2, b"y".as_slice())],
            ],
        );
        let mut levels = vec![l0];
        compact(&mut levels, base.path()).unwrap();
        // level 1 is the bottom level here (no level-2 exists yet), so
        // the tombstone should have been dropped along with key 1.
        assert_eq!(levels[1].heads[0].get(1), None);
    }
}
