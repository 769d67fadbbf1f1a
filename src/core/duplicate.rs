// Duplicate grouping over a digest map.
//
// Files are bucketed by exact hash and, separately, by the exact value of each
// perceptual hash. Buckets that share a member are merged, so every file ends
// up in at most one group.

use crate::core::hash::{BitVector, DigestMap, ExactHash, PerceptualAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};

/// Files believed to be the same picture. Always holds at least two paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuplicateGroup(Vec<PathBuf>);

impl DuplicateGroup {
    pub fn files(&self) -> &[PathBuf] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.0.iter().any(|p| p == path)
    }

    pub fn into_files(self) -> Vec<PathBuf> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DigestKey {
    Exact(ExactHash),
    Perceptual(PerceptualAlgorithm, BitVector),
}

/// Partition the files of `digests` into duplicate groups.
///
/// The output order follows the iteration order of `digests`: exact-hash groups
/// first, then perceptual groups that did not join one of them.
pub fn group_duplicates(digests: &DigestMap) -> Vec<DuplicateGroup> {
    let exact = bucket_by(digests.iter().filter_map(|(path, set)| {
        if set.exact.is_empty() {
            None
        } else {
            Some((DigestKey::Exact(set.exact.clone()), path))
        }
    }));

    let perceptual = bucket_by(digests.iter().flat_map(|(path, set)| {
        set.perceptual
            .iter()
            .filter(|(_, bits)| !bits.is_empty())
            .map(move |(algorithm, bits)| {
                (DigestKey::Perceptual(*algorithm, bits.clone()), path)
            })
    }));

    merge_buckets(exact, perceptual)
        .into_iter()
        .map(DuplicateGroup)
        .collect()
}

/// Bucket paths by key in first-seen order, dropping singleton buckets.
fn bucket_by<'a, K, I>(entries: I) -> Vec<Vec<PathBuf>>
where
    K: Hash + Eq,
    I: IntoIterator<Item = (K, &'a PathBuf)>,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut buckets: Vec<Vec<PathBuf>> = Vec::new();

    for (key, path) in entries {
        let index = *positions.entry(key).or_insert_with(|| {
            buckets.push(Vec::new());
            buckets.len() - 1
        });
        buckets[index].push(path.clone());
    }

    buckets.retain(|bucket| bucket.len() > 1);
    buckets
}

fn merge_buckets(exact: Vec<Vec<PathBuf>>, perceptual: Vec<Vec<PathBuf>>) -> Vec<Vec<PathBuf>> {
    // Slots of absorbed groups become `None`; `owner` maps a path to its live slot.
    let mut groups: Vec<Option<Vec<PathBuf>>> = Vec::new();
    let mut owner: HashMap<PathBuf, usize> = HashMap::new();

    for bucket in exact {
        let slot = groups.len();
        for path in &bucket {
            owner.insert(path.clone(), slot);
        }
        groups.push(Some(bucket));
    }

    for bucket in perceptual {
        let mut hits: Vec<usize> = bucket
            .iter()
            .filter_map(|path| owner.get(path).copied())
            .collect();
        hits.sort_unstable();
        hits.dedup();

        let target = match hits.first() {
            Some(&first) => first,
            None => {
                groups.push(Some(Vec::new()));
                groups.len() - 1
            }
        };

        for &absorbed in hits.iter().skip(1) {
            if let Some(files) = groups[absorbed].take() {
                for path in &files {
                    owner.insert(path.clone(), target);
                }
                if let Some(group) = groups[target].as_mut() {
                    group.extend(files);
                }
            }
        }

        for path in &bucket {
            owner.insert(path.clone(), target);
        }
        if let Some(group) = groups[target].as_mut() {
            group.extend(bucket);
        }
    }

    groups
        .into_iter()
        .flatten()
        .map(dedup_preserving_order)
        .filter(|group| group.len() > 1)
        .collect()
}

fn dedup_preserving_order(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Disk usage of a set of duplicate groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateStats {
    /// Bytes of the first (kept) file of every group.
    pub unique_bytes: u64,
    /// Bytes of all other group members.
    pub duplicate_bytes: u64,
    /// Members that are no longer on disk.
    pub not_found: Vec<PathBuf>,
}

pub fn duplicate_stats(groups: &[DuplicateGroup]) -> DuplicateStats {
    let mut stats = DuplicateStats::default();

    for group in groups {
        for (i, file) in group.files().iter().enumerate() {
            match fs::metadata(file) {
                Ok(metadata) if i == 0 => stats.unique_bytes += metadata.len(),
                Ok(metadata) => stats.duplicate_bytes += metadata.len(),
                Err(_) => stats.not_found.push(file.clone()),
            }
        }
    }

    stats
}
