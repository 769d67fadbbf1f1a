//! Flat JSON files: hash maps, merged maps, duplicate groups and run logs.

use crate::core::hash::{DigestMap, DigestSet, HashError, HashService};
use chrono::Local;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HASHMAP_FILE_NAME: &str = "photosort_hashmap.json";
pub const MERGED_FILE_NAME: &str = "photosort_hashs_merged.json";
pub const DUPLICATES_HELPER_FILE_NAME: &str = "photosort_hashs_duplicates_helper.json";
pub const DUPLICATES_FILE_NAME: &str = "photosort_duplicates.json";

/// Newly hashed files between two writes of the partial map.
pub const CHECKPOINT_INTERVAL: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let contents = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Pretty-printed into `<path>.partial`, then renamed over `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut partial = OsString::from(path.as_os_str());
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    fs::write(&partial, json).map_err(|e| StoreError::io(&partial, e))?;
    fs::rename(&partial, path).map_err(|e| StoreError::io(path, e))
}

pub fn read_digest_map(path: &Path) -> Result<DigestMap, StoreError> {
    read_json(path)
}

/// Union of several hash maps; on conflicts the later file wins.
pub fn read_and_merge(paths: &[PathBuf]) -> Result<DigestMap, StoreError> {
    let mut merged = DigestMap::new();
    for path in paths {
        let map = read_digest_map(path)?;
        log::debug!("{}: {} entries", path.display(), map.len());
        merged.extend(map);
    }
    Ok(merged)
}

/// Copy `path` to `<path>.<YYYYmmddHHMMSS>.bak` and return the backup location.
pub fn backup_file(path: &Path) -> Result<PathBuf, StoreError> {
    let mut backup = OsString::from(path.as_os_str());
    backup.push(format!(".{}.bak", Local::now().format("%Y%m%d%H%M%S")));
    let backup = PathBuf::from(backup);

    fs::copy(path, &backup).map_err(|e| StoreError::io(&backup, e))?;
    Ok(backup)
}

/// Drop entries whose file is gone. Returns the removed paths.
pub fn prune_missing(map: &mut DigestMap) -> Vec<PathBuf> {
    let missing: Vec<PathBuf> = map.keys().filter(|path| !path.exists()).cloned().collect();
    for path in &missing {
        map.remove(path);
    }
    missing
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub hashed: usize,
    /// Already present in the map being resumed.
    pub skipped: usize,
    pub failed: usize,
    pub checkpoints: usize,
}

/// Builds a [`DigestMap`] for a list of files, saving progress as it goes.
pub struct MapBuilder<'a> {
    hasher: &'a HashService,
    output: PathBuf,
    checkpoint_interval: usize,
    exact_fallback: bool,
}

impl<'a> MapBuilder<'a> {
    pub fn new(hasher: &'a HashService, output: impl Into<PathBuf>) -> Self {
        Self {
            hasher,
            output: output.into(),
            checkpoint_interval: CHECKPOINT_INTERVAL,
            exact_fallback: false,
        }
    }

    pub fn checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Keep files that are not decodable images, with their exact digest only.
    pub fn exact_fallback(mut self, enabled: bool) -> Self {
        self.exact_fallback = enabled;
        self
    }

    /// Hash every file not already in `existing`, keyed by canonical path.
    ///
    /// The map is written to the output file every `checkpoint_interval` newly
    /// hashed files and once more at the end.
    pub fn build<F>(
        &self,
        files: &[PathBuf],
        existing: DigestMap,
        mut on_file: F,
    ) -> Result<(DigestMap, BuildStats), StoreError>
    where
        F: FnMut(&Path),
    {
        let mut map = existing;
        let mut stats = BuildStats::default();

        for file in files {
            on_file(file);

            let path = match fs::canonicalize(file) {
                Ok(path) => path,
                Err(error) => {
                    log::warn!("Skipping {}: {}", file.display(), error);
                    stats.failed += 1;
                    continue;
                }
            };

            if map.contains_key(&path) {
                stats.skipped += 1;
                continue;
            }

            match self.hash(&path) {
                Ok(digests) => {
                    map.insert(path, digests);
                    stats.hashed += 1;

                    if stats.hashed % self.checkpoint_interval == 0 {
                        write_json(&self.output, &map)?;
                        stats.checkpoints += 1;
                        log::debug!("Checkpoint after {} files", stats.hashed);
                    }
                }
                Err(error) => {
                    log::warn!("Skipping {}: {}", path.display(), error);
                    stats.failed += 1;
                }
            }
        }

        write_json(&self.output, &map)?;
        log::info!(
            "Hashed {} files ({} already known, {} failed)",
            stats.hashed,
            stats.skipped,
            stats.failed
        );

        Ok((map, stats))
    }

    fn hash(&self, path: &Path) -> Result<DigestSet, HashError> {
        if self.exact_fallback {
            self.hasher.hash_file_lenient(path, true)
        } else {
            self.hasher.hash_file(path, true)
        }
    }
}
