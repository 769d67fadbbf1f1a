use crate::core::hash::{
    BitVector, DigestMap, DigestSet, ExactHash, HashError, HashService, PerceptualAlgorithm,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Exact(ExactHash),
    Perceptual(PerceptualAlgorithm, BitVector),
}

/// Constant-time "have we seen this picture" lookup over a digest map.
///
/// Every digest value of every file points back at the file. The index grows
/// while placing, so files copied earlier in a run are found by later ones.
#[derive(Debug, Clone, Default)]
pub struct DigestIndex {
    by_value: HashMap<IndexKey, PathBuf>,
    entries: DigestMap,
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: DigestMap) -> Self {
        let mut index = Self::new();
        for (path, digests) in map {
            index.insert(path, digests);
        }
        index
    }

    pub fn insert(&mut self, path: PathBuf, digests: DigestSet) {
        for key in keys(&digests) {
            self.by_value.insert(key, path.clone());
        }
        self.entries.insert(path, digests);
    }

    /// A file sharing any digest value with `digests`; exact hash first.
    pub fn lookup(&self, digests: &DigestSet) -> Option<&Path> {
        self.candidates(digests).first().map(|(path, _)| *path)
    }

    /// Every indexed file sharing a digest value with `digests`, with its own
    /// digests. Exact hits come first and no file is listed twice.
    pub fn candidates(&self, digests: &DigestSet) -> Vec<(&Path, &DigestSet)> {
        let mut found: Vec<(&Path, &DigestSet)> = Vec::new();
        for key in keys(digests) {
            let Some(path) = self.by_value.get(&key) else {
                continue;
            };
            if found.iter().any(|(seen, _)| *seen == path.as_path()) {
                continue;
            }
            if let Some(known) = self.entries.get(path) {
                found.push((path.as_path(), known));
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &DigestMap {
        &self.entries
    }

    pub fn into_map(self) -> DigestMap {
        self.entries
    }

    /// `{ digest value -> path }`, the reverse view written next to merged hash maps.
    pub fn reverse_map(&self) -> BTreeMap<String, PathBuf> {
        self.by_value
            .iter()
            .map(|(key, path)| {
                let value = match key {
                    IndexKey::Exact(exact) => exact.to_string(),
                    IndexKey::Perceptual(_, bits) => bits.to_hex(),
                };
                (value, path.clone())
            })
            .collect()
    }
}

fn keys(digests: &DigestSet) -> Vec<IndexKey> {
    let mut keys = Vec::with_capacity(digests.perceptual.len() + 1);
    if !digests.exact.is_empty() {
        keys.push(IndexKey::Exact(digests.exact.clone()));
    }
    for (algorithm, bits) in &digests.perceptual {
        if !bits.is_empty() {
            keys.push(IndexKey::Perceptual(*algorithm, bits.clone()));
        }
    }
    keys
}

/// Digests of destination files, computed at most once per run.
#[derive(Debug, Default)]
pub struct DigestCache {
    entries: HashMap<PathBuf, DigestSet>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &mut self,
        path: &Path,
        hasher: &HashService,
        want_perceptual: bool,
    ) -> Result<&DigestSet, HashError> {
        match self.entries.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => Ok(&*entry.into_mut()),
            Entry::Vacant(entry) => {
                let digests = hasher.hash_file_lenient(path, want_perceptual)?;
                Ok(&*entry.insert(digests))
            }
        }
    }

    pub fn insert(&mut self, path: PathBuf, digests: DigestSet) {
        self.entries.insert(path, digests);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
