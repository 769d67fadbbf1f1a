use crate::core::hash::{DigestSet, HashError, HashOptions, HashService};
use crate::core::index::{DigestCache, DigestIndex};
use crate::core::layout::{Layout, destination_path, local_time};
use crate::core::similarity::{CompareError, Comparator, SimilarityPolicy};
use crate::scanner::{Scanner, Selection};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Written into the source root at the end of a run.
pub const LOG_FILE_NAME: &str = "photosort_log.json";

/// Names tried for one destination, the original name included.
pub const MAX_RENAME_ATTEMPTS: u32 = 10_000;

/// Siblings whose size differs by more than this share are never compared.
const SIZE_TOLERANCE: f64 = 0.1;

/// Fatal errors, raised before any file is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The source directory `{}` does not exist", path.display())]
    MissingSource { path: PathBuf },

    #[error("The destination directory `{}` does not exist", path.display())]
    MissingDestination { path: PathBuf },

    #[error("`{}` is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("The directory `{}` is not readable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The hash file `{}` was not found or is not a file", path.display())]
    MissingHashFile { path: PathBuf },

    #[error("Invalid hashing options: {0}")]
    Hash(#[from] HashError),
}

/// Per-file failures. They are logged and the run goes on.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("Error on copy to {}: {source}", destination.display())]
    CopyFailed {
        destination: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free file name found for `{}` in {attempts} attempts", path.display())]
    RenameExhausted { path: PathBuf, attempts: u32 },

    #[error("Could not hash `{}`: {source}", path.display())]
    Hash {
        path: PathBuf,
        #[source]
        source: HashError,
    },

    #[error("Could not read `{}`: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{}` has no file name", path.display())]
    NoFileName { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub layout: Layout,
    /// Skip, instead of renaming, files whose name is taken by a different picture.
    pub no_rename: bool,
    /// Only compare siblings within ±10% of the source size.
    pub size_precheck: bool,
    /// Use perceptual hashes when comparing, not only the exact hash.
    pub perceptual: bool,
    pub hash_options: HashOptions,
    pub policy: SimilarityPolicy,
    /// Precomputed hash map used as a lookup index.
    pub hash_file: Option<PathBuf>,
    /// Which files under the source root are sorted. Images by default.
    pub selection: Selection,
}

impl PlacementConfig {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            layout: Layout::default(),
            no_rename: false,
            size_precheck: true,
            perceptual: true,
            hash_options: HashOptions::default(),
            policy: SimilarityPolicy::default(),
            hash_file: None,
            selection: Selection::images(),
        }
    }

    /// Check the roots (and hash file) exist, canonicalising the roots.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let source = ensure_directory(&self.source, |path| ConfigError::MissingSource { path })?;
        let destination = ensure_directory(&self.destination, |path| {
            ConfigError::MissingDestination { path }
        })?;

        if let Some(hash_file) = &self.hash_file {
            if !hash_file.is_file() {
                return Err(ConfigError::MissingHashFile {
                    path: hash_file.clone(),
                });
            }
        }

        let hasher = HashService::new(self.hash_options.clone())?;

        Ok(ValidatedConfig {
            config: PlacementConfig {
                source,
                destination,
                ..self
            },
            hasher,
        })
    }
}

fn ensure_directory(
    path: &Path,
    missing: impl FnOnce(PathBuf) -> ConfigError,
) -> Result<PathBuf, ConfigError> {
    if !path.exists() {
        return Err(missing(path.to_path_buf()));
    }

    if !path.is_dir() {
        return Err(ConfigError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    fs::read_dir(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    fs::canonicalize(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// A [`PlacementConfig`] whose roots are known to exist.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    config: PlacementConfig,
    hasher: HashService,
}

impl ValidatedConfig {
    pub fn source(&self) -> &Path {
        &self.config.source
    }

    pub fn destination(&self) -> &Path {
        &self.config.destination
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Scanner listing the source files this configuration sorts.
    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.config.selection.clone())
    }
}

/// Where an identical file was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// The file already sitting at the destination path.
    Destination,
    /// Another file in the destination directory.
    Sibling,
    /// The precomputed digest index.
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    Copied(PathBuf),
    /// Copied under a suffixed name because the original name was taken.
    Renamed(PathBuf),
    SkippedIdentical { matched: PathBuf, via: MatchSource },
    SkippedZeroByte,
    /// Name taken by a different file and renaming is disabled.
    SkippedNameCollision(PathBuf),
}

impl PlacementDecision {
    pub fn description(&self) -> String {
        match self {
            Self::Copied(destination) => format!("Copy to {}", destination.display()),
            Self::Renamed(destination) => format!(
                "Copy to {} (renamed, a different file with the same name exists)",
                destination.display()
            ),
            Self::SkippedIdentical {
                matched,
                via: MatchSource::Index,
            } => format!("Identical to {} (found via hash file)", matched.display()),
            Self::SkippedIdentical { matched, .. } => {
                format!("Identical to {}", matched.display())
            }
            Self::SkippedZeroByte => "Skipped because the filesize was 0 bytes".to_string(),
            Self::SkippedNameCollision(destination) => format!(
                "Skipped because a file with identical name, but different content, was already at destination {}",
                destination.display()
            ),
        }
    }

    /// Path the file was copied to, if it was.
    pub fn copied_to(&self) -> Option<&Path> {
        match self {
            Self::Copied(destination) | Self::Renamed(destination) => Some(destination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementStats {
    #[serde(rename = "totals")]
    pub total: usize,
    pub copied: usize,
    pub identical: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Everything that happened during one run, keyed by source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementLog {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(rename = "created")]
    pub created_at: String,
    pub stats: PlacementStats,
    #[serde(rename = "log")]
    pub entries: BTreeMap<String, String>,
}

impl PlacementLog {
    pub fn new(source: &Path, destination: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            created_at: Local::now().to_rfc2822(),
            stats: PlacementStats::default(),
            entries: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, source: &Path, outcome: &Result<PlacementDecision, FileError>) {
        self.stats.total += 1;

        let action = match outcome {
            Ok(decision) => {
                match decision {
                    PlacementDecision::Copied(_) | PlacementDecision::Renamed(_) => {
                        self.stats.copied += 1
                    }
                    PlacementDecision::SkippedIdentical { .. } => self.stats.identical += 1,
                    PlacementDecision::SkippedZeroByte
                    | PlacementDecision::SkippedNameCollision(_) => self.stats.skipped += 1,
                }
                decision.description()
            }
            Err(error) => {
                self.stats.errors += 1;
                error.to_string()
            }
        };

        self.entries
            .insert(source.to_string_lossy().into_owned(), action);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `<source root>/photosort_log.json`
    pub fn default_path(&self) -> PathBuf {
        self.source.join(LOG_FILE_NAME)
    }
}

/// Decides, file by file, where a source picture goes in the dated tree.
pub struct PlacementEngine {
    config: PlacementConfig,
    hasher: HashService,
    comparator: Comparator,
    cache: DigestCache,
    index: Option<DigestIndex>,
    log: PlacementLog,
}

impl PlacementEngine {
    pub fn new(validated: ValidatedConfig) -> Self {
        let ValidatedConfig { config, hasher } = validated;
        let log = PlacementLog::new(&config.source, &config.destination);

        Self {
            comparator: Comparator::new(config.policy),
            config,
            hasher,
            cache: DigestCache::new(),
            index: None,
            log,
        }
    }

    /// Look sources up in `index` before touching the destination tree.
    pub fn with_index(mut self, index: DigestIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Place every source. See [`run_with`](Self::run_with).
    pub fn run<I>(&mut self, sources: I) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        self.run_with(sources, |_, _| ControlFlow::Continue(()))
    }

    /// Place `sources` in order, handing every outcome to `after_each`.
    ///
    /// Returns `false` when `after_each` broke off the run; the log then holds
    /// the files processed so far.
    pub fn run_with<I, F>(&mut self, sources: I, mut after_each: F) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
        F: FnMut(&Path, &Result<PlacementDecision, FileError>) -> ControlFlow<()>,
    {
        for source in sources {
            let source = source.as_ref();
            let outcome = self.process(source);
            if after_each(source, &outcome).is_break() {
                log::warn!("Run stopped after {} files", self.log.stats.total);
                return false;
            }
        }
        true
    }

    /// Place one file and record the outcome in the log.
    pub fn process(&mut self, source: &Path) -> Result<PlacementDecision, FileError> {
        let outcome = self.place(source);
        self.log.record(source, &outcome);

        match &outcome {
            Ok(decision) => log::debug!("{}: {}", source.display(), decision.description()),
            Err(error) => log::warn!("{}: {}", source.display(), error),
        }

        outcome
    }

    /// Decide and carry out the placement of one file, without logging it.
    pub fn place(&mut self, source: &Path) -> Result<PlacementDecision, FileError> {
        let metadata = fs::metadata(source).map_err(|e| FileError::Metadata {
            path: source.to_path_buf(),
            source: e,
        })?;

        if metadata.len() == 0 {
            return Ok(PlacementDecision::SkippedZeroByte);
        }

        let mut digests = None;
        if let Some(index) = &self.index {
            let source_digests = self.source_digests(source)?;

            // A shared digest value only nominates a candidate; the policy decides.
            for (candidate, known) in index.candidates(&source_digests) {
                match self.comparator.is_same(&source_digests, known) {
                    Ok(true) => {
                        return Ok(PlacementDecision::SkippedIdentical {
                            matched: candidate.to_path_buf(),
                            via: MatchSource::Index,
                        });
                    }
                    Ok(false) => log::debug!(
                        "{}: shares a digest with {} but is not the same picture",
                        source.display(),
                        candidate.display()
                    ),
                    Err(error) => log::warn!("{}: {}", candidate.display(), error),
                }
            }
            digests = Some(source_digests);
        }

        let file_name = source.file_name().ok_or_else(|| FileError::NoFileName {
            path: source.to_path_buf(),
        })?;
        let modified = metadata.modified().map_err(|e| FileError::Metadata {
            path: source.to_path_buf(),
            source: e,
        })?;
        let destination = destination_path(
            &self.config.destination,
            &local_time(modified),
            file_name,
            self.config.layout,
        );

        if !destination.exists() {
            copy_preserving_mtime(source, &destination, modified)?;
            self.remember(&destination, digests);
            return Ok(PlacementDecision::Copied(destination));
        }

        let source_digests = match digests {
            Some(digests) => digests,
            None => self.source_digests(source)?,
        };

        match self.find_identical(&source_digests, &destination, metadata.len()) {
            Ok(Some(decision)) => return Ok(decision),
            Ok(None) => {}
            Err(error) => log::warn!(
                "{}: {}, treating it as a name collision",
                source.display(),
                error
            ),
        }

        if self.config.no_rename {
            return Ok(PlacementDecision::SkippedNameCollision(destination));
        }

        let renamed = free_file_name(&destination)?;
        copy_preserving_mtime(source, &renamed, modified)?;
        self.remember(&renamed, Some(source_digests));
        Ok(PlacementDecision::Renamed(renamed))
    }

    fn source_digests(&self, source: &Path) -> Result<DigestSet, FileError> {
        self.hasher
            .hash_file_lenient(source, self.config.perceptual)
            .map_err(|e| FileError::Hash {
                path: source.to_path_buf(),
                source: e,
            })
    }

    /// Compare against the file at `destination`, then its siblings.
    fn find_identical(
        &mut self,
        source_digests: &DigestSet,
        destination: &Path,
        source_size: u64,
    ) -> Result<Option<PlacementDecision>, CompareError> {
        match self
            .cache
            .get_or_compute(destination, &self.hasher, self.config.perceptual)
        {
            Ok(existing) => {
                if self.comparator.is_same(source_digests, existing)? {
                    return Ok(Some(PlacementDecision::SkippedIdentical {
                        matched: destination.to_path_buf(),
                        via: MatchSource::Destination,
                    }));
                }
            }
            Err(error) => log::warn!("Could not hash {}: {}", destination.display(), error),
        }

        let Some(directory) = destination.parent() else {
            return Ok(None);
        };

        for (sibling, size) in sibling_files(directory, destination) {
            if size == 0 {
                continue;
            }
            if self.config.size_precheck && !within_tolerance(source_size, size) {
                continue;
            }

            let existing = match self.cache.get_or_compute(
                &sibling,
                &self.hasher,
                self.config.perceptual,
            ) {
                Ok(existing) => existing,
                Err(error) => {
                    log::debug!("Skipping sibling {}: {}", sibling.display(), error);
                    continue;
                }
            };

            if self.comparator.is_same(source_digests, existing)? {
                return Ok(Some(PlacementDecision::SkippedIdentical {
                    matched: sibling,
                    via: MatchSource::Sibling,
                }));
            }
        }

        Ok(None)
    }

    fn remember(&mut self, destination: &Path, digests: Option<DigestSet>) {
        let Some(digests) = digests else {
            return;
        };

        if let Some(index) = self.index.as_mut() {
            index.insert(destination.to_path_buf(), digests.clone());
        }
        self.cache.insert(destination.to_path_buf(), digests);
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn log(&self) -> &PlacementLog {
        &self.log
    }

    pub fn index(&self) -> Option<&DigestIndex> {
        self.index.as_ref()
    }

    pub fn finish(self) -> (PlacementLog, Option<DigestIndex>) {
        (self.log, self.index)
    }
}

/// Files next to `destination`, sorted by path, with their sizes.
fn sibling_files(directory: &Path, destination: &Path) -> Vec<(PathBuf, u64)> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) => {
            log::warn!("Could not list {}: {}", directory.display(), error);
            return Vec::new();
        }
    };

    let mut siblings: Vec<(PathBuf, u64)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let path = entry.path();
            if path == destination {
                return None;
            }
            Some((path, metadata.len()))
        })
        .collect();

    siblings.sort();
    siblings
}

fn within_tolerance(source_size: u64, other_size: u64) -> bool {
    let source = source_size as f64;
    let other = other_size as f64;
    other >= source * (1.0 - SIZE_TOLERANCE) && other <= source * (1.0 + SIZE_TOLERANCE)
}

/// First free `<stem>_<n>.<ext>` next to `destination`.
pub fn free_file_name(destination: &Path) -> Result<PathBuf, FileError> {
    let directory = destination.parent().unwrap_or_else(|| Path::new(""));
    let stem = destination
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = destination
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());

    // The original name was attempt number one.
    for suffix in 1..MAX_RENAME_ATTEMPTS {
        let name = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, suffix, ext),
            None => format!("{}_{}", stem, suffix),
        };
        let candidate = directory.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(FileError::RenameExhausted {
        path: destination.to_path_buf(),
        attempts: MAX_RENAME_ATTEMPTS,
    })
}

fn copy_preserving_mtime(
    source: &Path,
    destination: &Path,
    modified: SystemTime,
) -> Result<(), FileError> {
    let copy_failed = |source: std::io::Error| FileError::CopyFailed {
        destination: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(copy_failed)?;
    }
    fs::copy(source, destination).map_err(copy_failed)?;

    let copied = OpenOptions::new()
        .write(true)
        .open(destination)
        .map_err(copy_failed)?;
    copied.set_modified(modified).map_err(copy_failed)?;

    Ok(())
}
