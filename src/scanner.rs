use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Extensions picked up when only images are selected. Matched case-insensitively.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "raw"];

/// Files this tool writes itself start with this prefix and are never scanned.
const OWN_FILE_PREFIX: &str = "photosort_";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {}", path.display())]
    InvalidPath { path: PathBuf },

    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every regular file.
    All,
    /// Files whose lowercased extension is in the set.
    Extensions(HashSet<String>),
}

impl Selection {
    pub fn images() -> Self {
        Self::Extensions(
            DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        )
    }

    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Self::All => true,
            Self::Extensions(extensions) => path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext.to_lowercase())),
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::images()
    }
}

/// Recursive file listing of a directory tree.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    selection: Selection,
}

impl Scanner {
    pub fn new(selection: Selection) -> Self {
        Self { selection }
    }

    pub fn all() -> Self {
        Self::new(Selection::All)
    }

    pub fn images() -> Self {
        Self::new(Selection::images())
    }

    /// Selected files under `root`, sorted by path.
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        self.scan_with(root, |_| {})
    }

    /// Like [`scan`](Self::scan), calling `on_entry` for every directory entry visited.
    pub fn scan_with<F>(&self, root: &Path, mut on_entry: F) -> Result<Vec<PathBuf>, ScanError>
    where
        F: FnMut(&Path),
    {
        if !root.exists() {
            return Err(ScanError::InvalidPath {
                path: root.to_path_buf(),
            });
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    log::warn!("Skipping unreadable entry: {}", error);
                    continue;
                }
            };

            on_entry(entry.path());

            if !entry.file_type().is_file() || is_own_file(entry.path()) {
                continue;
            }
            if self.selection.matches(entry.path()) {
                files.push(entry.into_path());
            }
        }

        files.sort();
        log::info!("Found {} files in {}", files.len(), root.display());
        Ok(files)
    }
}

fn is_own_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(OWN_FILE_PREFIX) && name.contains(".json"))
}
