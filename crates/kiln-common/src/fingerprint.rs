//! File fingerprints for cache invalidation.
//!
//! A fingerprint is the (path, modification time, size) of a file, or the
//! fact that it was missing, captured right after a successful build. It is
//! a cheap heuristic rather than a content hash: two edits inside one
//! timestamp tick that leave the size unchanged are indistinguishable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// What a stat of the file showed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// The file did not exist or could not be stat'ed.
    Missing,
    Present { modified: SystemTime, size: u64 },
}

impl FileState {
    /// Stats `path`. Any stat failure counts as missing.
    pub fn observe(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(metadata) => match metadata.modified() {
                Ok(modified) => FileState::Present {
                    modified,
                    size: metadata.len(),
                },
                Err(_) => FileState::Missing,
            },
            Err(_) => FileState::Missing,
        }
    }
}

/// State of one file at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub state: FileState,
}

impl FileFingerprint {
    pub fn capture(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = FileState::observe(&path);
        Self { path, state }
    }

    pub fn is_missing(&self) -> bool {
        self.state == FileState::Missing
    }

    /// True if the file appeared, disappeared, or its modification time or
    /// size changed.
    pub fn is_stale(&self) -> bool {
        FileState::observe(&self.path) != self.state
    }
}

/// A deduplicated set of fingerprints covering every dependency of a
/// cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintSet {
    entries: BTreeMap<PathBuf, FileFingerprint>,
}

impl FingerprintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprints every path. A path that does not exist yet is recorded
    /// as missing, so the set goes stale once it is created.
    pub fn capture<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut set = Self::new();
        for path in paths {
            set.insert(FileFingerprint::capture(path.as_ref()));
        }
        set
    }

    /// Paths that were missing at capture time, in path order.
    pub fn missing(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .values()
            .filter(|fp| fp.is_missing())
            .map(|fp| fp.path.as_path())
    }

    pub fn insert(&mut self, fingerprint: FileFingerprint) {
        self.entries.insert(fingerprint.path.clone(), fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first dependency (in path order) whose fingerprint no longer matches.
    pub fn first_stale(&self) -> Option<&Path> {
        self.entries
            .values()
            .find(|fp| fp.is_stale())
            .map(|fp| fp.path.as_path())
    }
}
