//! In-memory artifact cache.
//!
//! Entries are keyed by absolute component path. One entry holds the server
//! script and stylesheet shared by every mount point of that component, plus
//! one client script per mount point. Built entries carry the fingerprints
//! of every file any of the three builds read and go stale as a unit; pinned
//! entries were supplied externally and never go stale.

use kiln_common::{Artifacts, FingerprintSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Artifacts),
    /// No entry, or no client script for this mount point.
    Miss,
    /// The entry exists but a dependency changed or disappeared.
    Stale { changed: PathBuf },
}

#[derive(Debug)]
struct CacheEntry {
    server_script: Arc<str>,
    stylesheet: Arc<str>,
    client_scripts: HashMap<String, Arc<str>>,
    fingerprints: Arc<FingerprintSet>,
    pinned: bool,
}

impl CacheEntry {
    fn new(artifacts: &Artifacts, fingerprints: FingerprintSet, pinned: bool) -> Self {
        Self {
            server_script: Arc::clone(&artifacts.server_script),
            stylesheet: Arc::clone(&artifacts.stylesheet),
            client_scripts: HashMap::new(),
            fingerprints: Arc::new(fingerprints),
            pinned,
        }
    }
}

/// Thread-safe artifact store. The lock is held only while the map is read
/// or mutated; staleness checks stat files outside it.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The artifacts for (component, mount point), or `None` when missing or stale.
    pub fn read(&self, component: &Path, mount_point: &str) -> Option<Artifacts> {
        match self.lookup(component, mount_point) {
            CacheLookup::Hit(artifacts) => Some(artifacts),
            _ => None,
        }
    }

    /// Like [`ArtifactCache::read`] but says why there was no hit.
    pub fn lookup(&self, component: &Path, mount_point: &str) -> CacheLookup {
        let (artifacts, fingerprints) = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = entries.get(component) else {
                return CacheLookup::Miss;
            };
            let Some(client) = entry.client_scripts.get(mount_point) else {
                return CacheLookup::Miss;
            };
            let artifacts = Artifacts {
                server_script: Arc::clone(&entry.server_script),
                client_script: Arc::clone(client),
                stylesheet: Arc::clone(&entry.stylesheet),
            };
            if entry.pinned {
                return CacheLookup::Hit(artifacts);
            }
            (artifacts, Arc::clone(&entry.fingerprints))
        };

        match fingerprints.first_stale() {
            Some(changed) => CacheLookup::Stale {
                changed: changed.to_path_buf(),
            },
            None => CacheLookup::Hit(artifacts),
        }
    }

    /// Stores freshly built artifacts.
    ///
    /// The entry's server script, stylesheet and fingerprints are replaced.
    /// Client scripts of other mount points survive only when the existing
    /// entry was built from the same files; otherwise they were built from
    /// outdated sources and are dropped.
    pub fn store_built(
        &self,
        component: impl Into<PathBuf>,
        mount_point: &str,
        artifacts: Artifacts,
        fingerprints: FingerprintSet,
    ) {
        let component = component.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let keep_clients = entries
            .get(&component)
            .is_some_and(|existing| !existing.pinned && *existing.fingerprints == fingerprints);

        let mut entry = CacheEntry::new(&artifacts, fingerprints, false);
        if keep_clients {
            if let Some(existing) = entries.remove(&component) {
                entry.client_scripts = existing.client_scripts;
            }
        }
        entry
            .client_scripts
            .insert(mount_point.to_string(), artifacts.client_script);
        entries.insert(component, entry);
    }

    /// Stores externally supplied artifacts that never go stale.
    ///
    /// Client scripts already registered for the component's other mount
    /// points are kept, whether they were pinned or built.
    pub fn store_pinned(&self, component: impl Into<PathBuf>, mount_point: &str, artifacts: Artifacts) {
        let component = component.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let mut entry = CacheEntry::new(&artifacts, FingerprintSet::new(), true);
        if let Some(existing) = entries.remove(&component) {
            entry.client_scripts = existing.client_scripts;
        }
        entry
            .client_scripts
            .insert(mount_point.to_string(), artifacts.client_script);
        entries.insert(component, entry);
    }

    pub fn is_pinned(&self, component: &Path) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(component)
            .is_some_and(|entry| entry.pinned)
    }

    /// Number of dependency fingerprints held for `component`. Pinned entries hold none.
    pub fn fingerprint_count(&self, component: &Path) -> Option<usize> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(component)
            .map(|entry| entry.fingerprints.len())
    }

    /// Mount points with a client script for `component`, sorted.
    pub fn mount_points(&self, component: &Path) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut mounts: Vec<String> = entries
            .get(component)
            .map(|entry| entry.client_scripts.keys().cloned().collect())
            .unwrap_or_default();
        mounts.sort();
        mounts
    }

    /// Number of components with an entry.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
