//! Prebuilt artifact manifest.
//!
//! A release build writes its bundles into a dist directory along with a
//! `manifest.json` that maps each page name to its file names:
//!
//! ```json
//! {
//!   "home": { "server": "home-1a2b3c4d-server.js", "client": "home-client.js", "css": "shared-5e6f7a8b.css" }
//! }
//! ```

use kiln_common::{short_hash, KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client: String,
    pub css: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
}

pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Paths of one page's prebuilt artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrebuiltFiles {
    pub server: PathBuf,
    pub client: PathBuf,
    pub client_chunks: Vec<PathBuf>,
    pub css: PathBuf,
}

/// Reads `<dist>/manifest.json`. A missing file is `Ok(None)`.
pub fn read_manifest(dist: &Path) -> Result<Option<Manifest>> {
    let path = dist.join(MANIFEST_FILE);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KilnError::Manifest(format!("read {}: {}", path.display(), e))),
    };
    let manifest = serde_json::from_str(&data)
        .map_err(|e| KilnError::Manifest(format!("decode {}: {}", path.display(), e)))?;
    Ok(Some(manifest))
}

/// Merges `updates` over the existing manifest (if any) and writes it back.
pub fn update_manifest(dist: &Path, updates: Manifest) -> Result<()> {
    let mut manifest = read_manifest(dist)?.unwrap_or_default();
    manifest.extend(updates);

    let data = serde_json::to_string_pretty(&manifest)
        .map_err(|e| KilnError::Manifest(format!("encode manifest: {}", e)))?;
    std::fs::create_dir_all(dist)?;
    let path = dist.join(MANIFEST_FILE);
    std::fs::write(&path, data).map_err(|e| KilnError::Manifest(format!("write {}: {}", path.display(), e)))
}

/// Records `files` under `name`, storing base names only.
pub fn write_manifest_entry(dist: &Path, name: &str, files: &PrebuiltFiles) -> Result<()> {
    let entry = ManifestEntry {
        server: base_name(&files.server),
        client: base_name(&files.client),
        css: base_name(&files.css),
        chunks: files.client_chunks.iter().map(|p| base_name(p)).collect(),
    };
    update_manifest(dist, Manifest::from([(name.to_string(), entry)]))
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The prebuilt files for `component`, named after its file stem.
///
/// A manifest entry wins. Without one, the conventional
/// `<name>-server.js`, `<name>-client.js` and `<name>.css` are assumed.
pub fn resolve_prebuilt_files(dist: &Path, component: &Path) -> Result<PrebuiltFiles> {
    let name = component
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !name.is_empty() {
        if let Some(entry) = read_manifest(dist)?.and_then(|mut m| m.remove(&name)) {
            return Ok(from_entry(dist, entry));
        }
    }

    Ok(PrebuiltFiles {
        server: dist.join(format!("{}-server.js", name)),
        client: dist.join(format!("{}-client.js", name)),
        client_chunks: Vec::new(),
        css: dist.join(format!("{}.css", name)),
    })
}

fn from_entry(dist: &Path, entry: ManifestEntry) -> PrebuiltFiles {
    let mut chunks = entry.chunks;
    // no explicit client entry: the first chunk is it
    let client = if entry.client.is_empty() && !chunks.is_empty() {
        chunks.remove(0)
    } else {
        entry.client
    };

    PrebuiltFiles {
        server: dist.join(entry.server),
        client: dist.join(client),
        client_chunks: chunks.into_iter().map(|c| dist.join(c)).collect(),
        css: dist.join(entry.css),
    }
}

/// Writes a server bundle as `<name>-<hash>-server.js`.
pub fn save_server_bundle(dir: &Path, name: &str, server_script: &str) -> Result<PathBuf> {
    if server_script.is_empty() {
        return Err(KilnError::InvalidRequest("server bundle is empty".into()));
    }
    if name.is_empty() {
        return Err(KilnError::InvalidRequest("bundle name is required".into()));
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}-server.js", name, short_hash(server_script)));
    std::fs::write(&path, server_script)?;
    Ok(path)
}

/// Writes a stylesheet as `<name>-<hash>.css`; an empty name means `shared`.
pub fn save_stylesheet(dir: &Path, name: &str, css: &str) -> Result<PathBuf> {
    if css.is_empty() {
        return Err(KilnError::InvalidRequest("stylesheet is empty".into()));
    }
    let name = if name.is_empty() { "shared" } else { name };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}.css", name, short_hash(css)));
    std::fs::write(&path, css)?;
    Ok(path)
}
