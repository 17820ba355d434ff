//! Page discovery.

use kiln_common::{default_mount_point, Result};
use std::path::{Path, PathBuf};

/// A page component found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpec {
    pub component: PathBuf,
    /// File stem, also the page's manifest key.
    pub name: String,
    pub mount_point: String,
}

/// Every `*.tsx` file directly inside `dir`, sorted by name.
pub fn discover_pages(dir: &Path) -> Result<Vec<PageSpec>> {
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("tsx") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        pages.push(PageSpec {
            mount_point: default_mount_point(&path),
            name,
            component: path,
        });
    }
    pages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pages)
}
