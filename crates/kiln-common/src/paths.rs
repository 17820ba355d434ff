use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves `path` against the current directory and normalizes `.` and
/// `..` lexically. Symlinks are not followed and the path need not exist.
pub fn resolve_abs_path(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

/// Resolves `path` against `base` instead of the current directory.
pub fn resolve_against(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `/..` stays at the root
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The mount point used when a request names none: `<file stem>-root`.
///
/// ```
/// use kiln_common::default_mount_point;
/// assert_eq!(default_mount_point("app/pages/about.tsx"), "about-root");
/// ```
pub fn default_mount_point(component: impl AsRef<Path>) -> String {
    match component.as_ref().file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => format!("{}-root", stem),
        _ => "root".to_string(),
    }
}

/// First eight hex characters of the SHA-256 of `input`.
pub fn short_hash(input: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(input.as_ref());
    let mut encoded = hex::encode(digest);
    encoded.truncate(8);
    encoded
}
