//! Kiln Common Types
//!
//! This crate provides the vocabulary shared by every part of the kiln
//! render engine: the error type, the three build artifacts, and the file
//! fingerprints used to decide whether cached artifacts are still valid.
//!
//! # Overview
//!
//! Kiln renders components to markup on the server from three pre-compiled
//! artifacts:
//!
//! - **Server script**: an IIFE bundle exposing a render entry point
//! - **Client script**: the hydration bundle for one mount point
//! - **Stylesheet**: the compiled CSS shared by every mount point
//!
//! # Components
//!
//! - [`error`] - `KilnError`, `CompileError`, and the crate-wide `Result`
//! - [`artifact`] - `Artifacts` and `BuildStage`
//! - [`fingerprint`] - `FileFingerprint` and `FingerprintSet`
//! - [`paths`] - path normalization and naming helpers
//!
//! # Example
//!
//! ```no_run
//! use kiln_common::{FingerprintSet, default_mount_point};
//! use std::path::PathBuf;
//!
//! let deps = vec![PathBuf::from("/srv/app/pages/home.tsx")];
//! let fingerprints = FingerprintSet::capture(&deps);
//! assert_eq!(fingerprints.first_stale(), None);
//! assert_eq!(default_mount_point("app/pages/home.tsx"), "home-root");
//! ```

pub mod artifact;
pub mod error;
pub mod fingerprint;
pub mod paths;

pub use artifact::{Artifacts, BuildStage};
pub use error::{CompileError, KilnError, Result};
pub use fingerprint::{FileFingerprint, FileState, FingerprintSet};
pub use paths::{default_mount_point, resolve_abs_path, resolve_against, short_hash};
