//! Kiln Engine
//!
//! This crate builds, caches and executes the artifacts a server-rendered
//! component needs: a server script evaluated in a sandbox to produce
//! markup, a client script that hydrates it, and a stylesheet.
//!
//! # Components
//!
//! - [`runtime`] - sandboxes (QuickJS) and the bounded execution pool
//! - [`cache`] - artifact cache with file-fingerprint staleness
//! - [`build`] - concurrent three-stage build orchestrator plus the
//!   bundler and style compiler adapters
//! - [`watcher`] - development-mode stylesheet watch subprocesses
//! - [`executor`] - one render call, cache to markup
//! - [`engine`] - the [`Engine`] facade owning all of the above
//!
//! # Example
//!
//! ```no_run
//! use kiln_engine::{Engine, EngineConfig, RenderRequest};
//! use serde_json::json;
//!
//! # async fn run() -> kiln_common::Result<()> {
//! kiln_engine::logging::init();
//! let engine = Engine::new(EngineConfig::from_env()?)?;
//! let output = engine
//!     .render(RenderRequest::new("app/pages/home.tsx").with_props(json!({ "title": "Hello" })))
//!     .await?;
//! println!("{}", output.html);
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod logging;
pub mod manifest;
pub mod pages;
pub mod runtime;
pub mod watcher;

pub use build::{BuildOrchestrator, BuildOutcome};
pub use cache::{ArtifactCache, CacheLookup};
pub use config::{EngineConfig, EngineMode, StyleConfig};
pub use engine::{Engine, EngineBuilder, RenderRequest};
pub use executor::{RenderExecutor, RenderOutput};
pub use manifest::{ManifestEntry, PrebuiltFiles};
pub use pages::{discover_pages, PageSpec};
pub use watcher::{WatcherRegistry, WatcherStatus};
