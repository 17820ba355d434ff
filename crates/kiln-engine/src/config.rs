//! Engine configuration.
//!
//! [`EngineConfig`] is a plain struct with builder-style setters. It can also
//! be read from `KILN_*` environment variables with [`EngineConfig::from_env`].

use kiln_common::{resolve_against, KilnError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_STACK_SIZE: usize = 256 * 1024;
const MAX_RENDER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Whether cache misses may be built on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Misses are built by the orchestrator; stylesheets may come from a watcher.
    Development,
    /// Every artifact must be registered ahead of time; a miss is a
    /// configuration error.
    Prebuilt,
}

impl EngineMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(EngineMode::Development),
            "prebuilt" | "prod" | "production" => Some(EngineMode::Prebuilt),
            _ => None,
        }
    }
}

/// Stylesheet compilation and watch-mode settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleConfig {
    /// Stylesheet source, relative to the project root.
    pub stylesheet: PathBuf,
    /// Extra content globs handed to the compiler in watch mode.
    pub content_globs: Vec<String>,
    /// Use a long-running watch subprocess in development mode.
    pub watch: bool,
    /// Directory watch outputs are written to.
    pub watch_dir: PathBuf,
    /// Polls for the watch output to become non-empty before giving up.
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    /// Polls for the watch output to catch up with a request before serving
    /// whatever is there.
    pub freshness_attempts: u32,
    pub freshness_interval: Duration,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            stylesheet: PathBuf::from("app/app.css"),
            content_globs: Vec::new(),
            watch: true,
            watch_dir: std::env::temp_dir(),
            ready_attempts: 100,
            ready_interval: Duration::from_millis(50),
            freshness_attempts: 40,
            freshness_interval: Duration::from_millis(25),
        }
    }
}

impl StyleConfig {
    /// Upper bound on how long a first request waits for a watcher.
    pub fn ready_budget(&self) -> Duration {
        self.ready_interval * self.ready_attempts
    }
}

/// Engine configuration.
///
/// # Example
///
/// ```
/// use kiln_engine::{EngineConfig, EngineMode};
/// use std::time::Duration;
///
/// let config = EngineConfig::new()
///     .with_render_timeout(Duration::from_millis(500))
///     .with_pool_size(4)
///     .with_mode(EngineMode::Prebuilt);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Per-render deadline. Zero disables it.
    pub render_timeout: Duration,
    /// Maximum number of live sandboxes.
    pub pool_size: usize,
    /// Maximum script stack size per sandbox, in bytes.
    pub stack_size: usize,
    /// Optional heap limit per sandbox, in bytes.
    pub memory_limit: Option<usize>,
    pub mode: EngineMode,
    pub project_root: PathBuf,
    pub app_dir: PathBuf,
    pub pages_dir: PathBuf,
    pub dist_dir: PathBuf,
    /// Minify bundles built on demand.
    pub minify: bool,
    pub styles: StyleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(2),
            pool_size: default_pool_size(),
            stack_size: 4 * 1024 * 1024,
            memory_limit: None,
            mode: EngineMode::Development,
            project_root: PathBuf::from("."),
            app_dir: PathBuf::from("app"),
            pages_dir: PathBuf::from("app/pages"),
            dist_dir: PathBuf::from("dist/build"),
            minify: true,
            styles: StyleConfig::default(),
        }
    }
}

/// Two sandboxes per logical core.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = lookup("KILN_RENDER_TIMEOUT_MS") {
            config.render_timeout = Duration::from_millis(parse_number("KILN_RENDER_TIMEOUT_MS", &ms)?);
        }
        if let Some(size) = lookup("KILN_POOL_SIZE") {
            config.pool_size = parse_number("KILN_POOL_SIZE", &size)?;
        }
        if let Some(size) = lookup("KILN_STACK_SIZE") {
            config.stack_size = parse_number("KILN_STACK_SIZE", &size)?;
        }
        if let Some(mode) = lookup("KILN_MODE") {
            config.mode = EngineMode::parse(&mode).ok_or_else(|| {
                KilnError::Config(format!("KILN_MODE must be \"dev\" or \"prebuilt\", got {:?}", mode))
            })?;
        }
        if lookup("KILN_DEV").as_deref() == Some("1") {
            config.mode = EngineMode::Development;
        }
        if let Some(watch) = lookup("KILN_WATCH_STYLES") {
            config.styles.watch = parse_flag("KILN_WATCH_STYLES", &watch)?;
        }
        if let Some(root) = lookup("KILN_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }

        Ok(config)
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_dist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dist_dir = dir.into();
        self
    }

    pub fn with_minify(mut self, minify: bool) -> Self {
        self.minify = minify;
        self
    }

    pub fn with_styles(mut self, styles: StyleConfig) -> Self {
        self.styles = styles;
        self
    }

    /// The render deadline, or `None` when disabled.
    pub fn render_deadline(&self) -> Option<Duration> {
        (!self.render_timeout.is_zero()).then_some(self.render_timeout)
    }

    pub fn is_prebuilt(&self) -> bool {
        self.mode == EngineMode::Prebuilt
    }

    /// Resolves `path` against the project root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let root = if self.project_root.is_absolute() {
            self.project_root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| resolve_against(&cwd, &self.project_root))
                .unwrap_or_else(|_| self.project_root.clone())
        };
        resolve_against(&root, path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(KilnError::Config("pool size must be greater than zero".into()));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(KilnError::Config(format!(
                "stack size must be at least {} bytes (got {})",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        if self.render_timeout > MAX_RENDER_TIMEOUT {
            return Err(KilnError::Config(format!(
                "render timeout must be <= 1 hour (got {} seconds)",
                self.render_timeout.as_secs()
            )));
        }
        if self.styles.ready_attempts == 0 || self.styles.freshness_attempts == 0 {
            return Err(KilnError::Config("watcher attempt budgets must be greater than zero".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KilnError::Config(format!("{} must be a non-negative integer, got {:?}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(KilnError::Config(format!("{} must be a boolean, got {:?}", key, value))),
    }
}
