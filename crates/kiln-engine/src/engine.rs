use crate::build::bundler::{Bundler, EsbuildCli};
use crate::build::style::{StyleCompiler, TailwindCli};
use crate::build::BuildOrchestrator;
use crate::cache::ArtifactCache;
use crate::config::EngineConfig;
use crate::executor::{RenderExecutor, RenderOutput};
use crate::manifest::{self, PrebuiltFiles};
use crate::pages::PageSpec;
use crate::runtime::{ExecutionPool, QuickJsEngine, SandboxOptions, ScriptEngine};
use crate::watcher::WatcherRegistry;
use kiln_common::{default_mount_point, Artifacts, KilnError, Result};
use kiln_metrics::{MetricsRegistry, MetricsSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One render call.
///
/// # Example
///
/// ```
/// use kiln_engine::RenderRequest;
/// use serde_json::json;
///
/// let request = RenderRequest::new("app/pages/home.tsx").with_props(json!({ "title": "Fixture" }));
/// assert_eq!(request.mount_point(), "home-root");
/// ```
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub component: PathBuf,
    /// Defaults to `<file stem>-root`.
    pub mount_point: Option<String>,
    pub props: serde_json::Value,
    pub cancel: CancellationToken,
}

impl RenderRequest {
    pub fn new(component: impl Into<PathBuf>) -> Self {
        Self {
            component: component.into(),
            mount_point: None,
            props: serde_json::Value::Object(Default::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn with_props(mut self, props: serde_json::Value) -> Self {
        self.props = props;
        self
    }

    /// Cancelling `cancel` aborts the render's script evaluation.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn mount_point(&self) -> String {
        self.mount_point
            .clone()
            .unwrap_or_else(|| default_mount_point(&self.component))
    }
}

/// Builds an [`Engine`], with any collaborator swapped out.
pub struct EngineBuilder {
    config: EngineConfig,
    script_engine: Option<Arc<dyn ScriptEngine>>,
    bundler: Option<Arc<dyn Bundler>>,
    styles: Option<Arc<dyn StyleCompiler>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl EngineBuilder {
    pub fn script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    pub fn bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    pub fn style_compiler(mut self, styles: Arc<dyn StyleCompiler>) -> Self {
        self.styles = Some(styles);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and wires everything together. Defaults
    /// are QuickJS, the esbuild CLI and the Tailwind CLI.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let project_root = config.resolve(".");
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(MetricsRegistry::new()));
        let script_engine = self
            .script_engine
            .unwrap_or_else(|| Arc::new(QuickJsEngine::new()) as Arc<dyn ScriptEngine>);
        let bundler = self
            .bundler
            .unwrap_or_else(|| Arc::new(EsbuildCli::new(&project_root)) as Arc<dyn Bundler>);
        let styles = self
            .styles
            .unwrap_or_else(|| Arc::new(TailwindCli::new(&project_root)) as Arc<dyn StyleCompiler>);

        let cache = Arc::new(ArtifactCache::new());
        let pool = Arc::new(ExecutionPool::new(
            script_engine,
            config.pool_size,
            SandboxOptions {
                stack_size: config.stack_size,
                memory_limit: config.memory_limit,
            },
            Arc::clone(&metrics),
        ));

        let watchers = (!config.is_prebuilt() && config.styles.watch).then(|| {
            Arc::new(WatcherRegistry::new(
                Arc::clone(&styles),
                config.styles.clone(),
                Arc::clone(&metrics),
            ))
        });

        let orchestrator = Arc::new(
            BuildOrchestrator::new(
                bundler,
                styles,
                watchers.clone(),
                Arc::clone(&cache),
                Arc::clone(&metrics),
                config.resolve(&config.styles.stylesheet),
            )
            .with_minify(config.minify),
        );

        let executor = RenderExecutor::new(
            Arc::clone(&cache),
            Arc::clone(&orchestrator),
            Arc::clone(&pool),
            Arc::clone(&metrics),
        )
        .with_render_timeout(config.render_deadline())
        .with_prebuilt(config.is_prebuilt());

        tracing::info!(
            "Engine ready: {:?} mode, {} sandbox slots, root {}",
            config.mode,
            config.pool_size,
            project_root.display()
        );

        Ok(Engine {
            config,
            cache,
            pool,
            watchers,
            orchestrator,
            executor,
            metrics,
        })
    }
}

/// The render engine: artifact cache, execution pool, watcher registry and
/// build orchestrator, owned together.
///
/// Construct one per process (or per test) and share it by reference.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<ArtifactCache>,
    pool: Arc<ExecutionPool>,
    watchers: Option<Arc<WatcherRegistry>>,
    orchestrator: Arc<BuildOrchestrator>,
    executor: RenderExecutor,
    metrics: Arc<MetricsRegistry>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            script_engine: None,
            bundler: None,
            styles: None,
            metrics: None,
        }
    }

    /// An engine with the default collaborators.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Renders a component to markup.
    ///
    /// Relative component paths are resolved against the project root.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderOutput> {
        let mount_point = request.mount_point();
        if request.component.as_os_str().is_empty() {
            return Err(KilnError::InvalidRequest("component path is required".into()));
        }
        if mount_point.is_empty() {
            return Err(KilnError::InvalidRequest("mount point is required".into()));
        }

        let component = self.config.resolve(&request.component);
        self.executor
            .render(&component, &mount_point, &request.props, &request.cancel)
            .await
    }

    /// Seeds the cache with externally built artifacts that never go stale.
    ///
    /// # Arguments
    /// * `component` - Component path, resolved against the project root
    /// * `mount_point` - Mount point the client script hydrates
    /// * `server_script`, `client_script`, `stylesheet` - The exact texts to serve
    pub fn register_pinned(
        &self,
        component: impl AsRef<Path>,
        mount_point: &str,
        server_script: &str,
        client_script: &str,
        stylesheet: &str,
    ) -> Result<()> {
        let component = component.as_ref();
        if component.as_os_str().is_empty() {
            return Err(KilnError::InvalidRequest("component path is required".into()));
        }
        if mount_point.is_empty() {
            return Err(KilnError::InvalidRequest("mount point is required".into()));
        }
        for (what, text) in [
            ("server script", server_script),
            ("client script", client_script),
            ("stylesheet", stylesheet),
        ] {
            if text.is_empty() {
                return Err(KilnError::InvalidRequest(format!("prebuilt {} cannot be empty", what)));
            }
        }

        let component = self.config.resolve(component);
        self.cache.store_pinned(
            &component,
            mount_point,
            Artifacts::new(server_script, client_script, stylesheet),
        );
        tracing::info!("Registered prebuilt {} ({})", component.display(), mount_point);
        Ok(())
    }

    /// Reads prebuilt files and pins them. Relative file paths are taken
    /// from `base_dir`.
    pub fn register_prebuilt_files(
        &self,
        component: impl AsRef<Path>,
        mount_point: &str,
        base_dir: &Path,
        files: &PrebuiltFiles,
    ) -> Result<()> {
        let read = |path: &Path, what: &str| -> Result<String> {
            let full = base_dir.join(path);
            std::fs::read_to_string(&full)
                .map_err(|e| KilnError::Manifest(format!("read {} {}: {}", what, full.display(), e)))
        };
        let server = read(&files.server, "server bundle")?;
        let client = read(&files.client, "client bundle")?;
        let css = read(&files.css, "stylesheet")?;
        self.register_pinned(component, mount_point, &server, &client, &css)
    }

    /// Pins the prebuilt artifacts of every page found in `dist`. Stops at
    /// the first page that fails and returns how many were registered.
    pub fn register_prebuilt_pages(&self, pages: &[PageSpec], dist: &Path) -> Result<usize> {
        let dist = self.config.resolve(dist);
        for page in pages {
            let files = manifest::resolve_prebuilt_files(&dist, &page.component)?;
            self.register_prebuilt_files(&page.component, &page.mount_point, &dist, &files)?;
        }
        Ok(pages.len())
    }

    /// Drops every cached entry, pinned ones included.
    pub fn reset_cache(&self) {
        self.cache.clear();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops every stylesheet watcher.
    pub fn shutdown(&self) {
        if let Some(watchers) = &self.watchers {
            watchers.shutdown();
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    pub fn watchers(&self) -> Option<&WatcherRegistry> {
        self.watchers.as_deref()
    }
}
