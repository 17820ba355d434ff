// Shared test doubles and fixtures for the kiln-engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_common::{CompileError, KilnError, Result};
use kiln_engine::build::bundler::{BundleOutput, BundleRequest, BundleTarget, Bundler};
use kiln_engine::build::style::{StyleCompiler, WatchProcess};
use kiln_engine::runtime::{InterruptHandler, QuickJsEngine, Sandbox, SandboxOptions, ScriptEngine, ScriptError, ScriptValue};
use kiln_engine::{Engine, EngineConfig, EngineMode, StyleConfig};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Renders `<h1>{props.title}</h1>`.
pub const TITLE_SERVER_SCRIPT: &str = r#"
globalThis.__kilnRender = function (propsJson) {
  var props = JSON.parse(propsJson);
  return "<h1>" + props.title + "</h1>";
};
"#;

pub const LOOPING_SERVER_SCRIPT: &str = r#"
globalThis.__kilnRender = function () {
  for (;;) {}
};
"#;

// ============================================================================
// Fixture project
// ============================================================================

/// `app/pages/home.tsx`, `app/components/title.tsx` and `app/app.css` in a
/// temp directory.
pub struct Project {
    pub dir: TempDir,
    pub component: PathBuf,
    pub helper: PathBuf,
    pub stylesheet: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pages = dir.path().join("app/pages");
        let components = dir.path().join("app/components");
        std::fs::create_dir_all(&pages).unwrap();
        std::fs::create_dir_all(&components).unwrap();

        let component = pages.join("home.tsx");
        let helper = components.join("title.tsx");
        let stylesheet = dir.path().join("app/app.css");
        std::fs::write(&component, "import Title from '../components/title';\nexport default Title;\n").unwrap();
        std::fs::write(&helper, "export default (p) => <h1>{p.title}</h1>;\n").unwrap();
        std::fs::write(&stylesheet, "@import \"tailwindcss\";\n").unwrap();

        Self {
            dir,
            component,
            helper,
            stylesheet,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Development mode, watchers off, with outputs kept inside the project.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_project_root(self.root())
            .with_mode(EngineMode::Development)
            .with_pool_size(2)
            .with_render_timeout(Duration::from_secs(5))
            .with_styles(StyleConfig {
                watch: false,
                watch_dir: self.root().to_path_buf(),
                ..StyleConfig::default()
            })
    }

    pub fn watch_config(&self) -> StyleConfig {
        StyleConfig {
            watch: true,
            watch_dir: self.root().to_path_buf(),
            ready_attempts: 50,
            ready_interval: Duration::from_millis(10),
            freshness_attempts: 5,
            freshness_interval: Duration::from_millis(5),
            ..StyleConfig::default()
        }
    }
}

pub struct Doubles {
    pub bundler: Arc<FakeBundler>,
    pub styles: Arc<FakeStyleCompiler>,
    pub sandboxes: Arc<CountingEngine>,
}

/// An engine with every collaborator replaced by a double. Scripts still
/// run in real QuickJS sandboxes.
pub fn engine(project: &Project, config: EngineConfig) -> (Engine, Doubles) {
    let doubles = Doubles {
        bundler: Arc::new(FakeBundler::new(project.helper.clone())),
        styles: Arc::new(FakeStyleCompiler::new("body{color:red}")),
        sandboxes: Arc::new(CountingEngine::new()),
    };
    let engine = Engine::builder(config)
        .bundler(doubles.bundler.clone())
        .style_compiler(doubles.styles.clone())
        .script_engine(doubles.sandboxes.clone())
        .build()
        .unwrap();
    (engine, doubles)
}

// ============================================================================
// Bundler double
// ============================================================================

/// Reports the component, one helper file and the entry as inputs.
pub struct FakeBundler {
    helper: PathBuf,
    builds: AtomicUsize,
    delay_ms: AtomicU64,
    fail_with: Mutex<Option<String>>,
    server_script: Mutex<String>,
}

impl FakeBundler {
    pub fn new(helper: PathBuf) -> Self {
        Self {
            helper,
            builds: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            fail_with: Mutex::new(None),
            server_script: Mutex::new(TITLE_SERVER_SCRIPT.to_string()),
        }
    }

    /// Bundle invocations; one build of a component runs two.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_with(&self, message: Option<&str>) {
        *self.fail_with.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_server_script(&self, script: &str) {
        *self.server_script.lock().unwrap() = script.to_string();
    }
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn build(&self, request: &BundleRequest) -> Result<BundleOutput> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failure = self.fail_with.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(CompileError::new(message)
                .with_file(&request.component)
                .with_position(1, 1)
                .into());
        }

        let text = match &request.target {
            BundleTarget::Server => self.server_script.lock().unwrap().clone(),
            BundleTarget::Client { mount_point } => format!("hydrate({:?});", mount_point),
        };

        Ok(BundleOutput {
            text,
            inputs: vec![
                request.entry_point.clone(),
                request.component.clone(),
                self.helper.clone(),
            ],
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

// ============================================================================
// Style compiler double
// ============================================================================

/// Counts launches. Watch processes write the CSS shortly after starting
/// (unless told not to) and run until [`FakeStyleCompiler::exit_all`] or a kill.
pub struct FakeStyleCompiler {
    css: String,
    launches: AtomicUsize,
    compiles: AtomicUsize,
    fail_watch: AtomicBool,
    silent_watch: AtomicBool,
    exits: Mutex<Vec<oneshot::Sender<()>>>,
    killed: Arc<AtomicUsize>,
}

impl FakeStyleCompiler {
    pub fn new(css: &str) -> Self {
        Self {
            css: css.to_string(),
            launches: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            fail_watch: AtomicBool::new(false),
            silent_watch: AtomicBool::new(false),
            exits: Mutex::new(Vec::new()),
            killed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Make `start_watch` fail.
    pub fn fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// Start watchers that never write output.
    pub fn silent_watch(&self, silent: bool) {
        self.silent_watch.store(silent, Ordering::SeqCst);
    }

    /// Makes every running watch process exit.
    pub fn exit_all(&self) {
        for exit in self.exits.lock().unwrap().drain(..) {
            let _ = exit.send(());
        }
    }
}

#[async_trait]
impl StyleCompiler for FakeStyleCompiler {
    async fn compile(&self, _input: &Path, output: &Path) -> Result<String> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output, &self.css).await?;
        Ok(self.css.clone())
    }

    async fn start_watch(
        &self,
        _input: &Path,
        output: &Path,
        _content_globs: &[String],
    ) -> Result<Box<dyn WatchProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        // widen the window for concurrent first requests
        tokio::time::sleep(Duration::from_millis(20)).await;

        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(KilnError::Watcher("fake runner not installed".into()));
        }

        if !self.silent_watch.load(Ordering::SeqCst) {
            let output = output.to_path_buf();
            let css = self.css.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tokio::fs::write(output, css).await;
            });
        }

        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().push(tx);
        Ok(Box::new(FakeWatchProcess {
            exit: Some(rx),
            killed: Arc::clone(&self.killed),
        }))
    }
}

pub struct FakeWatchProcess {
    exit: Option<oneshot::Receiver<()>>,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl WatchProcess for FakeWatchProcess {
    async fn wait(&mut self) -> io::Result<String> {
        match self.exit.take() {
            Some(exit) => {
                let _ = exit.await;
                Ok("exit status: 1".to_string())
            }
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        Some(4242)
    }
}

// ============================================================================
// Script engine double
// ============================================================================

/// Real QuickJS sandboxes that count how many are alive and can be told to
/// linger in every evaluation.
pub struct CountingEngine {
    inner: QuickJsEngine,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    created: AtomicUsize,
    hold_ms: Arc<AtomicU64>,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self {
            inner: QuickJsEngine::new(),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
            hold_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn hold(&self, duration: Duration) {
        self.hold_ms.store(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ScriptEngine for CountingEngine {
    fn create(&self, options: &SandboxOptions) -> std::result::Result<Box<dyn Sandbox>, ScriptError> {
        let inner = self.inner.create(options)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(CountingSandbox {
            inner,
            live: Arc::clone(&self.live),
            hold_ms: Arc::clone(&self.hold_ms),
        }))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

struct CountingSandbox {
    inner: Box<dyn Sandbox>,
    live: Arc<AtomicUsize>,
    hold_ms: Arc<AtomicU64>,
}

impl Sandbox for CountingSandbox {
    fn eval(&mut self, source: &str) -> std::result::Result<ScriptValue, ScriptError> {
        let hold = self.hold_ms.load(Ordering::SeqCst);
        if hold > 0 {
            std::thread::sleep(Duration::from_millis(hold));
        }
        self.inner.eval(source)
    }

    fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>) {
        self.inner.set_interrupt_handler(handler);
    }
}

impl Drop for CountingSandbox {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Polls `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
