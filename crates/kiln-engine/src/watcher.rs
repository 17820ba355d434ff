//! Stylesheet watch-mode subprocesses for development.
//!
//! At most one watcher runs per stylesheet. An entry moves `Starting` to
//! `Ready` once its output file is non-empty, or to `Failed` when the
//! process exits or the readiness budget runs out. Failed entries are
//! removed right away so the next request starts over.
//!
//! Each entry has a generation number; a background task only removes the
//! entry it was started for, never a newer one for the same path.

use crate::build::style::{StyleCompiler, WatchProcess};
use crate::config::StyleConfig;
use kiln_common::{short_hash, KilnError, Result};
use kiln_metrics::MetricsRegistry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherStatus {
    Absent,
    Starting,
    Ready,
    Failed(String),
}

impl From<&WatcherState> for WatcherStatus {
    fn from(state: &WatcherState) -> Self {
        match state {
            WatcherState::Starting => WatcherStatus::Starting,
            WatcherState::Ready => WatcherStatus::Ready,
            WatcherState::Failed(reason) => WatcherStatus::Failed(reason.clone()),
        }
    }
}

struct WatcherEntry {
    generation: u64,
    output: PathBuf,
    state: watch::Receiver<WatcherState>,
    stop: CancellationToken,
}

type Entries = Arc<Mutex<HashMap<PathBuf, WatcherEntry>>>;

/// A caller's view of one watcher.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    pub output: PathBuf,
    pub generation: u64,
    state: watch::Receiver<WatcherState>,
}

impl WatcherHandle {
    pub fn state(&self) -> WatcherState {
        self.state.borrow().clone()
    }

    /// Waits until the watcher leaves `Starting`, for at most `budget`.
    pub async fn wait_ready(&mut self, budget: Duration) -> Result<()> {
        let settled = tokio::time::timeout(budget, self.state.wait_for(|s| *s != WatcherState::Starting)).await;
        match settled {
            Err(_) => Err(KilnError::Watcher(format!(
                "not ready after {}ms",
                budget.as_millis()
            ))),
            Ok(Err(_)) => Err(KilnError::Watcher("watcher stopped before becoming ready".into())),
            Ok(Ok(state)) => match &*state {
                WatcherState::Ready => Ok(()),
                WatcherState::Failed(reason) => Err(KilnError::Watcher(reason.clone())),
                WatcherState::Starting => Err(KilnError::Watcher("watcher still starting".into())),
            },
        }
    }
}

pub struct WatcherRegistry {
    compiler: Arc<dyn StyleCompiler>,
    config: StyleConfig,
    entries: Entries,
    next_generation: AtomicU64,
    root: CancellationToken,
    metrics: Arc<MetricsRegistry>,
}

impl WatcherRegistry {
    pub fn new(compiler: Arc<dyn StyleCompiler>, config: StyleConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            compiler,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            root: CancellationToken::new(),
            metrics,
        }
    }

    /// Where the watcher for `stylesheet` writes its output.
    pub fn output_path(&self, stylesheet: &Path) -> PathBuf {
        self.config
            .watch_dir
            .join(format!("kiln-watch-{}.css", short_hash(stylesheet.to_string_lossy().as_bytes())))
    }

    /// Returns the watcher for `stylesheet`, starting one if none exists.
    ///
    /// Concurrent first calls for the same stylesheet start a single process;
    /// later callers get a handle to the entry the first one inserted.
    pub async fn ensure_watcher(&self, component: &Path, stylesheet: &Path) -> Result<WatcherHandle> {
        if self.root.is_cancelled() {
            return Err(KilnError::Watcher("watcher registry is shut down".into()));
        }

        let (handle, tx, stop) = {
            let mut entries = lock(&self.entries);
            if let Some(entry) = entries.get(stylesheet) {
                return Ok(WatcherHandle {
                    output: entry.output.clone(),
                    generation: entry.generation,
                    state: entry.state.clone(),
                });
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = watch::channel(WatcherState::Starting);
            let stop = self.root.child_token();
            let output = self.output_path(stylesheet);
            entries.insert(
                stylesheet.to_path_buf(),
                WatcherEntry {
                    generation,
                    output: output.clone(),
                    state: rx.clone(),
                    stop: stop.clone(),
                },
            );
            (
                WatcherHandle {
                    output,
                    generation,
                    state: rx,
                },
                Arc::new(tx),
                stop,
            )
        };

        let pending = PendingLaunch {
            entries: Arc::clone(&self.entries),
            stylesheet: stylesheet.to_path_buf(),
            generation: handle.generation,
            stop: stop.clone(),
            armed: true,
        };
        let launched = self.launch(component, stylesheet, &handle, tx, stop).await;
        pending.disarm();
        launched?;
        Ok(handle)
    }

    async fn launch(
        &self,
        component: &Path,
        stylesheet: &Path,
        handle: &WatcherHandle,
        tx: Arc<watch::Sender<WatcherState>>,
        stop: CancellationToken,
    ) -> Result<()> {
        // an output left over from an earlier watcher would look ready
        let _ = tokio::fs::remove_file(&handle.output).await;

        self.metrics.record_watcher_launch();
        let process = match self
            .compiler
            .start_watch(stylesheet, &handle.output, &self.config.content_globs)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                let reason = e.to_string();
                // removed before waiters wake so a retry starts a new process
                remove_if_current(&self.entries, stylesheet, handle.generation);
                tx.send_replace(WatcherState::Failed(reason.clone()));
                stop.cancel();
                self.metrics.record_watcher_failure();
                warn!("Stylesheet watcher for {} failed to start: {}", stylesheet.display(), reason);
                return Err(KilnError::Watcher(reason));
            }
        };

        info!(
            "Started stylesheet watcher for {} (requested by {}, pid {:?})",
            stylesheet.display(),
            component.display(),
            process.id()
        );

        tokio::spawn(poll_ready(
            PollContext {
                entries: Arc::clone(&self.entries),
                stylesheet: stylesheet.to_path_buf(),
                output: handle.output.clone(),
                generation: handle.generation,
                tx: Arc::clone(&tx),
                stop: stop.clone(),
                metrics: Arc::clone(&self.metrics),
            },
            self.config.ready_attempts,
            self.config.ready_interval,
        ));

        tokio::spawn(monitor_exit(
            PollContext {
                entries: Arc::clone(&self.entries),
                stylesheet: stylesheet.to_path_buf(),
                output: handle.output.clone(),
                generation: handle.generation,
                tx,
                stop,
                metrics: Arc::clone(&self.metrics),
            },
            process,
        ));

        Ok(())
    }

    /// Compiled CSS from the watcher for `stylesheet`.
    ///
    /// Waits for readiness, then gives the output a bounded chance to catch
    /// up with `requested_at` before reading it.
    pub async fn stylesheet(&self, component: &Path, stylesheet: &Path, requested_at: SystemTime) -> Result<String> {
        let mut handle = self.ensure_watcher(component, stylesheet).await?;
        handle
            .wait_ready(self.config.ready_budget() + Duration::from_secs(1))
            .await?;

        if !self.wait_fresh(&handle.output, requested_at).await {
            debug!(
                "Watch output {} predates the request; serving it anyway",
                handle.output.display()
            );
        }

        let css = tokio::fs::read_to_string(&handle.output)
            .await
            .map_err(|e| KilnError::Watcher(format!("read {}: {}", handle.output.display(), e)))?;
        if css.trim().is_empty() {
            return Err(KilnError::Watcher(format!("{} is empty", handle.output.display())));
        }
        Ok(css)
    }

    async fn wait_fresh(&self, output: &Path, requested_at: SystemTime) -> bool {
        let attempts = self.config.freshness_attempts;
        for attempt in 0..attempts {
            if let Ok(metadata) = tokio::fs::metadata(output).await {
                let fresh = metadata.len() > 0
                    && metadata.modified().map(|m| m >= requested_at).unwrap_or(false);
                if fresh {
                    return true;
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.freshness_interval).await;
            }
        }
        false
    }

    pub fn status(&self, stylesheet: &Path) -> WatcherStatus {
        lock(&self.entries)
            .get(stylesheet)
            .map(|entry| WatcherStatus::from(&*entry.state.borrow()))
            .unwrap_or(WatcherStatus::Absent)
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every watcher and refuses new ones.
    pub fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<WatcherEntry> = lock(&self.entries).drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.stop.cancel();
        }
        if !drained.is_empty() {
            info!("Stopped {} stylesheet watcher(s)", drained.len());
        }
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn lock(entries: &Entries) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WatcherEntry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

fn remove_if_current(entries: &Entries, stylesheet: &Path, generation: u64) -> bool {
    let mut entries = lock(entries);
    if entries.get(stylesheet).is_some_and(|e| e.generation == generation) {
        entries.remove(stylesheet);
        true
    } else {
        false
    }
}

/// Removes a `Starting` entry whose launch was abandoned mid-way, for
/// example when the `ensure_watcher` future is dropped.
struct PendingLaunch {
    entries: Entries,
    stylesheet: PathBuf,
    generation: u64,
    stop: CancellationToken,
    armed: bool,
}

impl PendingLaunch {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        if self.armed {
            remove_if_current(&self.entries, &self.stylesheet, self.generation);
            self.stop.cancel();
            debug!("Abandoned watcher launch for {}", self.stylesheet.display());
        }
    }
}

struct PollContext {
    entries: Entries,
    stylesheet: PathBuf,
    output: PathBuf,
    generation: u64,
    tx: Arc<watch::Sender<WatcherState>>,
    stop: CancellationToken,
    metrics: Arc<MetricsRegistry>,
}

impl PollContext {
    /// Marks the watcher failed unless it already is; the first reason sticks.
    fn fail(&self, reason: String) {
        remove_if_current(&self.entries, &self.stylesheet, self.generation);
        self.tx.send_if_modified(|state| {
            if matches!(state, WatcherState::Failed(_)) {
                false
            } else {
                *state = WatcherState::Failed(reason);
                true
            }
        });
    }
}

async fn output_ready(output: &Path) -> bool {
    tokio::fs::metadata(output)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}

async fn poll_ready(ctx: PollContext, attempts: u32, interval: Duration) {
    for _ in 0..attempts {
        if ctx.stop.is_cancelled() {
            return;
        }
        if output_ready(&ctx.output).await {
            let promoted = ctx.tx.send_if_modified(|state| {
                if *state == WatcherState::Starting {
                    *state = WatcherState::Ready;
                    true
                } else {
                    false
                }
            });
            if promoted {
                info!("Stylesheet watcher for {} is ready", ctx.stylesheet.display());
            }
            return;
        }
        tokio::select! {
            _ = ctx.stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    let reason = format!(
        "no output in {} after {} attempts",
        ctx.output.display(),
        attempts
    );
    warn!("Stylesheet watcher for {}: {}", ctx.stylesheet.display(), reason);
    ctx.metrics.record_watcher_failure();
    ctx.fail(reason);
    // the exit monitor kills the process
    ctx.stop.cancel();
}

async fn monitor_exit(ctx: PollContext, mut process: Box<dyn WatchProcess>) {
    let exited = tokio::select! {
        result = process.wait() => Some(result),
        _ = ctx.stop.cancelled() => None,
    };

    match exited {
        Some(result) => {
            let reason = match result {
                Ok(status) => format!("watch process exited ({})", status),
                Err(e) => format!("waiting on watch process failed: {}", e),
            };
            warn!("Stylesheet watcher for {}: {}", ctx.stylesheet.display(), reason);
            ctx.metrics.record_watcher_failure();
            ctx.fail(reason);
            ctx.stop.cancel();
        }
        None => {
            if let Err(e) = process.kill().await {
                debug!("Killing watch process for {}: {}", ctx.stylesheet.display(), e);
            }
            ctx.fail("watcher stopped".into());
            debug!("Stylesheet watcher for {} stopped", ctx.stylesheet.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;

    struct NeverStarts;

    #[async_trait]
    impl StyleCompiler for NeverStarts {
        async fn compile(&self, _input: &Path, _output: &Path) -> Result<String> {
            Ok(String::new())
        }

        async fn start_watch(
            &self,
            _input: &Path,
            _output: &Path,
            _content_globs: &[String],
        ) -> Result<Box<dyn WatchProcess>> {
            Err(KilnError::Watcher("runner not found".into()))
        }
    }

    /// Hangs in `start_watch` until the test drops the call.
    struct HangsOnStart;

    #[async_trait]
    impl StyleCompiler for HangsOnStart {
        async fn compile(&self, _input: &Path, _output: &Path) -> Result<String> {
            Ok(String::new())
        }

        async fn start_watch(
            &self,
            _input: &Path,
            _output: &Path,
            _content_globs: &[String],
        ) -> Result<Box<dyn WatchProcess>> {
            std::future::pending().await
        }
    }

    struct Idle;

    #[async_trait]
    impl WatchProcess for Idle {
        async fn wait(&mut self) -> io::Result<String> {
            std::future::pending().await
        }

        async fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn registry(compiler: Arc<dyn StyleCompiler>) -> WatcherRegistry {
        let config = StyleConfig {
            watch_dir: PathBuf::from("/tmp/kiln-tests"),
            ..StyleConfig::default()
        };
        WatcherRegistry::new(compiler, config, Arc::new(MetricsRegistry::new()))
    }

    #[test]
    fn test_output_path_is_stable_per_stylesheet() {
        let registry = registry(Arc::new(NeverStarts));
        let a = registry.output_path(Path::new("/srv/app/app.css"));
        assert_eq!(a, registry.output_path(Path::new("/srv/app/app.css")));
        assert_ne!(a, registry.output_path(Path::new("/srv/other/app.css")));
        assert!(a.starts_with("/tmp/kiln-tests"));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("kiln-watch-"));
    }

    #[tokio::test]
    async fn test_start_failure_clears_entry() {
        let registry = registry(Arc::new(NeverStarts));
        let stylesheet = Path::new("/srv/app/app.css");

        let err = registry
            .ensure_watcher(Path::new("/srv/app/pages/home.tsx"), stylesheet)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Watcher(_)));
        assert_eq!(registry.status(stylesheet), WatcherStatus::Absent);
        assert_eq!(registry.metrics.snapshot().watchers.failures, 1);
    }

    #[tokio::test]
    async fn test_failed_entry_is_gone_when_waiter_wakes() {
        let registry = registry(Arc::new(NeverStarts));
        let stylesheet = PathBuf::from("/srv/app/app.css");
        let (tx, rx) = watch::channel(WatcherState::Starting);
        let stop = CancellationToken::new();
        lock(&registry.entries).insert(
            stylesheet.clone(),
            WatcherEntry {
                generation: 5,
                output: PathBuf::from("/tmp/out.css"),
                state: rx.clone(),
                stop: stop.clone(),
            },
        );
        let mut handle = WatcherHandle {
            output: PathBuf::from("/tmp/out.css"),
            generation: 5,
            state: rx,
        };
        let ctx = PollContext {
            entries: Arc::clone(&registry.entries),
            stylesheet: stylesheet.clone(),
            output: PathBuf::from("/tmp/out.css"),
            generation: 5,
            tx: Arc::new(tx),
            stop,
            metrics: Arc::clone(&registry.metrics),
        };

        let waiter = tokio::spawn(async move { handle.wait_ready(Duration::from_secs(2)).await });
        tokio::task::yield_now().await;
        ctx.fail("no output".into());

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(registry.status(&stylesheet), WatcherStatus::Absent);
    }

    #[tokio::test]
    async fn test_dropped_launch_clears_starting_entry() {
        let registry = registry(Arc::new(HangsOnStart));
        let component = Path::new("/srv/app/pages/home.tsx");
        let stylesheet = Path::new("/srv/app/app.css");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            registry.ensure_watcher(component, stylesheet),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(registry.status(stylesheet), WatcherStatus::Absent);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_remove_newer_entry() {
        let registry = registry(Arc::new(NeverStarts));
        let stylesheet = PathBuf::from("/srv/app/app.css");
        let (_tx, rx) = watch::channel(WatcherState::Starting);
        lock(&registry.entries).insert(
            stylesheet.clone(),
            WatcherEntry {
                generation: 7,
                output: PathBuf::from("/tmp/out.css"),
                state: rx,
                stop: CancellationToken::new(),
            },
        );

        assert!(!remove_if_current(&registry.entries, &stylesheet, 6));
        assert_eq!(registry.status(&stylesheet), WatcherStatus::Starting);
        assert!(remove_if_current(&registry.entries, &stylesheet, 7));
        assert_eq!(registry.status(&stylesheet), WatcherStatus::Absent);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_while_starting() {
        let (_tx, rx) = watch::channel(WatcherState::Starting);
        let mut handle = WatcherHandle {
            output: PathBuf::from("/tmp/out.css"),
            generation: 1,
            state: rx,
        };
        let err = handle.wait_ready(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_monitor_stop_kills_and_removes() {
        let registry = registry(Arc::new(NeverStarts));
        let stylesheet = PathBuf::from("/srv/app/app.css");
        let (tx, rx) = watch::channel(WatcherState::Ready);
        let stop = CancellationToken::new();
        lock(&registry.entries).insert(
            stylesheet.clone(),
            WatcherEntry {
                generation: 3,
                output: PathBuf::from("/tmp/out.css"),
                state: rx.clone(),
                stop: stop.clone(),
            },
        );

        let monitor = tokio::spawn(monitor_exit(
            PollContext {
                entries: Arc::clone(&registry.entries),
                stylesheet: stylesheet.clone(),
                output: PathBuf::from("/tmp/out.css"),
                generation: 3,
                tx: Arc::new(tx),
                stop: stop.clone(),
                metrics: Arc::clone(&registry.metrics),
            },
            Box::new(Idle),
        ));

        stop.cancel();
        monitor.await.unwrap();
        assert_eq!(registry.status(&stylesheet), WatcherStatus::Absent);
        assert!(matches!(&*rx.borrow(), WatcherState::Failed(_)));
    }
}
