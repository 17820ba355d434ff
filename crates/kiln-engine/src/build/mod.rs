//! Build Orchestrator.
//!
//! Builds the server script, client script and stylesheet for a component
//! as three concurrent tasks, then merges what each one read into a single
//! dependency list. The three artifacts share that list, so a change to any
//! input invalidates all of them together.

pub mod bundler;
pub mod entry;
pub mod style;

use crate::cache::ArtifactCache;
use crate::watcher::WatcherRegistry;
use bundler::{BundleRequest, BundleTarget, Bundler};
use futures::FutureExt;
use kiln_common::{Artifacts, BuildStage, FingerprintSet, KilnError, Result};
use kiln_metrics::MetricsRegistry;
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use style::StyleCompiler;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of a successful [`BuildOrchestrator::build_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub artifacts: Artifacts,
    /// Absolute, deduplicated and sorted.
    pub dependencies: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct StageOutput {
    text: String,
    dependencies: Vec<PathBuf>,
}

type StageResult = (BuildStage, Result<StageOutput>);

pub struct BuildOrchestrator {
    bundler: Arc<dyn Bundler>,
    styles: Arc<dyn StyleCompiler>,
    watchers: Option<Arc<WatcherRegistry>>,
    cache: Arc<ArtifactCache>,
    metrics: Arc<MetricsRegistry>,
    stylesheet: PathBuf,
    minify: bool,
    invocations: AtomicU64,
}

impl BuildOrchestrator {
    /// `stylesheet` must be absolute. With `watchers` set the stylesheet
    /// comes from a watch subprocess, falling back to a one-shot compile.
    pub fn new(
        bundler: Arc<dyn Bundler>,
        styles: Arc<dyn StyleCompiler>,
        watchers: Option<Arc<WatcherRegistry>>,
        cache: Arc<ArtifactCache>,
        metrics: Arc<MetricsRegistry>,
        stylesheet: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bundler,
            styles,
            watchers,
            cache,
            metrics,
            stylesheet: stylesheet.into(),
            minify: true,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn with_minify(mut self, minify: bool) -> Self {
        self.minify = minify;
        self
    }

    /// Number of times [`BuildOrchestrator::build_all`] has run.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn stylesheet(&self) -> &Path {
        &self.stylesheet
    }

    /// Runs the three stages concurrently and waits for all of them.
    ///
    /// A failing stage does not cancel its siblings; their output is
    /// discarded. The first failure to complete is returned, wrapped with its
    /// stage.
    pub async fn build_all(&self, component: &Path, mount_point: &str) -> Result<BuildOutcome> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_build_started();
        let requested_at = SystemTime::now();
        let started = Instant::now();

        let mut stages: JoinSet<StageResult> = JoinSet::new();
        spawn_stage(
            &mut stages,
            BuildStage::Server,
            bundle(
                Arc::clone(&self.bundler),
                component.to_path_buf(),
                BundleTarget::Server,
                self.minify,
            ),
        );
        spawn_stage(
            &mut stages,
            BuildStage::Client,
            bundle(
                Arc::clone(&self.bundler),
                component.to_path_buf(),
                BundleTarget::Client {
                    mount_point: mount_point.to_string(),
                },
                self.minify,
            ),
        );
        spawn_stage(
            &mut stages,
            BuildStage::Stylesheet,
            compile_stylesheet(
                Arc::clone(&self.styles),
                self.watchers.clone(),
                component.to_path_buf(),
                self.stylesheet.clone(),
                requested_at,
            ),
        );

        let mut server = None;
        let mut client = None;
        let mut css = None;
        let mut first_error = None;

        while let Some(joined) = stages.join_next().await {
            match joined {
                Ok((stage, Ok(output))) => match stage {
                    BuildStage::Server => server = Some(output),
                    BuildStage::Client => client = Some(output),
                    BuildStage::Stylesheet => css = Some(output),
                },
                Ok((stage, Err(e))) => {
                    debug!("{} stage for {} failed: {}", stage, component.display(), e);
                    if first_error.is_none() {
                        first_error = Some(e.in_stage(stage));
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(KilnError::Internal(format!("build task failed: {}", e)));
                    }
                }
            }
        }

        let outcome = match (first_error, server, client, css) {
            (None, Some(server), Some(client), Some(css)) => {
                let dependencies: BTreeSet<PathBuf> = server
                    .dependencies
                    .into_iter()
                    .chain(client.dependencies)
                    .chain(css.dependencies)
                    .collect();
                Ok(BuildOutcome {
                    artifacts: Artifacts::new(server.text, client.text, css.text),
                    dependencies: dependencies.into_iter().collect(),
                })
            }
            (Some(e), ..) => Err(e),
            _ => Err(KilnError::Internal("build stage produced no output".into())),
        };

        self.metrics.record_build_finished(outcome.is_ok());
        if let Ok(outcome) = &outcome {
            debug!(
                "Built {} ({}) in {:?} with {} dependencies",
                component.display(),
                mount_point,
                started.elapsed(),
                outcome.dependencies.len()
            );
        }
        outcome
    }

    /// Builds, fingerprints the merged dependencies and stores the result.
    pub async fn build_and_store(&self, component: &Path, mount_point: &str) -> Result<Artifacts> {
        let outcome = self.build_all(component, mount_point).await?;

        let fingerprints = FingerprintSet::capture(&outcome.dependencies);
        for path in fingerprints.missing() {
            debug!("Dependency {} is missing; its creation will invalidate the entry", path.display());
        }

        self.cache
            .store_built(component, mount_point, outcome.artifacts.clone(), fingerprints);
        Ok(outcome.artifacts)
    }
}

fn spawn_stage<F>(stages: &mut JoinSet<StageResult>, stage: BuildStage, work: F)
where
    F: Future<Output = Result<StageOutput>> + Send + 'static,
{
    stages.spawn(async move {
        let started = Instant::now();
        let result = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(KilnError::Internal(format!(
                "{} stage panicked: {}",
                stage,
                panic_message(panic.as_ref())
            ))),
        };
        debug!("{} stage finished in {:?}", stage, started.elapsed());
        (stage, result)
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn bundle(
    bundler: Arc<dyn Bundler>,
    component: PathBuf,
    target: BundleTarget,
    minify: bool,
) -> Result<StageOutput> {
    // removed when it goes out of scope
    let scratch = tempfile::Builder::new().prefix("kiln-entry-").tempdir()?;

    let (file_name, source) = match &target {
        BundleTarget::Server => ("server-entry.js", entry::server_entry(&component)),
        BundleTarget::Client { mount_point } => {
            ("client-entry.js", entry::client_entry(&component, mount_point))
        }
    };
    let entry_point = scratch.path().join(file_name);
    tokio::fs::write(&entry_point, source).await?;

    let request = BundleRequest {
        entry_point,
        component,
        target,
        minify,
    };
    let output = bundler.build(&request).await?;

    // bundlers may report the scratch dir through a symlinked temp path
    let canonical = std::fs::canonicalize(scratch.path()).ok();
    let dependencies = output
        .inputs
        .into_iter()
        .filter(|path| {
            !path.starts_with(scratch.path()) && canonical.as_ref().map_or(true, |c| !path.starts_with(c))
        })
        .collect();

    Ok(StageOutput {
        text: output.text,
        dependencies,
    })
}

async fn compile_stylesheet(
    styles: Arc<dyn StyleCompiler>,
    watchers: Option<Arc<WatcherRegistry>>,
    component: PathBuf,
    stylesheet: PathBuf,
    requested_at: SystemTime,
) -> Result<StageOutput> {
    if !tokio::fs::try_exists(&stylesheet).await.unwrap_or(false) {
        debug!("No stylesheet at {}; serving none", stylesheet.display());
        return Ok(StageOutput {
            text: String::new(),
            dependencies: vec![stylesheet],
        });
    }

    if let Some(registry) = watchers {
        match registry.stylesheet(&component, &stylesheet, requested_at).await {
            Ok(text) => {
                return Ok(StageOutput {
                    text,
                    dependencies: vec![stylesheet],
                })
            }
            Err(e) => warn!(
                "Stylesheet watcher unavailable for {} ({}); compiling once",
                stylesheet.display(),
                e
            ),
        }
    }

    let text = compile_once(styles.as_ref(), &stylesheet).await?;
    Ok(StageOutput {
        text,
        dependencies: vec![stylesheet],
    })
}

async fn compile_once(styles: &dyn StyleCompiler, input: &Path) -> Result<String> {
    let output = tempfile::Builder::new()
        .prefix("kiln-style-")
        .suffix(".css")
        .tempfile()?;
    styles.compile(input, output.path()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::bundler::BundleOutput;
    use crate::build::style::WatchProcess;
    use crate::cache::CacheLookup;
    use async_trait::async_trait;
    use kiln_common::CompileError;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Echoes the target into the bundle and reports the component, one
    /// shared helper and the generated entry as inputs.
    struct EchoBundler {
        helper: PathBuf,
        fail_client: bool,
        panic_server: bool,
    }

    #[async_trait]
    impl Bundler for EchoBundler {
        async fn build(&self, request: &BundleRequest) -> Result<BundleOutput> {
            let text = match &request.target {
                BundleTarget::Server if self.panic_server => panic!("server bundler blew up"),
                BundleTarget::Server => "server".to_string(),
                BundleTarget::Client { .. } if self.fail_client => {
                    return Err(CompileError::new("unexpected token")
                        .with_file(&request.component)
                        .with_position(1, 1)
                        .into())
                }
                BundleTarget::Client { mount_point } => format!("client:{}", mount_point),
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
    }

    struct CountingStyles {
        compiles: AtomicUsize,
    }

    #[async_trait]
    impl StyleCompiler for CountingStyles {
        async fn compile(&self, _input: &Path, _output: &Path) -> Result<String> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok("body{}".to_string())
        }

        async fn start_watch(
            &self,
            _input: &Path,
            _output: &Path,
            _content_globs: &[String],
        ) -> Result<Box<dyn WatchProcess>> {
            Err(KilnError::Watcher("watch mode disabled".into()))
        }
    }

    struct Fixture {
        dir: TempDir,
        component: PathBuf,
        helper: PathBuf,
        stylesheet: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let component = dir.path().join("home.tsx");
        let helper = dir.path().join("button.tsx");
        let stylesheet = dir.path().join("app.css");
        std::fs::write(&component, "export default () => null").unwrap();
        std::fs::write(&helper, "export const Button = 1").unwrap();
        std::fs::write(&stylesheet, "@import 'tailwindcss';").unwrap();
        Fixture {
            dir,
            component,
            helper,
            stylesheet,
        }
    }

    fn orchestrator(fx: &Fixture, bundler: EchoBundler) -> (BuildOrchestrator, Arc<ArtifactCache>, Arc<CountingStyles>) {
        let cache = Arc::new(ArtifactCache::new());
        let styles = Arc::new(CountingStyles {
            compiles: AtomicUsize::new(0),
        });
        let orchestrator = BuildOrchestrator::new(
            Arc::new(bundler),
            styles.clone(),
            None,
            Arc::clone(&cache),
            Arc::new(MetricsRegistry::new()),
            fx.stylesheet.clone(),
        );
        (orchestrator, cache, styles)
    }

    fn echo(fx: &Fixture) -> EchoBundler {
        EchoBundler {
            helper: fx.helper.clone(),
            fail_client: false,
            panic_server: false,
        }
    }

    #[tokio::test]
    async fn test_build_all_merges_dependencies() {
        let fx = fixture();
        let (orchestrator, _, styles) = orchestrator(&fx, echo(&fx));

        let outcome = orchestrator.build_all(&fx.component, "home-root").await.unwrap();
        assert_eq!(&*outcome.artifacts.server_script, "server");
        assert_eq!(&*outcome.artifacts.client_script, "client:home-root");
        assert_eq!(&*outcome.artifacts.stylesheet, "body{}");

        // entry files are dropped; the rest are deduplicated across stages
        let mut expected = vec![fx.component.clone(), fx.helper.clone(), fx.stylesheet.clone()];
        expected.sort();
        assert_eq!(outcome.dependencies, expected);
        assert_eq!(styles.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.invocations(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_with_stage() {
        let fx = fixture();
        let bundler = EchoBundler {
            fail_client: true,
            ..echo(&fx)
        };
        let (orchestrator, cache, _) = orchestrator(&fx, bundler);

        let err = orchestrator
            .build_and_store(&fx.component, "home-root")
            .await
            .unwrap_err();
        assert_eq!(err.build_stage(), Some(BuildStage::Client));
        assert!(err.to_string().contains("unexpected token"));
        assert!(cache.is_empty());
        assert_eq!(orchestrator.metrics.snapshot().builds.failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_stage_becomes_internal_error() {
        let fx = fixture();
        let bundler = EchoBundler {
            panic_server: true,
            ..echo(&fx)
        };
        let (orchestrator, _, _) = orchestrator(&fx, bundler);

        let err = orchestrator.build_all(&fx.component, "home-root").await.unwrap_err();
        assert_eq!(err.build_stage(), Some(BuildStage::Server));
        assert!(err.to_string().contains("server bundler blew up"));
    }

    #[tokio::test]
    async fn test_build_and_store_fingerprints_dependencies() {
        let fx = fixture();
        let (orchestrator, cache, _) = orchestrator(&fx, echo(&fx));

        let artifacts = orchestrator.build_and_store(&fx.component, "home-root").await.unwrap();
        assert_eq!(cache.read(&fx.component, "home-root"), Some(artifacts));

        std::fs::write(&fx.helper, "export const Button = 2; // edited").unwrap();
        assert_eq!(
            cache.lookup(&fx.component, "home-root"),
            CacheLookup::Stale {
                changed: fx.helper.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_stylesheet_yields_empty_css() {
        let fx = fixture();
        std::fs::remove_file(&fx.stylesheet).unwrap();
        let (orchestrator, _, styles) = orchestrator(&fx, echo(&fx));

        let outcome = orchestrator.build_all(&fx.component, "home-root").await.unwrap();
        assert_eq!(&*outcome.artifacts.stylesheet, "");
        assert!(outcome.dependencies.contains(&fx.stylesheet));
        assert_eq!(styles.compiles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_creating_missing_stylesheet_invalidates_entry() {
        let fx = fixture();
        std::fs::remove_file(&fx.stylesheet).unwrap();
        let (orchestrator, cache, styles) = orchestrator(&fx, echo(&fx));

        orchestrator.build_and_store(&fx.component, "home-root").await.unwrap();
        assert!(cache.read(&fx.component, "home-root").is_some());

        std::fs::write(&fx.stylesheet, "@import 'tailwindcss';").unwrap();
        assert_eq!(
            cache.lookup(&fx.component, "home-root"),
            CacheLookup::Stale {
                changed: fx.stylesheet.clone()
            }
        );

        let artifacts = orchestrator.build_and_store(&fx.component, "home-root").await.unwrap();
        assert_eq!(&*artifacts.stylesheet, "body{}");
        assert_eq!(styles.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
