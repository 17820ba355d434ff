//! Render Executor.
//!
//! One render call goes through cache resolution, an optional build, sandbox
//! acquisition, script evaluation and the render invocation. The sandbox is
//! released on every path out.

use crate::build::entry::render_invocation;
use crate::build::BuildOrchestrator;
use crate::cache::{ArtifactCache, CacheLookup};
use crate::runtime::{Deadline, ExecutionPool, PoolSlot, ScriptError, ScriptValue};
use kiln_common::{Artifacts, KilnError, Result};
use kiln_metrics::MetricsRegistry;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Markup plus the artifacts a page needs to hydrate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub html: String,
    pub client_script: Arc<str>,
    pub stylesheet: Arc<str>,
}

pub struct RenderExecutor {
    cache: Arc<ArtifactCache>,
    orchestrator: Arc<BuildOrchestrator>,
    pool: Arc<ExecutionPool>,
    metrics: Arc<MetricsRegistry>,
    render_timeout: Option<Duration>,
    prebuilt: bool,
}

impl RenderExecutor {
    pub fn new(
        cache: Arc<ArtifactCache>,
        orchestrator: Arc<BuildOrchestrator>,
        pool: Arc<ExecutionPool>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            cache,
            orchestrator,
            pool,
            metrics,
            render_timeout: None,
            prebuilt: false,
        }
    }

    /// `None` disables the deadline.
    pub fn with_render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.render_timeout = timeout;
        self
    }

    /// Treat every cache miss as a registration error instead of building.
    pub fn with_prebuilt(mut self, prebuilt: bool) -> Self {
        self.prebuilt = prebuilt;
        self
    }

    /// Renders `component` (absolute) at `mount_point`.
    pub async fn render(
        &self,
        component: &Path,
        mount_point: &str,
        props: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput> {
        let started = Instant::now();
        let result = self.render_inner(component, mount_point, props, cancel).await;

        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics
            .record_render(&component.to_string_lossy(), latency_us, result.is_ok());
        if let Err(e) = &result {
            debug!("Render of {} ({}) failed: {}", component.display(), mount_point, e);
        }
        result
    }

    async fn render_inner(
        &self,
        component: &Path,
        mount_point: &str,
        props: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput> {
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        let artifacts = self.resolve(component, mount_point).await?;
        let html = self
            .execute(Arc::clone(&artifacts.server_script), props, cancel)
            .await?;

        Ok(RenderOutput {
            html,
            client_script: artifacts.client_script,
            stylesheet: artifacts.stylesheet,
        })
    }

    /// Cached artifacts, building them first on a miss.
    pub async fn resolve(&self, component: &Path, mount_point: &str) -> Result<Artifacts> {
        match self.cache.lookup(component, mount_point) {
            CacheLookup::Hit(artifacts) => {
                self.metrics.record_cache_hit();
                debug!("Cache hit for {} ({})", component.display(), mount_point);
                return Ok(artifacts);
            }
            CacheLookup::Miss => {
                self.metrics.record_cache_miss();
                debug!("Cache miss for {} ({})", component.display(), mount_point);
            }
            CacheLookup::Stale { changed } => {
                self.metrics.record_cache_stale();
                debug!(
                    "Cache entry for {} is stale: {} changed",
                    component.display(),
                    changed.display()
                );
            }
        }

        if self.prebuilt {
            return Err(KilnError::NotRegistered {
                component: component.display().to_string(),
                mount_point: mount_point.to_string(),
            });
        }

        if !tokio::fs::try_exists(component).await.unwrap_or(false) {
            return Err(KilnError::InvalidRequest(format!(
                "component not found: {}",
                component.display()
            )));
        }

        // detached so a dropped render does not abort a build halfway
        let orchestrator = Arc::clone(&self.orchestrator);
        let component = component.to_path_buf();
        let mount_point = mount_point.to_string();
        tokio::spawn(async move { orchestrator.build_and_store(&component, &mount_point).await })
            .await
            .map_err(|e| KilnError::Internal(format!("build task failed: {}", e)))?
    }

    /// Evaluates `server_script` in a fresh sandbox and calls its render
    /// entry with `props` serialized to JSON.
    pub async fn execute(
        &self,
        server_script: Arc<str>,
        props: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let props_json = serde_json::to_string(props)?;
        let deadline = self.render_timeout.map(Deadline::after);

        let call = cancel.child_token();
        // interrupts the script if this future is dropped mid-render
        let _guard = call.clone().drop_guard();

        let slot = self.pool.acquire_slot(&call, deadline).await?;
        let token = call.clone();
        tokio::task::spawn_blocking(move || run_script(slot, &server_script, &props_json, token, deadline))
            .await
            .map_err(|e| KilnError::Internal(format!("render task failed: {}", e)))?
    }
}

fn run_script(
    slot: PoolSlot,
    script: &str,
    props_json: &str,
    cancel: CancellationToken,
    deadline: Option<Deadline>,
) -> Result<String> {
    let mut sandbox = slot.into_sandbox()?;

    let watched = cancel.clone();
    sandbox.set_interrupt_handler(Some(Box::new(move || {
        watched.is_cancelled() || deadline.is_some_and(|d| d.is_expired())
    })));

    let result = sandbox
        .eval(script)
        .and_then(|_| sandbox.eval(&render_invocation(props_json)));

    sandbox.set_interrupt_handler(None);
    drop(sandbox);

    match result {
        Ok(ScriptValue::String(html)) => Ok(html),
        Ok(other) => Err(KilnError::Execution(format!(
            "render returned non-string ({})",
            other.type_name()
        ))),
        Err(e) => Err(classify(e, &cancel, deadline)),
    }
}

/// An error after the deadline is a timeout and one after cancellation is a
/// cancellation, whatever the script reported.
fn classify(error: ScriptError, cancel: &CancellationToken, deadline: Option<Deadline>) -> KilnError {
    if let Some(deadline) = deadline.filter(Deadline::is_expired) {
        return deadline.timeout_error();
    }
    if cancel.is_cancelled() {
        return KilnError::Cancelled;
    }
    match error {
        ScriptError::Interrupted => KilnError::Execution("execution interrupted".into()),
        other => KilnError::Execution(other.to_string()),
    }
}
