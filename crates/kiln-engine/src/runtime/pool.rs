use crate::runtime::{InterruptHandler, Sandbox, SandboxOptions, ScriptEngine, ScriptError, ScriptValue, PRELUDE};
use kiln_common::{KilnError, Result};
use kiln_metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A point in time a render must finish by, plus the budget it was derived
/// from (for error messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn timeout_error(&self) -> KilnError {
        KilnError::Timeout(self.budget.as_millis() as u64)
    }
}

/// Bounds the number of live sandboxes.
///
/// Sandboxes are never reused: every acquisition builds a fresh one, loads
/// the prelude into it, and disposes it on release. The semaphore is the
/// only admission control; callers past the bound wait.
pub struct ExecutionPool {
    engine: Arc<dyn ScriptEngine>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    options: SandboxOptions,
    prelude: Arc<str>,
    metrics: Arc<MetricsRegistry>,
}

impl ExecutionPool {
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        capacity: usize,
        options: SandboxOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self::with_prelude(engine, capacity, options, metrics, PRELUDE)
    }

    pub fn with_prelude(
        engine: Arc<dyn ScriptEngine>,
        capacity: usize,
        options: SandboxOptions,
        metrics: Arc<MetricsRegistry>,
        prelude: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            options,
            prelude: prelude.into(),
            metrics,
        }
    }

    /// Waits for a free slot.
    ///
    /// Returns `Cancelled` if `cancel` fires and `Timeout` if `deadline`
    /// passes first. Nothing is created in either case.
    pub async fn acquire_slot(&self, cancel: &CancellationToken, deadline: Option<Deadline>) -> Result<PoolSlot> {
        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d.instant())).await,
                None => std::future::pending::<()>().await,
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KilnError::Cancelled),
            _ = expiry => {
                // deadline is Some here; `pending` never completes
                return Err(deadline.map(|d| d.timeout_error()).unwrap_or(KilnError::Cancelled));
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| KilnError::SandboxCreation("execution pool is closed".into()))?
            }
        };

        Ok(PoolSlot {
            permit,
            engine: Arc::clone(&self.engine),
            options: self.options,
            prelude: Arc::clone(&self.prelude),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Acquires a slot and opens a sandbox in it on the current thread.
    pub async fn acquire(&self, cancel: &CancellationToken, deadline: Option<Deadline>) -> Result<PooledSandbox> {
        self.acquire_slot(cancel, deadline).await?.into_sandbox()
    }

    /// Disposes the sandbox, then frees its slot.
    pub fn release(&self, sandbox: PooledSandbox) {
        drop(sandbox);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stops admitting new acquisitions. Waiters get `SandboxCreation`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A reserved slot with no sandbox yet. `Send`, so it can be moved onto the
/// thread that will own the sandbox.
pub struct PoolSlot {
    permit: OwnedSemaphorePermit,
    engine: Arc<dyn ScriptEngine>,
    options: SandboxOptions,
    prelude: Arc<str>,
    metrics: Arc<MetricsRegistry>,
}

impl PoolSlot {
    /// Builds a new sandbox and evaluates the prelude in it.
    ///
    /// On failure the half-built sandbox is disposed and the slot released
    /// before the error is returned.
    pub fn into_sandbox(self) -> Result<PooledSandbox> {
        let PoolSlot {
            permit,
            engine,
            options,
            prelude,
            metrics,
        } = self;

        let sandbox = engine.create(&options).map_err(|e| {
            KilnError::SandboxCreation(format!("create {} sandbox: {}", engine.name(), e))
        })?;
        metrics.record_sandbox_created();
        tracing::debug!("Created sandbox ({} live)", metrics.live_sandboxes());

        let mut pooled = PooledSandbox {
            sandbox: Some(sandbox),
            metrics,
            _permit: permit,
        };

        if let Err(e) = pooled.eval(&prelude) {
            return Err(KilnError::SandboxCreation(format!("prelude: {}", e)));
        }

        Ok(pooled)
    }
}

/// A live sandbox holding its pool slot. Dropping it disposes the sandbox
/// and then releases the slot.
pub struct PooledSandbox {
    sandbox: Option<Box<dyn Sandbox>>,
    metrics: Arc<MetricsRegistry>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSandbox {
    pub fn eval(&mut self, source: &str) -> std::result::Result<ScriptValue, ScriptError> {
        match self.sandbox.as_mut() {
            Some(sandbox) => sandbox.eval(source),
            None => Err(ScriptError::Runtime("sandbox already disposed".into())),
        }
    }

    pub fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>) {
        if let Some(sandbox) = self.sandbox.as_mut() {
            sandbox.set_interrupt_handler(handler);
        }
    }
}

impl Drop for PooledSandbox {
    fn drop(&mut self) {
        // the sandbox goes first; `_permit` is released after this body
        if let Some(sandbox) = self.sandbox.take() {
            drop(sandbox);
            self.metrics.record_sandbox_disposed();
            tracing::debug!("Disposed sandbox ({} live)", self.metrics.live_sandboxes());
        }
    }
}
