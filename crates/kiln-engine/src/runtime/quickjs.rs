use crate::runtime::{InterruptHandler, Sandbox, SandboxOptions, ScriptEngine, ScriptError, ScriptValue};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Runtime, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Upper bound on queued jobs (promise reactions, prelude timers) drained
/// after one evaluation.
const MAX_PENDING_JOBS: usize = 100_000;

/// QuickJS backend. Every sandbox gets its own runtime and context, so
/// nothing (module state, globals, atoms) is shared between sandboxes.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuickJsEngine;

impl QuickJsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for QuickJsEngine {
    fn create(&self, options: &SandboxOptions) -> Result<Box<dyn Sandbox>, ScriptError> {
        Ok(Box::new(QuickJsSandbox::new(options)?))
    }

    fn name(&self) -> &'static str {
        "quickjs"
    }
}

/// A QuickJS runtime plus one full context.
///
/// Neither half is `Send`; a sandbox lives and dies on the thread that
/// created it.
pub struct QuickJsSandbox {
    context: Context,
    runtime: Runtime,
    /// Set when the installed handler requested an interrupt, so an aborted
    /// evaluation can be told apart from a script that threw.
    interrupted: Arc<AtomicBool>,
}

impl QuickJsSandbox {
    pub fn new(options: &SandboxOptions) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::Runtime(e.to_string()))?;
        runtime.set_max_stack_size(options.stack_size);
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }

        let context = Context::full(&runtime).map_err(|e| ScriptError::Runtime(e.to_string()))?;
        context
            .with(|ctx| install_console(&ctx))
            .map_err(|e| ScriptError::Runtime(format!("install console: {}", e)))?;

        Ok(Self {
            context,
            runtime,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    fn drain_jobs(&self) -> Result<(), String> {
        for _ in 0..MAX_PENDING_JOBS {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(_) => return Err("uncaught exception in queued job".to_string()),
            }
        }
        tracing::debug!("Stopped draining queued jobs after {}", MAX_PENDING_JOBS);
        Ok(())
    }
}

impl Sandbox for QuickJsSandbox {
    fn eval(&mut self, source: &str) -> Result<ScriptValue, ScriptError> {
        self.interrupted.store(false, Ordering::Relaxed);

        let outcome = self
            .context
            .with(|ctx| {
                let value = ctx
                    .clone()
                    .eval::<Value, _>(source.as_bytes().to_vec())
                    .catch(&ctx)
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>(convert(&value))
            })
            .and_then(|value| self.drain_jobs().map(|_| value));

        outcome.map_err(|message| {
            if self.interrupted.load(Ordering::Relaxed) {
                ScriptError::Interrupted
            } else {
                ScriptError::Thrown(message)
            }
        })
    }

    fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>) {
        match handler {
            Some(mut handler) => {
                let fired = Arc::clone(&self.interrupted);
                self.runtime.set_interrupt_handler(Some(Box::new(move || {
                    let stop = handler();
                    if stop {
                        fired.store(true, Ordering::Relaxed);
                    }
                    stop
                })));
            }
            None => self.runtime.set_interrupt_handler(None),
        }
    }
}

/// Routes the prelude's `console` through tracing.
fn install_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let sink = Function::new(ctx.clone(), |level: String, message: String| match level.as_str() {
        "error" | "warn" => tracing::warn!(target: "kiln::script", "{}", message),
        "debug" => tracing::debug!(target: "kiln::script", "{}", message),
        _ => tracing::info!(target: "kiln::script", "{}", message),
    })?;
    ctx.globals().set("__kilnConsole", sink)?;
    Ok(())
}

fn convert(value: &Value<'_>) -> ScriptValue {
    if value.is_undefined() {
        ScriptValue::Undefined
    } else if value.is_null() {
        ScriptValue::Null
    } else if let Some(b) = value.as_bool() {
        ScriptValue::Bool(b)
    } else if let Some(n) = value.as_number() {
        ScriptValue::Number(n)
    } else if let Some(s) = value.as_string() {
        match s.to_string() {
            Ok(s) => ScriptValue::String(s),
            Err(_) => ScriptValue::Other("string".to_string()),
        }
    } else {
        ScriptValue::Other(format!("{:?}", value.type_of()).to_lowercase())
    }
}
