//! Script execution.
//!
//! The engine talks to a script runtime through two small traits:
//! [`ScriptEngine`] creates sandboxes and [`Sandbox`] evaluates code in one.
//! A sandbox is single-use and owned by exactly one call; it is disposed when
//! dropped. [`pool::ExecutionPool`] bounds how many exist at once.

pub mod pool;
pub mod quickjs;


pub use pool::{Deadline, ExecutionPool, PoolSlot, PooledSandbox};
pub use quickjs::QuickJsEngine;

use std::fmt;

/// Polled by the runtime while a script runs; returning `true` aborts the
/// evaluation.
pub type InterruptHandler = Box<dyn FnMut() -> bool + Send + 'static>;

/// JavaScript polyfills evaluated in every fresh sandbox before any bundle.
pub const PRELUDE: &str = include_str!("prelude.js");

/// Limits applied to each new sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxOptions {
    pub stack_size: usize,
    pub memory_limit: Option<usize>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            stack_size: 4 * 1024 * 1024,
            memory_limit: None,
        }
    }
}

/// The result of an evaluation, reduced to what callers inspect.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Anything else, described by its type name.
    Other(String),
}

impl ScriptValue {
    pub fn type_name(&self) -> &str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Other(name) => name,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script threw; carries the exception's message and stack if any.
    Thrown(String),
    /// The interrupt handler asked the runtime to stop.
    Interrupted,
    /// The runtime itself failed (allocation, stack overflow during setup).
    Runtime(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Thrown(message) => f.write_str(message),
            ScriptError::Interrupted => f.write_str("execution interrupted"),
            ScriptError::Runtime(message) => write!(f, "runtime error: {}", message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// One isolated execution context.
pub trait Sandbox {
    fn eval(&mut self, source: &str) -> Result<ScriptValue, ScriptError>;

    /// Installs or clears (`None`) the interrupt handler.
    fn set_interrupt_handler(&mut self, handler: Option<InterruptHandler>);
}

/// Factory for sandboxes. Shared across threads; sandboxes are not.
pub trait ScriptEngine: Send + Sync + 'static {
    fn create(&self, options: &SandboxOptions) -> Result<Box<dyn Sandbox>, ScriptError>;

    fn name(&self) -> &'static str {
        "script"
    }
}
