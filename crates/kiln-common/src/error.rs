use crate::artifact::BuildStage;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A compile diagnostic reported by a bundler or style compiler.
///
/// Carries enough source context (file and position, when the tool reports
/// them) to surface directly to a developer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(column)) => {
                write!(f, "{}:{}:{}: {}", file.display(), line, column, self.message)
            }
            (Some(file), _, _) => write!(f, "{}: {}", file.display(), self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("{stage} build failed: {source}")]
    Build {
        stage: BuildStage,
        #[source]
        source: Box<KilnError>,
    },

    #[error("Compile error: {0}")]
    Compile(CompileError),

    #[error("Sandbox creation failed: {0}")]
    SandboxCreation(String),

    #[error("Script execution error: {0}")]
    Execution(String),

    #[error("Render timed out after {0}ms")]
    Timeout(u64),

    #[error("Render cancelled")]
    Cancelled,

    #[error("Component {component} (mount point {mount_point}) not registered; build and register its artifacts before serving")]
    NotRegistered {
        component: String,
        mount_point: String,
    },

    #[error("Style watcher error: {0}")]
    Watcher(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl KilnError {
    /// Wraps an error with the build stage it came from.
    pub fn in_stage(self, stage: BuildStage) -> Self {
        KilnError::Build {
            stage,
            source: Box::new(self),
        }
    }

    /// Per-call execution failures: a throwing script, a non-string render
    /// result, an expired deadline, or a cancelled call.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            KilnError::Execution(_) | KilnError::Timeout(_) | KilnError::Cancelled
        )
    }

    /// Returns the stage that failed if this is a build error.
    pub fn build_stage(&self) -> Option<BuildStage> {
        match self {
            KilnError::Build { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<CompileError> for KilnError {
    fn from(err: CompileError) -> Self {
        KilnError::Compile(err)
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
