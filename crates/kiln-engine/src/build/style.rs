//! Style compiler collaborator and its Tailwind CLI adapter.

use crate::logging;
use async_trait::async_trait;
use kiln_common::{CompileError, KilnError, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Handle to a running watch-mode subprocess.
#[async_trait]
pub trait WatchProcess: Send {
    /// Waits for the process to exit and describes how it exited.
    async fn wait(&mut self) -> io::Result<String>;

    async fn kill(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u32> {
        None
    }
}

#[async_trait]
pub trait StyleCompiler: Send + Sync {
    /// Compiles `input` once into `output` and returns the CSS.
    async fn compile(&self, input: &Path, output: &Path) -> Result<String>;

    /// Starts a compiler that keeps rewriting `output` as sources change.
    async fn start_watch(
        &self,
        input: &Path,
        output: &Path,
        content_globs: &[String],
    ) -> Result<Box<dyn WatchProcess>>;
}

/// Package runner used to invoke the Tailwind CLI, picked from the lockfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner {
    Pnpx,
    Yarn,
    Bunx,
    Npx,
}

impl Runner {
    pub fn detect(project_root: &Path) -> Self {
        if project_root.join("pnpm-lock.yaml").exists() {
            Runner::Pnpx
        } else if project_root.join("yarn.lock").exists() {
            Runner::Yarn
        } else if project_root.join("bun.lockb").exists() {
            Runner::Bunx
        } else {
            Runner::Npx
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Runner::Pnpx => "pnpx",
            Runner::Yarn => "yarn",
            Runner::Bunx => "bunx",
            Runner::Npx => "npx",
        }
    }
}

const TAILWIND_PACKAGE: &str = "@tailwindcss/cli";

#[derive(Debug, Clone)]
pub struct TailwindCli {
    project_root: PathBuf,
    runner: Runner,
}

impl TailwindCli {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let runner = Runner::detect(&project_root);
        Self { project_root, runner }
    }

    pub fn runner(&self) -> Runner {
        self.runner
    }

    fn compile_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            TAILWIND_PACKAGE.to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
            "--minify".to_string(),
        ]
    }

    fn watch_args(input: &Path, output: &Path, content_globs: &[String]) -> Vec<String> {
        let mut args = vec![
            TAILWIND_PACKAGE.to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
            "--watch=always".to_string(),
        ];
        if !content_globs.is_empty() {
            args.push("--content".to_string());
            args.push(content_globs.join(","));
        }
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(self.runner.program());
        cmd.args(args).current_dir(&self.project_root).stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl StyleCompiler for TailwindCli {
    async fn compile(&self, input: &Path, output: &Path) -> Result<String> {
        debug!("Compiling stylesheet {}", input.display());

        let result = self
            .command(&Self::compile_args(input, output))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KilnError::Config(format!("run {}: {}", self.runner.program(), e)))?;

        if !result.status.success() {
            let mut detail = String::from_utf8_lossy(&result.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&result.stdout).trim().to_string();
            }
            return Err(CompileError::new(format!("tailwind exited with {}: {}", result.status, detail))
                .with_file(input)
                .into());
        }

        Ok(tokio::fs::read_to_string(output).await?)
    }

    async fn start_watch(
        &self,
        input: &Path,
        output: &Path,
        content_globs: &[String],
    ) -> Result<Box<dyn WatchProcess>> {
        let (stdout, stderr) = if logging::debug_enabled() {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let child = self
            .command(&Self::watch_args(input, output, content_globs))
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KilnError::Watcher(format!("start {}: {}", self.runner.program(), e)))?;

        Ok(Box::new(ChildProcess { child }))
    }
}

/// A real subprocess.
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WatchProcess for ChildProcess {
    async fn wait(&mut self) -> io::Result<String> {
        self.child.wait().await.map(|status| status.to_string())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
