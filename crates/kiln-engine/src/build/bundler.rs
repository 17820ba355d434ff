//! Bundler collaborator and its esbuild CLI adapter.

use async_trait::async_trait;
use kiln_common::{resolve_against, CompileError, KilnError, Result};
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Global name the server bundle is wrapped in.
pub const SERVER_GLOBAL_NAME: &str = "__Component";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleTarget {
    /// IIFE bundle evaluated in a sandbox.
    Server,
    /// ES module shipped to the browser, hydrating into `mount_point`.
    Client { mount_point: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    /// Generated entry file to bundle.
    pub entry_point: PathBuf,
    /// The component the entry wraps.
    pub component: PathBuf,
    pub target: BundleTarget,
    pub minify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOutput {
    pub text: String,
    /// Absolute paths of every file the bundle read, entry included.
    pub inputs: Vec<PathBuf>,
}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn build(&self, request: &BundleRequest) -> Result<BundleOutput>;

    fn name(&self) -> &'static str {
        "bundler"
    }
}

/// Runs the esbuild binary: `node_modules/.bin/esbuild` under the project
/// root when present, else `esbuild` from `PATH`.
#[derive(Debug, Clone)]
pub struct EsbuildCli {
    project_root: PathBuf,
    binary: PathBuf,
}

impl EsbuildCli {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let local = project_root.join("node_modules").join(".bin").join("esbuild");
        let binary = if local.is_file() {
            local
        } else {
            PathBuf::from("esbuild")
        };
        Self { project_root, binary }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(&self, request: &BundleRequest, outfile: &Path, metafile: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            request.entry_point.clone().into(),
            "--bundle".into(),
            "--platform=browser".into(),
            "--jsx=automatic".into(),
            "--jsx-import-source=react".into(),
            "--target=es2020".into(),
            "--main-fields=browser,module,main".into(),
            "--log-level=error".into(),
            "--color=false".into(),
        ];

        let mut out = OsString::from("--outfile=");
        out.push(outfile);
        args.push(out);
        let mut meta = OsString::from("--metafile=");
        meta.push(metafile);
        args.push(meta);

        match &request.target {
            BundleTarget::Server => {
                args.push("--format=iife".into());
                args.push(format!("--global-name={}", SERVER_GLOBAL_NAME).into());
            }
            BundleTarget::Client { .. } => args.push("--format=esm".into()),
        }

        if request.minify {
            args.push("--minify-whitespace".into());
            args.push("--minify-syntax".into());
            args.push("--define:process.env.NODE_ENV=\"production\"".into());
        } else {
            args.push("--define:process.env.NODE_ENV=\"development\"".into());
        }

        args
    }
}

#[async_trait]
impl Bundler for EsbuildCli {
    async fn build(&self, request: &BundleRequest) -> Result<BundleOutput> {
        let out_dir = tempfile::Builder::new().prefix("kiln-bundle-").tempdir()?;
        let outfile = out_dir.path().join("bundle.js");
        let metafile = out_dir.path().join("meta.json");

        debug!("Running {} for {}", self.binary.display(), request.entry_point.display());

        let output = Command::new(&self.binary)
            .args(self.args(request, &outfile, &metafile))
            .current_dir(&self.project_root)
            .env("NODE_PATH", self.project_root.join("node_modules"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KilnError::Config(format!("run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = parse_diagnostics(&stderr, &self.project_root)
                .into_iter()
                .next()
                .unwrap_or_else(|| {
                    let detail = stderr.trim();
                    let message = if detail.is_empty() {
                        format!("esbuild exited with {}", output.status)
                    } else {
                        detail.to_string()
                    };
                    CompileError::new(message).with_file(&request.component)
                });
            return Err(KilnError::Compile(error));
        }

        let text = tokio::fs::read_to_string(&outfile).await?;
        let meta = tokio::fs::read_to_string(&metafile).await?;
        let inputs = parse_metafile_inputs(&meta, &self.project_root)?;

        Ok(BundleOutput { text, inputs })
    }

    fn name(&self) -> &'static str {
        "esbuild"
    }
}

#[derive(Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, IgnoredAny>,
}

/// Absolute paths of a metafile's `inputs`. Paths are relative to the
/// directory esbuild ran in; virtual inputs are skipped.
pub fn parse_metafile_inputs(json: &str, cwd: &Path) -> Result<Vec<PathBuf>> {
    let meta: Metafile = serde_json::from_str(json)?;
    Ok(meta
        .inputs
        .keys()
        .filter(|path| !path.starts_with('<') && !path.contains("(disabled)"))
        .map(|path| resolve_against(cwd, path))
        .collect())
}

/// Parses esbuild's human-readable error log.
///
/// ```text
/// ✘ [ERROR] Could not resolve "./missing"
///
///     app/pages/home.tsx:3:19:
///       3 │ import Missing from "./missing";
/// ```
pub fn parse_diagnostics(stderr: &str, cwd: &Path) -> Vec<CompileError> {
    const MARKER: &str = "[ERROR]";

    let mut errors = Vec::new();
    let mut lines = stderr.lines().peekable();
    while let Some(line) = lines.next() {
        let Some(idx) = line.find(MARKER) else {
            continue;
        };
        let mut error = CompileError::new(line[idx + MARKER.len()..].trim());

        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                lines.next();
                continue;
            }
            if let Some((file, line_no, column)) = parse_location(next.trim()) {
                error = error
                    .with_file(resolve_against(cwd, file))
                    .with_position(line_no, column);
                lines.next();
            }
            break;
        }

        errors.push(error);
    }
    errors
}

/// `path:line:column:`
fn parse_location(text: &str) -> Option<(&str, u32, u32)> {
    let text = text.strip_suffix(':')?;
    let (rest, column) = text.rsplit_once(':')?;
    let (file, line) = rest.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    Some((file, line.parse().ok()?, column.parse().ok()?))
}
