use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One of the three concurrent build stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Server,
    Client,
    Stylesheet,
}

impl BuildStage {
    pub const ALL: [BuildStage; 3] = [BuildStage::Server, BuildStage::Client, BuildStage::Stylesheet];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Server => "server",
            BuildStage::Client => "client",
            BuildStage::Stylesheet => "stylesheet",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The artifacts needed to serve one (component, mount point) pair.
///
/// Texts are reference counted so cache reads hand out cheap clones instead
/// of copying whole bundles on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub server_script: Arc<str>,
    pub client_script: Arc<str>,
    pub stylesheet: Arc<str>,
}

impl Artifacts {
    pub fn new(
        server_script: impl Into<Arc<str>>,
        client_script: impl Into<Arc<str>>,
        stylesheet: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            server_script: server_script.into(),
            client_script: client_script.into(),
            stylesheet: stylesheet.into(),
        }
    }
}
