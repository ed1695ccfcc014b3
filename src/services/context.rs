use super::log_sink::{ConsoleSink, LogSink};
use crate::ssh::fs::Workspace;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where the job runs. Only used for diagnostics and log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    Local,
    Agent(String),
}

impl Launcher {
    pub fn label(&self) -> String {
        match self {
            Launcher::Local => "local".to_string(),
            Launcher::Agent(name) => format!("agent {}", name),
        }
    }
}

/// Everything a step reads from the job it runs in.
#[derive(Clone)]
pub struct StepContext {
    pub run: String,
    pub log: Arc<dyn LogSink>,
    pub env: BTreeMap<String, String>,
    pub launcher: Launcher,
    /// Job workspace searched for script references. Falls back to SFTP when absent.
    pub workspace: Option<Arc<dyn Workspace>>,
    pub local_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(run: impl Into<String>, log: Arc<dyn LogSink>) -> Self {
        Self {
            run: run.into(),
            log,
            env: BTreeMap::new(),
            launcher: Launcher::Local,
            workspace: None,
            local_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cancel: CancellationToken::new(),
        }
    }

    pub fn console(run: impl Into<String>) -> Self {
        Self::new(run, Arc::new(ConsoleSink))
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = dir.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
