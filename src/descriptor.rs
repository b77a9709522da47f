//! Static declarations of the services a stack manages.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;

/// How a service is launched: a shell line, the directory it runs in and the
/// environment forwarded to it.
#[derive(Debug, Clone)]
pub struct ServiceCommand {
    /// Program and arguments, executed through `sh -c`.
    pub line: String,
    /// Working directory for the process.
    pub working_dir: PathBuf,
    /// Variables added to the inherited environment. Values are passed through untouched.
    pub env: HashMap<String, String>,
}

impl ServiceCommand {
    /// Builds a command that runs in `working_dir` with no extra environment.
    pub fn new(line: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            line: line.into(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
        }
    }
}

/// Declaration of one managed service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Unique service name.
    pub name: String,
    /// Launch command.
    pub command: ServiceCommand,
    /// Port the service listens on. Used for the "already running" check and readiness.
    pub port: u16,
    /// HTTP path that must answer before the service counts as ready.
    pub readiness_path: Option<String>,
    /// How long to wait for readiness after spawning.
    pub ready_timeout: Duration,
    /// Captured stdout and stderr.
    pub log_path: PathBuf,
    /// File holding the pid of the spawned process.
    pub pid_path: PathBuf,
    /// Command-line pattern for services launched by another tool that never get a pid file.
    pub stop_pattern: Option<Regex>,
}

impl ServiceDescriptor {
    /// Creates a descriptor with default file locations under `log_dir` and `pid_dir`.
    pub fn new(
        name: impl Into<String>,
        command: ServiceCommand,
        port: u16,
        log_dir: &Path,
        pid_dir: &Path,
    ) -> Self {
        let name = name.into();
        Self {
            log_path: default_log_path(log_dir, &name),
            pid_path: default_pid_path(pid_dir, &name),
            name,
            command,
            port,
            readiness_path: None,
            ready_timeout: crate::constants::DEFAULT_READY_TIMEOUT,
            stop_pattern: None,
        }
    }

    /// Requires an HTTP response on `path` for readiness.
    pub fn with_readiness_path(mut self, path: impl Into<String>) -> Self {
        self.readiness_path = Some(normalize_path(path.into()));
        self
    }

    /// Overrides the readiness budget.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the fallback stop pattern.
    pub fn with_stop_pattern(mut self, pattern: Regex) -> Self {
        self.stop_pattern = Some(pattern);
        self
    }
}

/// `<log_dir>/<name>.log`
pub fn default_log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{name}.{}", crate::constants::LOG_FILE_EXTENSION))
}

/// `<pid_dir>/<name>.pid`
pub fn default_pid_path(pid_dir: &Path, name: &str) -> PathBuf {
    pid_dir.join(format!("{name}.{}", crate::constants::PID_FILE_EXTENSION))
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}
