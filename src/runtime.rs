//! Runtime paths for pid and log files.
#[cfg(test)]
use std::path::Path;
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

use crate::constants::PID_DIR_NAME;

/// Where to store pid files and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/aistack).
    User,
    /// System dirs (/var/lib/aistack).
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    log_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/aistack");
        let log_dir = state_dir.join("logs");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            log_dir,
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/aistack"),
            log_dir: PathBuf::from("/var/log/aistack"),
        }
    }
}

/// Sets runtime mode. Can be called multiple times.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

fn read_context() -> RuntimeContext {
    context_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Returns the current runtime mode (User or System).
pub fn mode() -> RuntimeMode {
    read_context().mode
}

/// State dir (pid files).
pub fn state_dir() -> PathBuf {
    read_context().state_dir
}

/// Default directory for per-service pid files.
pub fn pid_dir() -> PathBuf {
    state_dir().join(PID_DIR_NAME)
}

/// Default log directory.
pub fn log_dir() -> PathBuf {
    read_context().log_dir
}
