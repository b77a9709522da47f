//! Helpers for tests that touch process-wide state.
use std::{
    env,
    ffi::OsString,
    path::Path,
    sync::{Mutex, MutexGuard, OnceLock},
};

use crate::runtime::{self, RuntimeMode};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that change environment variables or the runtime mode.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Points `HOME` at a scratch directory for the guard's lifetime and restores
/// both `HOME` and the user runtime mode on drop.
pub struct HomeGuard {
    previous: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl HomeGuard {
    pub fn set(home: &Path) -> Self {
        let lock = env_lock();
        let previous = env::var_os("HOME");
        unsafe {
            env::set_var("HOME", home);
        }
        runtime::init(RuntimeMode::User);

        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { env::set_var("HOME", value) },
            None => unsafe { env::remove_var("HOME") },
        }
        runtime::init(RuntimeMode::User);
    }
}
