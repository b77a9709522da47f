//! aistack starts, health-checks and stops a stack of independently developed
//! AI services on a single host. Each service is an opaque process declared
//! in a YAML stack file with a port and an optional HTTP readiness path;
//! aistack spawns them in order, never twice, waits for them to become ready,
//! records their pids so a later invocation can stop them, and reports the
//! health of the whole stack.

/// CLI interface.
pub mod cli;

/// Stack file loading.
pub mod config;

/// Timing values and fixed names.
pub mod constants;

/// Service declarations.
pub mod descriptor;

/// Error handling.
pub mod error;

/// Logs management.
pub mod logs;

/// TCP and HTTP probes.
pub mod probe;

/// Spawned process handles and pid files.
pub mod process;

/// Runtime directories.
pub mod runtime;

/// Top-level stack controller and report rendering.
pub mod stack;

/// Start, stop and status orchestration.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
