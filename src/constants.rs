//! Constants and configuration values for the stack controller.
//!
//! This module centralizes the timing values, file names and shell settings
//! used by the probe, the process layer and the supervisor.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

// ============================================================================
// File System Constants
// ============================================================================

/// Default stack file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "aistack.yaml";

/// Directory under the state dir holding one pid file per service.
pub const PID_DIR_NAME: &str = "pids";

/// Extension used for per-service pid files.
pub const PID_FILE_EXTENSION: &str = "pid";

/// Extension used for per-service log files.
pub const LOG_FILE_EXTENSION: &str = "log";

/// Suffix of the temporary sibling written before a pid file is renamed into place.
pub const PID_TMP_SUFFIX: &str = ".tmp";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Probe Timing
// ============================================================================

/// Upper bound for a single TCP connect probe.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for a single HTTP readiness request.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default interval between readiness polls.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default readiness budget for a service that declares none.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Loopback addresses every probe dials. A service bound to either counts as listening.
pub const PROBE_HOSTS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
];

// ============================================================================
// Process Management Timing
// ============================================================================

/// Time a service is given to exit after SIGTERM before SIGKILL is sent.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Interval between liveness checks while waiting for a process to exit.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Allowed distance between a process start time and its pid file's mtime
/// before the recorded pid is treated as recycled.
pub const PID_START_SLACK: Duration = Duration::from_secs(5);

/// Time allowed for a process to disappear after SIGKILL.
pub const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Logging and Output Constants
// ============================================================================

/// Default number of log lines shown by `aistack logs`.
pub const DEFAULT_LOG_LINES: usize = 50;
