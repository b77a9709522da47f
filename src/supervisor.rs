//! Drives a set of service descriptors through start, stop and status.
//!
//! Starts are sequential in declared order: a later service's spawn is never
//! issued before an earlier service's spawn attempt, and each readiness wait
//! is a bounded poll on the calling thread. Later services are not held back
//! until earlier ones are ready beyond that wait. Stops run concurrently.
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    config::StackSettings,
    descriptor::ServiceDescriptor,
    probe::{PortProbe, Readiness},
    process::{self, ProcessHandle, StopOutcome},
};

/// What happened when one service was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum StartOutcome {
    /// The port was occupied (or a live recorded process exists); nothing was spawned.
    #[strum(serialize = "already running")]
    AlreadyRunning,
    /// Spawned and confirmed ready within its timeout.
    #[strum(serialize = "started")]
    Started(u32),
    /// Spawned, but readiness was not confirmed in time. The process keeps running.
    #[strum(serialize = "started (unconfirmed)")]
    StartedUnconfirmed(u32),
    /// The spawn failed or the process exited before becoming ready.
    #[strum(serialize = "failed")]
    Failed(String),
}

impl StartOutcome {
    /// `Started` and `AlreadyRunning` count as success.
    pub fn is_success(&self) -> bool {
        matches!(self, StartOutcome::Started(_) | StartOutcome::AlreadyRunning)
    }

    /// Spawned process id, when this run spawned one.
    pub fn pid(&self) -> Option<u32> {
        match self {
            StartOutcome::Started(pid) | StartOutcome::StartedUnconfirmed(pid) => Some(*pid),
            _ => None,
        }
    }
}

/// Point-in-time view of one service, queried live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Whether something accepts connections on the service port.
    pub port_open: bool,
    /// Pid recorded in the service's pid file.
    pub pid: Option<u32>,
    /// Whether the recorded pid is a live process.
    pub pid_alive: bool,
}

impl ServiceStatus {
    /// Short state label for reports.
    pub fn label(&self) -> &'static str {
        match (self.port_open, self.pid, self.pid_alive) {
            (true, _, _) => "running",
            (false, Some(_), true) => "starting",
            (false, Some(_), false) => "stale pid",
            (false, None, _) => "stopped",
        }
    }

    /// Whether the service answers on its port.
    pub fn is_success(&self) -> bool {
        self.port_open
    }
}

/// Outcome for one named service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResult<T> {
    /// Service name.
    pub name: String,
    /// Log file to consult for diagnosis.
    pub log_path: PathBuf,
    /// What happened.
    pub outcome: T,
}

/// Ordered per-service outcomes of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct Report<T> {
    /// One entry per targeted service, in declared order.
    pub services: Vec<ServiceResult<T>>,
}

impl<T> Report<T> {
    /// Outcome recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.services
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.outcome)
    }

    /// Entries in declared order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceResult<T>> {
        self.services.iter()
    }

    /// Number of services in the report.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the report is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Per-service start outcomes.
pub type StartReport = Report<StartOutcome>;
/// Per-service stop outcomes.
pub type StopReport = Report<StopOutcome>;
/// Per-service live status.
pub type StatusReport = Report<ServiceStatus>;

impl StartReport {
    /// True when every service reported `Started` or `AlreadyRunning`.
    pub fn is_success(&self) -> bool {
        self.services.iter().all(|entry| entry.outcome.is_success())
    }
}

impl StopReport {
    /// True when no stop failed.
    pub fn is_success(&self) -> bool {
        self.services.iter().all(|entry| entry.outcome.is_success())
    }
}

impl StatusReport {
    /// True when every service answers on its port.
    pub fn is_success(&self) -> bool {
        self.services.iter().all(|entry| entry.outcome.is_success())
    }
}

/// Starts, stops and inspects services described by descriptors.
#[derive(Debug, Clone)]
pub struct Supervisor {
    probe: PortProbe,
    start_timeout: Option<Duration>,
    stop_grace: Duration,
    cancel: Arc<AtomicBool>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(StackSettings::default())
    }
}

impl Supervisor {
    /// Creates a supervisor using the stack-wide timings.
    pub fn new(settings: StackSettings) -> Self {
        Self {
            probe: PortProbe::new().with_poll_interval(settings.poll_interval),
            start_timeout: settings.start_timeout,
            stop_grace: settings.stop_grace,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares `flag` as the cancellation signal for readiness waits.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Flag that, once set, aborts the current readiness wait and any further spawns.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The probe used for port and readiness checks.
    pub fn probe(&self) -> &PortProbe {
        &self.probe
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Starts every descriptor in order. One failure never prevents the rest
    /// from being attempted.
    pub fn start_all<'a, I>(&self, descriptors: I) -> StartReport
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        let overall_deadline = self.start_timeout.map(|budget| Instant::now() + budget);

        let services = descriptors
            .into_iter()
            .map(|descriptor| ServiceResult {
                name: descriptor.name.clone(),
                log_path: descriptor.log_path.clone(),
                outcome: self.start_one(descriptor, overall_deadline),
            })
            .collect();

        Report { services }
    }

    /// Starts one service unless it is already running.
    ///
    /// `overall_deadline` caps the readiness wait; when it passes, the spawned
    /// process is left running and reported as unconfirmed.
    pub fn start_one(
        &self,
        descriptor: &ServiceDescriptor,
        overall_deadline: Option<Instant>,
    ) -> StartOutcome {
        let name = descriptor.name.as_str();

        if self.probe.is_port_in_use(descriptor.port) {
            info!("'{name}' already listening on port {}; not spawning", descriptor.port);
            return StartOutcome::AlreadyRunning;
        }

        match process::read_pid_file(&descriptor.pid_path) {
            Ok(Some(pid)) if process::recorded_pid_is_alive(pid, &descriptor.pid_path) => {
                info!(
                    "'{name}' has a live recorded process (pid {pid}) that is not listening yet; not spawning"
                );
                return StartOutcome::AlreadyRunning;
            }
            Ok(Some(pid)) => {
                debug!("Removing stale pid file for '{name}' (pid {pid} is gone or recycled)");
                let _ = process::remove_pid_file(&descriptor.pid_path);
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Ignoring unreadable pid file for '{name}': {err}");
                let _ = process::remove_pid_file(&descriptor.pid_path);
            }
        }

        if self.cancelled() {
            warn!("Start of '{name}' skipped: operation cancelled");
            return StartOutcome::Failed("start cancelled before spawn".into());
        }

        info!("Starting service: {name}");
        let mut handle = match ProcessHandle::spawn(descriptor) {
            Ok(handle) => handle,
            Err(err) => {
                error!("{err}");
                return StartOutcome::Failed(err.to_string());
            }
        };
        let pid = handle.pid();

        let mut deadline = Instant::now() + descriptor.ready_timeout;
        if let Some(overall) = overall_deadline {
            deadline = deadline.min(overall);
        }

        let mut exited = false;
        let readiness = self.probe.wait_ready_until(
            descriptor.port,
            descriptor.readiness_path.as_deref(),
            deadline,
            || {
                if self.cancelled() {
                    return true;
                }
                if !handle.is_alive() {
                    exited = true;
                    return true;
                }
                false
            },
        );

        match readiness {
            Readiness::Ready => {
                info!("'{name}' is ready on port {} (pid {pid})", descriptor.port);
                handle.detach();
                StartOutcome::Started(pid)
            }
            Readiness::Aborted if exited => {
                let status = handle.exit_status();
                if let Err(err) = process::remove_pid_file(&descriptor.pid_path) {
                    warn!("Failed to remove pid file for '{name}': {err}");
                }

                // A clean exit may be a launcher handing off to the real server.
                if status.is_some_and(|status| status.success())
                    && self.probe.wait_ready_until(
                        descriptor.port,
                        descriptor.readiness_path.as_deref(),
                        deadline,
                        || self.cancelled(),
                    ) == Readiness::Ready
                {
                    warn!(
                        "'{name}' launcher (pid {pid}) exited and the service came up on port {}; only a stop pattern can stop it",
                        descriptor.port
                    );
                    return StartOutcome::Started(pid);
                }

                let status = status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "unknown status".to_string());
                error!("'{name}' exited before becoming ready ({status})");
                StartOutcome::Failed(format!("exited before becoming ready ({status})"))
            }
            Readiness::Aborted => {
                warn!("Readiness wait for '{name}' cancelled; leaving pid {pid} running");
                handle.detach();
                StartOutcome::StartedUnconfirmed(pid)
            }
            Readiness::TimedOut => {
                warn!(
                    "'{name}' (pid {pid}) not ready on port {} before its deadline; it may still come up",
                    descriptor.port
                );
                handle.detach();
                StartOutcome::StartedUnconfirmed(pid)
            }
        }
    }

    /// Stops every descriptor concurrently.
    pub fn stop_all<'a, I>(&self, descriptors: I) -> StopReport
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        let descriptors: Vec<&ServiceDescriptor> = descriptors.into_iter().collect();

        let services: Vec<ServiceResult<StopOutcome>> = thread::scope(|scope| {
            let workers: Vec<_> = descriptors
                .iter()
                .map(|descriptor| {
                    let descriptor = *descriptor;
                    scope.spawn(move || self.stop_one(descriptor))
                })
                .collect();

            descriptors
                .iter()
                .zip(workers)
                .map(|(descriptor, worker)| ServiceResult {
                    name: descriptor.name.clone(),
                    log_path: descriptor.log_path.clone(),
                    outcome: worker.join().unwrap_or_else(|_| {
                        StopOutcome::Failed("stop worker panicked".into())
                    }),
                })
                .collect()
        });

        Report { services }
    }

    /// Stops one service: pid file first, command-line pattern second.
    pub fn stop_one(&self, descriptor: &ServiceDescriptor) -> StopOutcome {
        let name = descriptor.name.as_str();
        let recorded = process::stop_recorded(
            name,
            &descriptor.pid_path,
            &descriptor.log_path,
            self.stop_grace,
        );

        match (recorded, &descriptor.stop_pattern) {
            (StopOutcome::AlreadyStopped, Some(pattern)) => {
                debug!("No live pid recorded for '{name}'; trying stop pattern '{pattern}'");
                process::terminate_matching(name, pattern, self.stop_grace)
            }
            (outcome, _) => outcome,
        }
    }

    /// Queries the live status of every descriptor.
    pub fn status_all<'a, I>(&self, descriptors: I) -> StatusReport
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        let services = descriptors
            .into_iter()
            .map(|descriptor| ServiceResult {
                name: descriptor.name.clone(),
                log_path: descriptor.log_path.clone(),
                outcome: self.status_one(descriptor),
            })
            .collect();

        Report { services }
    }

    /// Queries the live status of one service. Never modifies files.
    pub fn status_one(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        let pid = match process::read_pid_file(&descriptor.pid_path) {
            Ok(pid) => pid,
            Err(err) => {
                debug!("Unreadable pid file for '{}': {err}", descriptor.name);
                None
            }
        };

        ServiceStatus {
            port_open: self.probe.is_port_in_use(descriptor.port),
            pid,
            pid_alive: pid
                .is_some_and(|pid| process::recorded_pid_is_alive(pid, &descriptor.pid_path)),
        }
    }
}
