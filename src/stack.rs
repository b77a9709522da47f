//! Entry point owning the ordered service registry and rendering reports.
use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
};

use serde::Serialize;

use crate::{
    config::StackConfig,
    descriptor::ServiceDescriptor,
    error::StackError,
    process::StopOutcome,
    supervisor::{
        Report, ServiceStatus, StartOutcome, StartReport, StatusReport, StopReport,
        Supervisor,
    },
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Owns the declared services and runs whole-stack operations.
#[derive(Debug)]
pub struct StackController {
    descriptors: Vec<ServiceDescriptor>,
    supervisor: Supervisor,
}

impl StackController {
    /// Builds a controller over `descriptors` in their declared order.
    ///
    /// Rejects duplicate names and duplicate ports.
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        supervisor: Supervisor,
    ) -> Result<Self, StackError> {
        let mut names = HashSet::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();
        for descriptor in &descriptors {
            if !names.insert(descriptor.name.as_str()) {
                return Err(StackError::DuplicateService(descriptor.name.clone()));
            }
            if let Some(first) = ports.insert(descriptor.port, descriptor.name.as_str()) {
                return Err(StackError::DuplicatePort {
                    port: descriptor.port,
                    first: first.to_string(),
                    second: descriptor.name.clone(),
                });
            }
        }

        Ok(Self {
            descriptors,
            supervisor,
        })
    }

    /// Builds a controller from a loaded stack file.
    pub fn from_config(config: &StackConfig) -> Result<Self, StackError> {
        let supervisor = Supervisor::new(config.settings()?);
        Self::new(config.descriptors()?, supervisor)
    }

    /// Replaces the supervisor, e.g. to share a cancellation flag.
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// All declared services, in order.
    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    /// The supervisor running operations.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Resolves `names` to descriptors in declared order. Empty means every service.
    ///
    /// Unknown names fail the whole selection before anything runs.
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<&ServiceDescriptor>, StackError> {
        if names.is_empty() {
            return Ok(self.descriptors.iter().collect());
        }

        let wanted: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
        if let Some(unknown) = wanted
            .iter()
            .find(|name| !self.descriptors.iter().any(|d| d.name == **name))
        {
            return Err(StackError::UnknownService(unknown.to_string()));
        }

        Ok(self
            .descriptors
            .iter()
            .filter(|descriptor| wanted.contains(descriptor.name.as_str()))
            .collect())
    }

    /// Starts the selected services in declared order.
    pub fn start<S: AsRef<str>>(&self, names: &[S]) -> Result<StartReport, StackError> {
        let selected = self.select(names)?;
        Ok(self.supervisor.start_all(selected))
    }

    /// Stops the selected services.
    pub fn stop<S: AsRef<str>>(&self, names: &[S]) -> Result<StopReport, StackError> {
        let selected = self.select(names)?;
        Ok(self.supervisor.stop_all(selected))
    }

    /// Reports the live status of the selected services.
    pub fn status<S: AsRef<str>>(&self, names: &[S]) -> Result<StatusReport, StackError> {
        let selected = self.select(names)?;
        Ok(self.supervisor.status_all(selected))
    }
}

/// How a report line should read at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Good,
    Degraded,
    Bad,
}

/// A per-service outcome that can be rendered as one report line.
pub trait ReportLine {
    /// State label, e.g. "started (unconfirmed)".
    fn label(&self) -> String;
    /// Extra detail shown after the label.
    fn detail(&self) -> Option<String>;
    /// Colour class of the line.
    fn tone(&self) -> Tone;
}

impl ReportLine for StartOutcome {
    fn label(&self) -> String {
        self.as_ref().to_string()
    }

    fn detail(&self) -> Option<String> {
        match self {
            StartOutcome::Started(pid) | StartOutcome::StartedUnconfirmed(pid) => {
                Some(format!("pid {pid}"))
            }
            StartOutcome::Failed(reason) => Some(reason.clone()),
            StartOutcome::AlreadyRunning => None,
        }
    }

    fn tone(&self) -> Tone {
        match self {
            StartOutcome::Started(_) | StartOutcome::AlreadyRunning => Tone::Good,
            StartOutcome::StartedUnconfirmed(_) => Tone::Degraded,
            StartOutcome::Failed(_) => Tone::Bad,
        }
    }
}

impl ReportLine for StopOutcome {
    fn label(&self) -> String {
        self.as_ref().to_string()
    }

    fn detail(&self) -> Option<String> {
        match self {
            StopOutcome::Stopped(pid) => Some(format!("pid {pid}")),
            StopOutcome::StoppedByPattern(count) => Some(format!("{count} process(es)")),
            StopOutcome::Failed(reason) => Some(reason.clone()),
            StopOutcome::AlreadyStopped => None,
        }
    }

    fn tone(&self) -> Tone {
        match self {
            StopOutcome::Failed(_) => Tone::Bad,
            _ => Tone::Good,
        }
    }
}

impl ReportLine for ServiceStatus {
    fn label(&self) -> String {
        ServiceStatus::label(self).to_string()
    }

    fn detail(&self) -> Option<String> {
        self.pid.map(|pid| {
            if self.pid_alive {
                format!("pid {pid}")
            } else {
                format!("pid {pid} not running")
            }
        })
    }

    fn tone(&self) -> Tone {
        match self.label() {
            "running" => Tone::Good,
            "starting" => Tone::Degraded,
            _ => Tone::Bad,
        }
    }
}

/// Renders one line per service plus a summary line.
pub fn render_report<T: ReportLine>(title: &str, report: &Report<T>, color: bool) -> String {
    let width = report
        .iter()
        .map(|entry| entry.name.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "{title}");

    let mut good = 0;
    for entry in report.iter() {
        let tone = entry.outcome.tone();
        if tone == Tone::Good {
            good += 1;
        }
        let (marker, paint) = match tone {
            Tone::Good => ("ok  ", GREEN_BOLD),
            Tone::Degraded => ("warn", YELLOW_BOLD),
            Tone::Bad => ("FAIL", RED_BOLD),
        };
        let label = entry.outcome.label();
        let state = if color {
            format!("{paint}{label}{RESET}")
        } else {
            label
        };

        let _ = write!(out, "  [{marker}] {:<width$}  {state}", entry.name);
        if let Some(detail) = entry.outcome.detail() {
            let _ = write!(out, " ({detail})");
        }
        let _ = writeln!(out, "  log: {}", entry.log_path.display());
    }

    let _ = writeln!(out, "{good}/{} service(s) ok", report.len());
    out
}

/// Machine-readable form of a report.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a, T: Serialize> {
    /// Operation name: start, stop or status.
    pub operation: &'a str,
    /// Whether the operation counts as successful.
    pub success: bool,
    /// When the report was produced.
    pub generated_at: chrono::DateTime<chrono::Utc>,
    /// The per-service entries.
    #[serde(flatten)]
    pub report: &'a Report<T>,
}

/// Serializes a report as pretty JSON.
pub fn render_json<T: Serialize>(
    operation: &str,
    success: bool,
    report: &Report<T>,
) -> Result<String, StackError> {
    let payload = JsonReport {
        operation,
        success,
        generated_at: chrono::Utc::now(),
        report,
    };
    Ok(serde_json::to_string_pretty(&payload)?)
}
