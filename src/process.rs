//! Spawning, tracking and stopping service processes.
//!
//! A spawned service is detached from the controller: it runs in its own
//! session (and so its own process group) with output redirected to its log
//! file, and its pid is persisted so a later, separate invocation can stop it.
use std::{
    fs::{self, File},
    io::ErrorKind,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant, UNIX_EPOCH},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use regex::Regex;
use serde::Serialize;
use strum_macros::AsRefStr;
use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::{
    constants::{
        DEFAULT_SHELL, KILL_SETTLE_TIMEOUT, PID_START_SLACK, PID_TMP_SUFFIX,
        PROCESS_CHECK_INTERVAL, SHELL_COMMAND_FLAG,
    },
    descriptor::ServiceDescriptor,
    error::{PidFileError, StackError},
};

/// Result of stopping one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The recorded process was terminated.
    #[strum(serialize = "stopped")]
    Stopped(u32),
    /// The fallback tier terminated this many processes matching the service's pattern.
    #[strum(serialize = "stopped (by pattern)")]
    StoppedByPattern(usize),
    /// Nothing was running: no pid file, a dead pid, and no matching process.
    #[strum(serialize = "already stopped")]
    AlreadyStopped,
    /// Signals could not be delivered or the process survived SIGKILL.
    #[strum(serialize = "failed")]
    Failed(String),
}

impl StopOutcome {
    /// Whether the service is known to be down afterwards.
    pub fn is_success(&self) -> bool {
        !matches!(self, StopOutcome::Failed(_))
    }
}

/// One spawned (or recovered) service process.
#[derive(Debug)]
pub struct ProcessHandle {
    service: String,
    pid: u32,
    pid_path: PathBuf,
    log_path: PathBuf,
    /// Present only in the invocation that spawned the process.
    child: Option<Child>,
}

impl ProcessHandle {
    /// Launches `descriptor` as a detached background process and records its pid.
    ///
    /// The pid file is written before this returns, so a controller crash right
    /// after spawning still leaves the service stoppable.
    pub fn spawn(descriptor: &ServiceDescriptor) -> Result<Self, StackError> {
        let service = descriptor.name.clone();
        let start_error = |source: std::io::Error| StackError::ServiceStartError {
            service: service.clone(),
            source,
        };

        if let Some(dir) = descriptor.log_path.parent() {
            fs::create_dir_all(dir).map_err(start_error)?;
        }
        let stdout = File::create(&descriptor.log_path).map_err(start_error)?;
        let stderr = stdout.try_clone().map_err(start_error)?;

        let command = &descriptor.command;
        debug!(
            "Spawning '{}' in {:?}: {}",
            descriptor.name, command.working_dir, command.line
        );

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(&command.line)
            .current_dir(&command.working_dir)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        unsafe {
            cmd.pre_exec(|| {
                // New session: no controlling terminal, and the service leads its own group.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(start_error)?;

        let mut handle = Self {
            service: descriptor.name.clone(),
            pid: child.id(),
            pid_path: descriptor.pid_path.clone(),
            log_path: descriptor.log_path.clone(),
            child: Some(child),
        };

        if let Err(err) = write_pid_file(&handle.pid_path, handle.pid) {
            warn!(
                "Could not record pid {} for '{}'; killing it since it could never be stopped: {err}",
                handle.pid, handle.service
            );
            if let Some(child) = handle.child.as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(StackError::ServiceStartError {
                service: handle.service,
                source: std::io::Error::other(err.to_string()),
            });
        }

        info!("Spawned '{}' with pid {}", handle.service, handle.pid);
        Ok(handle)
    }

    /// Recovers a handle from a pid file written by an earlier invocation.
    ///
    /// Returns `Ok(None)` when the file is absent.
    pub fn from_pid_file(
        service: &str,
        pid_path: &Path,
        log_path: &Path,
    ) -> Result<Option<Self>, PidFileError> {
        Ok(read_pid_file(pid_path)?.map(|pid| Self {
            service: service.to_string(),
            pid,
            pid_path: pid_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            child: None,
        }))
    }

    /// Operating-system process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Name of the owning service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Log file receiving the process output.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Pid file recording this process.
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Exit status if this invocation spawned the process and it has exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// Whether the process is still running. An exited process is `false`, never an error.
    ///
    /// A handle recovered from a pid file only counts a live pid that still
    /// belongs to the recorded service; a recycled pid reads as exited.
    pub fn is_alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(_)) => return false,
                Ok(None) => return true,
                Err(err) => {
                    debug!("try_wait failed for '{}': {err}", self.service);
                }
            }
            return pid_is_alive(self.pid);
        }
        recorded_pid_is_alive(self.pid, &self.pid_path)
    }

    /// Stops the process: SIGTERM, up to `grace` to exit, then SIGKILL.
    ///
    /// The pid file is removed when the process is gone, whether this call
    /// killed it or it was already dead.
    pub fn stop(mut self, grace: Duration) -> StopOutcome {
        if !self.is_alive() {
            debug!(
                "Process {} for '{}' is not running; clearing pid file",
                self.pid, self.service
            );
            self.clear_pid_file();
            return StopOutcome::AlreadyStopped;
        }

        info!("Stopping '{}' (pid {})", self.service, self.pid);
        let outcome = match terminate_pid(self.pid, true, grace, &self.service) {
            Ok(true) => StopOutcome::Stopped(self.pid),
            Ok(false) => StopOutcome::AlreadyStopped,
            Err(reason) => return StopOutcome::Failed(reason),
        };

        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
        self.clear_pid_file();
        outcome
    }

    /// Lets the process keep running after the handle is dropped.
    pub fn detach(mut self) -> u32 {
        // Dropping a `Child` neither waits on nor kills it.
        self.child.take();
        self.pid
    }

    fn clear_pid_file(&self) {
        if let Err(err) = remove_pid_file(&self.pid_path) {
            warn!(
                "Failed to remove pid file {:?} for '{}': {err}",
                self.pid_path, self.service
            );
        }
    }
}

/// Stops the service recorded in `pid_path`. A missing file means already stopped.
///
/// An unparsable pid file cannot name a process, so it is removed and treated as absent.
pub fn stop_recorded(
    service: &str,
    pid_path: &Path,
    log_path: &Path,
    grace: Duration,
) -> StopOutcome {
    match ProcessHandle::from_pid_file(service, pid_path, log_path) {
        Ok(Some(handle)) => handle.stop(grace),
        Ok(None) => StopOutcome::AlreadyStopped,
        Err(PidFileError::Malformed { path, contents }) => {
            warn!("Discarding malformed pid file {path} for '{service}': '{contents}'");
            let _ = remove_pid_file(pid_path);
            StopOutcome::AlreadyStopped
        }
        Err(err) => StopOutcome::Failed(err.to_string()),
    }
}

/// Terminates every process whose command line matches `pattern`.
///
/// This is the fallback for services started by a separate launcher that
/// never wrote a pid file here. The controller's own process is never matched.
pub fn terminate_matching(service: &str, pattern: &Regex, grace: Duration) -> StopOutcome {
    let targets = matching_pids(pattern);
    if targets.is_empty() {
        debug!("No process matches stop pattern '{pattern}' for '{service}'");
        return StopOutcome::AlreadyStopped;
    }

    info!(
        "Stopping {} process(es) matching '{pattern}' for '{service}': {:?}",
        targets.len(),
        targets
    );

    let mut stopped = 0;
    let mut failures = Vec::new();
    for pid in targets {
        match terminate_pid(pid, false, grace, service) {
            Ok(true) => stopped += 1,
            Ok(false) => {}
            Err(reason) => failures.push(reason),
        }
    }

    if !failures.is_empty() {
        return StopOutcome::Failed(failures.join("; "));
    }
    if stopped == 0 {
        StopOutcome::AlreadyStopped
    } else {
        StopOutcome::StoppedByPattern(stopped)
    }
}

/// Pids of live processes whose command line matches `pattern`.
pub fn matching_pids(pattern: &Regex) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let own_pid = std::process::id();

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            pid.as_u32() != own_pid && !matches!(process.status(), ProcessStatus::Zombie)
        })
        .filter_map(|(pid, process)| {
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            (!cmdline.is_empty() && pattern.is_match(&cmdline)).then_some(pid.as_u32())
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Checks whether `pid` refers to a live process (signal-zero equivalent).
///
/// Reaps the process first if it is an exited child of this controller, so a
/// zombie never reads as alive.
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(target) = to_nix_pid(pid) else {
        return false;
    };

    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(_) => {}
        Ok(_) => return false,
    }

    match signal::kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(err) => {
            debug!("Signal-zero check for pid {pid} failed: {err}");
            false
        }
    }
}

/// Whether `pid` is alive and is still the service process recorded in `pid_path`.
///
/// Pids are recycled after a reboot or wraparound, so a live pid alone proves
/// nothing. A service process leads its own session and started within
/// `PID_START_SLACK` of its pid file being written.
pub fn recorded_pid_is_alive(pid: u32, pid_path: &Path) -> bool {
    if !pid_is_alive(pid) {
        return false;
    }
    if !leads_own_session(pid) {
        debug!("pid {pid} from {pid_path:?} does not lead its own session; treating as recycled");
        return false;
    }
    if !started_near_pid_file(pid, pid_path) {
        debug!("pid {pid} did not start when {pid_path:?} was written; treating as recycled");
        return false;
    }
    true
}

fn leads_own_session(pid: u32) -> bool {
    to_nix_pid(pid).is_some_and(|target| {
        let sid = unsafe { libc::getsid(target.as_raw()) };
        sid == target.as_raw()
    })
}

fn started_near_pid_file(pid: u32, pid_path: &Path) -> bool {
    let Some(written) = fs::metadata(pid_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
    else {
        return false;
    };

    let target = SysPid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let Some(process) = system.process(target) else {
        return false;
    };

    let started = process.start_time();
    let written = written.as_secs();
    let slack = PID_START_SLACK.as_secs();
    started <= written.saturating_add(slack) && written <= started.saturating_add(slack)
}

#[cfg(target_os = "linux")]
fn proc_stat_fields(pid: &str) -> Option<(char, i32)> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesised command name: state, ppid, pgrp, ...
    let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
    let state = fields.next()?.chars().next()?;
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(&pid.to_string()).is_some_and(|(state, _)| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Whether any non-zombie process remains in process group `pgid`.
#[cfg(target_os = "linux")]
fn group_has_live_members(pgid: Pid) -> bool {
    if matches!(signal::killpg(pgid, None), Err(Errno::ESRCH)) {
        return false;
    }
    let Ok(entries) = fs::read_dir("/proc") else {
        return true;
    };
    entries.filter_map(Result::ok).any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        name.bytes().all(|b| b.is_ascii_digit())
            && proc_stat_fields(&name).is_some_and(|(state, pgrp)| {
                pgrp == pgid.as_raw() && state != 'Z' && state != 'X'
            })
    })
}

#[cfg(not(target_os = "linux"))]
fn group_has_live_members(pgid: Pid) -> bool {
    !matches!(signal::killpg(pgid, None), Err(Errno::ESRCH))
}

fn to_nix_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// With `group`, a process leading its own group is signalled as a group and
/// the stop only completes once every member is gone.
/// Returns `Ok(false)` when the process was already gone before any signal landed.
fn terminate_pid(pid: u32, group: bool, grace: Duration, service: &str) -> Result<bool, String> {
    let Some(target) = to_nix_pid(pid) else {
        return Ok(false);
    };
    let group = if group { own_group(target) } else { None };

    if !send_signal(target, group, Signal::SIGTERM, service)? {
        return Ok(false);
    }

    if wait_for_exit(pid, group, grace) {
        debug!("pid {pid} for '{service}' exited after SIGTERM");
        return Ok(true);
    }

    warn!("'{service}' (pid {pid}) did not exit within {grace:?} after SIGTERM; sending SIGKILL");
    send_signal(target, group, Signal::SIGKILL, service)?;

    if wait_for_exit(pid, group, KILL_SETTLE_TIMEOUT) {
        Ok(true)
    } else {
        Err(format!("pid {pid} for '{service}' survived SIGKILL"))
    }
}

/// The process group led by `target`, unless it is the controller's own group.
fn own_group(target: Pid) -> Option<Pid> {
    let own_pgid = unsafe { libc::getpgid(0) };
    let target_pgid = unsafe { libc::getpgid(target.as_raw()) };
    (target_pgid == target.as_raw() && target_pgid != own_pgid).then_some(target)
}

/// Signals `group` (when given) and the process itself.
///
/// Returns `Ok(false)` if neither the process nor any group member received it.
fn send_signal(target: Pid, group: Option<Pid>, sig: Signal, service: &str) -> Result<bool, String> {
    let mut delivered = false;
    if let Some(pgid) = group {
        match signal::killpg(pgid, sig) {
            Ok(()) => delivered = true,
            Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => warn!(
                "Insufficient permissions to signal process group {pgid} for '{service}'. Falling back to direct signal"
            ),
            Err(other) => return Err(format!("{sig} to group {pgid} failed: {other}")),
        }
    }

    match signal::kill(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(delivered),
        Err(err) => Err(format!("{sig} to pid {target} failed: {err}")),
    }
}

fn wait_for_exit(pid: u32, group: Option<Pid>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) && !group.is_some_and(group_has_live_members) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }
}

/// Writes `pid` to `path` through a temporary sibling and a rename, so a
/// concurrent reader never sees a half-written value.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), PidFileError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!("{PID_TMP_SUFFIX}.{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, pid.to_string())?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Reads the pid stored at `path`; `Ok(None)` when the file does not exist.
pub fn read_pid_file(path: &Path) -> Result<Option<u32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let trimmed = contents.trim();
    trimmed
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Some)
        .ok_or_else(|| PidFileError::Malformed {
            path: path.display().to_string(),
            contents: trimmed.to_string(),
        })
}

/// Removes the pid file at `path`. A missing file is not an error.
pub fn remove_pid_file(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
