#[path = "common/mod.rs"]
mod common;

use std::{fs, process::Command, time::Duration};

use aistack::{
    descriptor::{ServiceCommand, ServiceDescriptor},
    process::{self, ProcessHandle, StopOutcome},
};
use common::{free_port, is_process_alive, read_pid, wait_for_path, wait_for_process_exit};
use regex::Regex;
use tempfile::tempdir;

fn descriptor(dir: &std::path::Path, name: &str, line: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(
        name,
        ServiceCommand::new(line, dir),
        free_port(),
        &dir.join("logs"),
        &dir.join("pids"),
    )
}

#[test]
fn spawn_records_pid_and_redirects_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let svc = descriptor(temp.path(), "ollama", "echo booting; exec sleep 30");

    let handle = ProcessHandle::spawn(&svc).expect("spawn");
    let pid = handle.pid();

    assert_eq!(read_pid(&svc.pid_path), pid);
    assert!(is_process_alive(pid));

    wait_for_path(&svc.log_path);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !fs::read_to_string(&svc.log_path)
        .unwrap_or_default()
        .contains("booting")
    {
        assert!(std::time::Instant::now() < deadline, "log never filled");
        std::thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(handle.stop(Duration::from_secs(2)), StopOutcome::Stopped(pid));
    assert!(!svc.pid_path.exists());
}

#[test]
fn service_env_reaches_the_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut svc = descriptor(temp.path(), "tts", "echo voice=$VOICE > env.out; exec sleep 30");
    svc.command
        .env
        .insert("VOICE".to_string(), "af_bella".to_string());

    let handle = ProcessHandle::spawn(&svc).expect("spawn");
    let out = temp.path().join("env.out");
    wait_for_path(&out);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(fs::read_to_string(&out).unwrap().trim(), "voice=af_bella");
    handle.stop(Duration::from_secs(2));
}

#[test]
fn detached_process_is_stopped_from_pid_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let svc = descriptor(temp.path(), "cua", "exec sleep 30");

    let pid = ProcessHandle::spawn(&svc).expect("spawn").detach();
    assert!(is_process_alive(pid));

    let outcome = process::stop_recorded(
        &svc.name,
        &svc.pid_path,
        &svc.log_path,
        Duration::from_secs(2),
    );

    assert_eq!(outcome, StopOutcome::Stopped(pid));
    wait_for_process_exit(pid);
    assert!(!svc.pid_path.exists());
}

#[test]
fn term_ignoring_process_is_killed_after_grace() {
    let temp = tempdir().expect("failed to create tempdir");
    let svc = descriptor(
        temp.path(),
        "comfyui",
        "trap '' TERM; while true; do sleep 0.1; done",
    );

    let handle = ProcessHandle::spawn(&svc).expect("spawn");
    let pid = handle.pid();
    std::thread::sleep(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let outcome = handle.stop(Duration::from_millis(500));

    assert_eq!(outcome, StopOutcome::Stopped(pid));
    assert!(started.elapsed() >= Duration::from_millis(400));
    wait_for_process_exit(pid);
}

#[test]
fn absent_pid_file_is_already_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let outcome = process::stop_recorded(
        "searxng",
        &temp.path().join("searxng.pid"),
        &temp.path().join("searxng.log"),
        Duration::from_secs(1),
    );

    assert_eq!(outcome, StopOutcome::AlreadyStopped);
}

#[test]
fn dead_pid_is_already_stopped_and_cleared() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_path = temp.path().join("frontend.pid");

    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait");
    process::write_pid_file(&pid_path, pid).expect("write pid");

    let outcome = process::stop_recorded(
        "frontend",
        &pid_path,
        &temp.path().join("frontend.log"),
        Duration::from_secs(1),
    );

    assert_eq!(outcome, StopOutcome::AlreadyStopped);
    assert!(!pid_path.exists());
}

#[test]
fn pattern_fallback_stops_unrecorded_process() {
    let mut child = Command::new("sleep")
        .arg("317.25")
        .spawn()
        .expect("spawn sleep");
    let pid = child.id();
    let pattern = Regex::new(r"^sleep 317\.25$").unwrap();

    assert_eq!(process::matching_pids(&pattern), vec![pid]);

    let outcome = process::terminate_matching("mcp-unified", &pattern, Duration::from_secs(2));

    assert_eq!(outcome, StopOutcome::StoppedByPattern(1));
    let _ = child.try_wait();
    assert!(process::matching_pids(&pattern).is_empty());
}

#[test]
fn pattern_without_matches_is_already_stopped() {
    let pattern = Regex::new(r"^aistack-no-such-process-\d+$").unwrap();

    assert_eq!(
        process::terminate_matching("tts", &pattern, Duration::from_millis(100)),
        StopOutcome::AlreadyStopped
    );
}

#[test]
fn service_leads_its_own_session() {
    let temp = tempdir().expect("failed to create tempdir");
    let svc = descriptor(temp.path(), "frontend", "exec sleep 30");

    let handle = ProcessHandle::spawn(&svc).expect("spawn");
    let pid = handle.pid() as i32;

    let sid = unsafe { libc::getsid(pid) };
    let pgid = unsafe { libc::getpgid(pid) };
    assert_eq!(sid, pid);
    assert_eq!(pgid, pid);
    assert_ne!(sid, unsafe { libc::getsid(0) });

    handle.stop(Duration::from_secs(2));
}

#[test]
fn recycled_pid_in_pid_file_is_never_signalled() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_path = temp.path().join("ollama.pid");
    let mut unrelated = Command::new("sleep").arg("60").spawn().expect("spawn sleep");
    let pid = unrelated.id();
    process::write_pid_file(&pid_path, pid).expect("write pid");

    assert!(!process::recorded_pid_is_alive(pid, &pid_path));
    let outcome = process::stop_recorded(
        "ollama",
        &pid_path,
        &temp.path().join("ollama.log"),
        Duration::from_millis(200),
    );

    assert_eq!(outcome, StopOutcome::AlreadyStopped);
    assert!(!pid_path.exists());
    assert!(is_process_alive(pid));
    unrelated.kill().expect("kill sleep");
    unrelated.wait().expect("reap sleep");
}

#[test]
fn stop_waits_for_group_members_that_outlive_the_shell() {
    let temp = tempdir().expect("failed to create tempdir");
    let svc = descriptor(
        temp.path(),
        "comfyui",
        "(trap '' TERM; while true; do sleep 0.1; done) & echo $! > worker.pid; wait",
    );

    let handle = ProcessHandle::spawn(&svc).expect("spawn");
    let pid = handle.pid();
    let worker_pid_path = temp.path().join("worker.pid");
    wait_for_path(&worker_pid_path);
    std::thread::sleep(Duration::from_millis(200));
    let worker = read_pid(&worker_pid_path);
    assert!(is_process_alive(worker));

    let outcome = handle.stop(Duration::from_millis(500));

    assert_eq!(outcome, StopOutcome::Stopped(pid));
    wait_for_process_exit(worker);
}
