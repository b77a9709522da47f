#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
};

use assert_cmd::cargo::cargo_bin_cmd;
use common::{
    free_port, is_process_alive, read_pid, wait_for_path, wait_for_process_exit, write_stack_file,
};
use predicates::str::contains;
use tempfile::tempdir;

fn stack_file(dir: &Path, port: u16) -> String {
    write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
poll_interval: 100ms
stop_grace: 1s
services:
  - name: searxng
    command: "echo searching; exec sleep 30"
    port: {port}
    ready_timeout: 300ms
"#
        ),
    )
    .to_string_lossy()
    .into_owned()
}

fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn start_status_logs_stop_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = stack_file(dir, free_port());

    let start = cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--json", "-c", &config, "start"])
        .output()
        .expect("run start");
    // A service that never opens its port is unconfirmed, which is not a clean start.
    assert!(!start.status.success());
    let report = json_stdout(&start);
    assert_eq!(report["operation"], "start");
    assert_eq!(report["services"][0]["name"], "searxng");
    assert_eq!(report["services"][0]["outcome"]["state"], "started_unconfirmed");
    let pid = report["services"][0]["outcome"]["detail"]
        .as_u64()
        .expect("pid in detail") as u32;

    let pid_path = dir.join("state/pids/searxng.pid");
    assert_eq!(read_pid(&pid_path), pid);
    assert!(is_process_alive(pid));

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--no-color", "-c", &config, "status"])
        .assert()
        .failure()
        .stdout(contains("searxng"))
        .stdout(contains("starting"));

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["-c", &config, "logs", "searxng", "-n", "5"])
        .assert()
        .success()
        .stdout(contains("searching"));

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--no-color", "-c", &config, "stop"])
        .assert()
        .success()
        .stdout(contains("stopped"))
        .stdout(contains("1/1 service(s) ok"));

    wait_for_process_exit(pid);
    assert!(!pid_path.exists());
}

#[test]
fn occupied_port_reports_already_running() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let config = stack_file(dir, listener.local_addr().unwrap().port());

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--no-color", "-c", &config, "start"])
        .assert()
        .success()
        .stdout(contains("already running"));

    assert!(!dir.join("state/pids/searxng.pid").exists());
    assert!(!dir.join("logs/searxng.log").exists());
}

#[test]
fn unknown_service_fails_before_anything_runs() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = stack_file(dir, free_port());

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["-c", &config, "start", "searxng", "comfyui"])
        .assert()
        .failure()
        .stderr(contains("comfyui"));

    assert!(!dir.join("state/pids/searxng.pid").exists());
}

#[test]
fn stop_with_nothing_running_is_clean() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = stack_file(dir, free_port());

    let output = cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--json", "-c", &config, "stop"])
        .output()
        .expect("run stop");

    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["success"], true);
    assert_eq!(report["services"][0]["outcome"]["state"], "already_stopped");
}

#[test]
fn missing_stack_file_is_an_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let missing = temp.path().join("nope.yaml");

    cargo_bin_cmd!("aistack")
        .env("HOME", temp.path())
        .args(["-c", missing.to_str().unwrap(), "status"])
        .assert()
        .failure();

    assert!(!fs::exists(temp.path().join("state")).unwrap_or(false));
}

#[test]
fn killed_controller_leaves_service_stoppable() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
poll_interval: 100ms
stop_grace: 1s
services:
  - name: comfyui
    command: "exec sleep 60"
    port: {}
    ready_timeout: 30s
"#,
            free_port()
        ),
    );

    let mut controller = Command::new(assert_cmd::cargo::cargo_bin!("aistack"))
        .env("HOME", dir)
        .arg("-c")
        .arg(&config)
        .arg("start")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn controller");

    let pid_path = dir.join("state/pids/comfyui.pid");
    wait_for_path(&pid_path);
    let pid = read_pid(&pid_path);
    controller.kill().expect("kill controller");
    controller.wait().expect("reap controller");

    assert!(is_process_alive(pid));

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .arg("--no-color")
        .arg("-c")
        .arg(&config)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("stopped"));

    wait_for_process_exit(pid);
    assert!(!pid_path.exists());
}

#[test]
fn debug_logging_reports_runtime_mode() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config = stack_file(dir, free_port());

    cargo_bin_cmd!("aistack")
        .env("HOME", dir)
        .args(["--log-level", "debug", "-c", &config, "stop"])
        .assert()
        .success()
        .stderr(contains("Runtime mode User"))
        .stderr(contains(".local/share/aistack"));
}
