#[path = "common/mod.rs"]
mod common;

use std::{fs, process::Command};

use aistack::{
    config::load_config,
    process::StopOutcome,
    stack::StackController,
    supervisor::StartOutcome,
};
use common::{free_port, is_process_alive, read_pid, wait_for_process_exit, write_stack_file};
use tempfile::tempdir;

fn controller(config_path: &std::path::Path) -> StackController {
    let config = load_config(Some(config_path.to_str().unwrap())).expect("load config");
    StackController::from_config(&config).expect("build controller")
}

#[test]
fn later_invocation_stops_what_an_earlier_one_started() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
poll_interval: 100ms
stop_grace: 1s
services:
  - name: ollama
    command: "exec sleep 30"
    port: {}
    ready_timeout: 300ms
  - name: searxng
    command: "exec sleep 30"
    port: {}
    ready_timeout: 300ms
"#,
            free_port(),
            free_port()
        ),
    );

    let pids: Vec<u32> = {
        let first = controller(&config_path);
        let report = first.start::<&str>(&[]).expect("start");
        report
            .iter()
            .map(|entry| entry.outcome.pid().expect("spawned"))
            .collect()
    };

    let pid_dir = dir.join("state/pids");
    assert_eq!(read_pid(&pid_dir.join("ollama.pid")), pids[0]);
    assert_eq!(read_pid(&pid_dir.join("searxng.pid")), pids[1]);
    assert!(pids.iter().all(|pid| is_process_alive(*pid)));

    let second = controller(&config_path);
    let status = second.status::<&str>(&[]).expect("status");
    assert!(status.iter().all(|entry| entry.outcome.pid_alive));

    let report = second.stop(&["searxng"]).expect("stop");
    assert_eq!(report.get("searxng"), Some(&StopOutcome::Stopped(pids[1])));
    assert!(report.get("ollama").is_none());
    wait_for_process_exit(pids[1]);
    assert!(!pid_dir.join("searxng.pid").exists());
    assert!(is_process_alive(pids[0]));

    let third = controller(&config_path);
    let report = third.stop::<&str>(&[]).expect("stop all");
    assert_eq!(report.get("ollama"), Some(&StopOutcome::Stopped(pids[0])));
    assert_eq!(report.get("searxng"), Some(&StopOutcome::AlreadyStopped));
    wait_for_process_exit(pids[0]);
}

#[test]
fn live_pid_file_blocks_a_second_spawn_across_invocations() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
poll_interval: 100ms
services:
  - name: comfyui
    command: "exec sleep 30"
    port: {}
    ready_timeout: 200ms
"#,
            free_port()
        ),
    );

    let first = controller(&config_path).start(&["comfyui"]).expect("start");
    let pid = first.get("comfyui").and_then(StartOutcome::pid).expect("spawned");

    let second = controller(&config_path).start(&["comfyui"]).expect("start");
    assert_eq!(second.get("comfyui"), Some(&StartOutcome::AlreadyRunning));
    assert_eq!(read_pid(&dir.join("state/pids/comfyui.pid")), pid);

    controller(&config_path).stop(&["comfyui"]).expect("stop");
    wait_for_process_exit(pid);
}

#[test]
fn stale_pid_file_falls_back_to_stop_pattern() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
stop_grace: 1s
services:
  - name: tts
    command: "exec sleep 30"
    port: {}
    stop_pattern: '^sleep 411\.5$'
"#,
            free_port()
        ),
    );

    let pid_dir = dir.join("state/pids");
    fs::create_dir_all(&pid_dir).unwrap();
    fs::write(pid_dir.join("tts.pid"), "999999999").unwrap();
    let mut external = Command::new("sleep").arg("411.5").spawn().expect("spawn");

    let report = controller(&config_path).stop(&["tts"]).expect("stop");

    assert_eq!(report.get("tts"), Some(&StopOutcome::StoppedByPattern(1)));
    assert!(!pid_dir.join("tts.pid").exists());
    let _ = external.try_wait();
}

#[test]
fn log_file_collects_service_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_stack_file(
        dir,
        &format!(
            r#"version: "1"
log_dir: logs
state_dir: state
env:
  vars:
    GREETING: "hello from cua"
services:
  - name: cua
    command: "echo $GREETING; exec sleep 30"
    port: {}
    ready_timeout: 500ms
"#,
            free_port()
        ),
    );

    let controller = controller(&config_path);
    let report = controller.start(&["cua"]).expect("start");
    let entry = report.iter().next().expect("one entry");
    assert_eq!(entry.log_path, dir.join("logs/cua.log"));

    let log = fs::read_to_string(&entry.log_path).unwrap();
    assert!(log.contains("hello from cua"), "log was: {log:?}");

    controller.stop(&["cua"]).expect("stop");
}
