#![cfg(unix)]

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const STACK: &str = r#"
[supervisor]
restart_settle_ms = 10
start_stagger_ms = 0
restart_stagger_ms = 0

[commands]
status = "echo {service} STOPPED"
start = "true"
stop = "true"
running_markers = ["RUNNING"]
stopped_markers = ["STOPPED"]
already_started_markers = ["already been started"]
already_stopped_markers = ["is not started"]

[[service]]
id = "web"
display_name = "Web Server"
service_name = "websvc"
ports = [8080]
status = "echo {service} STATE RUNNING"

[[service]]
id = "db"
display_name = "Database"
service_name = "dbsvc"
ports = [3306]
start = "false"
"#;

fn stackpanel(config_dir: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("stackpanel").into();
    cmd.env("STACKPANEL_CONFIG_DIR", config_dir);
    cmd.env("STACKPANEL_LOG", "warn");
    cmd.timeout(Duration::from_secs(30));
    cmd
}

fn setup(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("stackpanel.toml"), config).unwrap();
    dir
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_e2e_status_table() {
    let dir = setup(STACK);
    let output = stackpanel(dir.path()).arg("status").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    let web_line = stdout
        .lines()
        .find(|l| l.contains("web"))
        .expect("web should appear in status output");
    assert!(web_line.contains("running"), "got: {web_line}");

    let db_line = stdout
        .lines()
        .find(|l| l.contains("db"))
        .expect("db should appear in status output");
    assert!(db_line.contains("stopped"), "got: {db_line}");
}

#[test]
fn test_e2e_status_json_keeps_registry_order() {
    let dir = setup(STACK);
    let json = json_output(stackpanel(dir.path()).args(["status", "--json"]));
    let services = json.as_array().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0]["id"], "web");
    assert_eq!(services[0]["state"], "running");
    assert_eq!(services[1]["id"], "db");
    assert_eq!(services[1]["state"], "stopped");
}

#[test]
fn test_e2e_explicit_config_path() {
    let dir = setup(STACK);
    let other = TempDir::new().unwrap();
    let json = json_output(stackpanel(other.path()).args([
        "--json",
        "--config",
        dir.path().join("stackpanel.toml").to_str().unwrap(),
        "status",
    ]));
    assert_eq!(json.as_array().unwrap().len(), 2);
}

#[test]
fn test_e2e_stop_running_service() {
    let dir = setup(STACK);
    stackpanel(dir.path())
        .args(["stop", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stop:").and(predicate::str::contains("web")));
}

#[test]
fn test_e2e_start_already_running_is_noop() {
    let dir = setup(STACK);
    stackpanel(dir.path())
        .args(["start", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already running"));
}

#[test]
fn test_e2e_start_failure_reports_and_exits_nonzero() {
    let dir = setup(STACK);
    stackpanel(dir.path())
        .args(["start", "db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "db: start command exited unsuccessfully (now stopped)",
        ));
}

#[test]
fn test_e2e_batch_start_reports_every_service() {
    let dir = setup(STACK);
    let output = stackpanel(dir.path())
        .args(["start", "--json"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["action"], "start");
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["service_id"], "web");
    assert_eq!(entries[0]["result"], "already_in_desired_state");
    assert_eq!(entries[1]["service_id"], "db");
    assert_eq!(entries[1]["result"], "failed");
    assert_eq!(entries[1]["final_state"], "stopped");
}

#[test]
fn test_e2e_unknown_service_rejected() {
    let dir = setup(STACK);
    stackpanel(dir.path())
        .args(["stop", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown service: nope"));
}

#[test]
fn test_e2e_detail_json() {
    let dir = setup(STACK);
    let json = json_output(stackpanel(dir.path()).args(["detail", "web", "--json"]));
    assert_eq!(json["id"], "web");
    assert_eq!(json["display_name"], "Web Server");
    assert_eq!(json["service_name"], "websvc");
    assert_eq!(json["state"], "running");
    assert_eq!(json["ports"], serde_json::json!([8080]));
}

#[test]
fn test_e2e_detail_unknown_service_fails() {
    let dir = setup(STACK);
    stackpanel(dir.path())
        .args(["detail", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_e2e_ports_reports_listener() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = STACK.replace("ports = [8080]", &format!("ports = [{port}]"));
    let dir = setup(&config);

    let json = json_output(stackpanel(dir.path()).args(["ports", "--json"]));
    let ports = json.as_array().unwrap();
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0]["port"], port);
    assert_eq!(ports[0]["in_use"], true);
    assert_eq!(ports[1]["port"], 3306);
}

#[test]
fn test_e2e_init_writes_default_config_once() {
    let dir = TempDir::new().unwrap();
    let config_dir = dir.path().join("nested");

    stackpanel(&config_dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    let content = std::fs::read_to_string(config_dir.join("stackpanel.toml")).unwrap();
    assert!(content.contains("[[service]]"));
    assert!(content.contains("mariadb"));

    stackpanel(&config_dir)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_e2e_invalid_config_fails() {
    let dir = setup(
        r#"
[[service]]
id = "web"
display_name = "Web"
service_name = "a"

[[service]]
id = "web"
display_name = "Web again"
service_name = "b"
"#,
    );
    stackpanel(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate service id `web`"));
}

#[test]
fn test_e2e_no_command_prints_help() {
    let dir = TempDir::new().unwrap();
    stackpanel(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}
