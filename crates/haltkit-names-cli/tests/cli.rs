use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_haltkit-names");

fn run(args: &[&str]) -> std::process::Output {
    Command::new(BIN)
        .args(args)
        .env_remove("HALTKIT_NAME_BACKEND")
        .env_remove("HALTKIT_NAME_WORKERS")
        .env_remove("HALTKIT_NAME_HELPER_BIN")
        .env_remove("HALTKIT_NAME_TIMEOUT_MS")
        .output()
        .expect("run haltkit-names")
}

#[cfg(target_os = "linux")]
#[test]
fn native_backend_reports_unknown_handle_without_a_name() {
    let out = run(&[
        "resolve",
        "--pid",
        "1",
        "--handle",
        "999999",
        "--handle",
        "0x7fff0",
        "--backend",
        "native",
        "--timeout-ms",
        "500",
    ]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["schema_version"], "haltkit.names.report@0.1.0");
    assert_eq!(lines[0]["pid"], 1);
    assert_eq!(lines[0]["handle"], 999999);
    assert!(lines[0]["name"].is_null());
    assert_eq!(lines[1]["handle"], 0x7fff0);
}

#[test]
fn missing_helper_fails_start_with_exit_code_2() {
    let out = Command::new(BIN)
        .args(["resolve", "--pid", "1", "--handle", "4", "--backend", "pool"])
        .env("HALTKIT_NAME_HELPER_BIN", "/nonexistent/haltkit-name-helper")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("start pool name resolver"), "{stderr}");
}

#[test]
fn show_config_applies_file_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("names.json");
    std::fs::write(&path, br#"{"workers": 5, "timeout_ms": 40}"#).unwrap();

    let out = Command::new(BIN)
        .args(["show-config", "--config"])
        .arg(&path)
        .env("HALTKIT_NAME_TIMEOUT_MS", "70")
        .env_remove("HALTKIT_NAME_WORKERS")
        .env_remove("HALTKIT_NAME_BACKEND")
        .output()
        .unwrap();
    assert!(out.status.success());
    let cfg: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(cfg["workers"], 5);
    assert_eq!(cfg["timeout_ms"], 70);
    assert_eq!(cfg["backend"], "pool");
}

#[test]
fn unknown_config_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("names.json");
    std::fs::write(&path, br#"{"threads": 2}"#).unwrap();
    let out = run(&["show-config", "--config", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(2));
}

#[cfg(target_os = "linux")]
#[test]
fn snapshot_records_are_resolved_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    std::fs::write(
        &path,
        br#"{
            "schema_version": "haltkit.handle-record@1",
            "records": [
                {"owner_pid": 1, "handle_value": 999999},
                {"owner_pid": 1, "handle_value": 999998, "granted_access": 1179785}
            ]
        }"#,
    )
    .unwrap();
    let out = run(&[
        "resolve",
        "--snapshot",
        path.to_str().unwrap(),
        "--backend",
        "native",
        "--timeout-ms",
        "500",
    ]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8(out.stdout).unwrap();
    let handles: Vec<u64> = stdout
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["handle"].as_u64().unwrap())
        .collect();
    assert_eq!(handles, vec![999999, 999998]);
}

#[test]
fn snapshot_with_another_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, br#"{"schema_version": "haltkit.handle-record@9", "records": []}"#)
        .unwrap();
    let out = run(&["resolve", "--snapshot", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("haltkit.handle-record@1"), "{stderr}");
}

#[test]
fn snapshot_and_pid_are_mutually_exclusive() {
    let out = run(&["resolve", "--snapshot", "x.json", "--pid", "1", "--handle", "4"]);
    assert_eq!(out.status.code(), Some(2));
}
