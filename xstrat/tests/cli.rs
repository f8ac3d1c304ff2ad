use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("xstrat");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

#[test]
fn help_prints_usage() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Usage"));
}

#[test]
fn unknown_flag_before_the_script_is_fatal() {
    bin().arg("--bogus").assert().failure().stderr(contains("--bogus"));
}

#[test]
fn missing_default_script_names_the_searched_locations() {
    let dir = tempdir().unwrap();

    bin()
        .arg("--local")
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(contains("safe_demo.py"))
        .stderr(contains("strategy"));
}

#[test]
fn missing_named_script_is_fatal() {
    let dir = tempdir().unwrap();

    bin()
        .args(["--local", "ghost.py"])
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(contains("ghost.py"));
}

#[test]
fn json_failure_envelope_carries_the_error() {
    let dir = tempdir().unwrap();

    let output = bin()
        .args(["--local", "--json", "ghost.py"])
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("ghost.py"), "{error}");
}

#[test]
fn forced_docker_without_docker_cli_is_fatal() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("demo.py"), "print('hi')\n").unwrap();

    bin()
        .args(["--docker", "demo.py"])
        .arg("--root")
        .arg(dir.path())
        .env("PATH", "")
        .assert()
        .failure()
        .stderr(contains("docker not found"));
}

#[test]
fn native_without_conda_reports_install_hint() {
    let dir = tempdir().unwrap();
    let home = tempdir().unwrap();
    fs::write(dir.path().join("demo.py"), "print('hi')\n").unwrap();

    bin()
        .args(["--local", "demo.py"])
        .arg("--root")
        .arg(dir.path())
        .env("PATH", "")
        .env("HOME", home.path())
        .assert()
        .failure()
        .stderr(contains("Miniconda"));
}
