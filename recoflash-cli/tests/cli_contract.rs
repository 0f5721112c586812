//! Integration tests for core CLI contract behavior.

use predicates::prelude::*;

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("recoflash").expect("binary exists")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("recoflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("recoflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("recoflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("list-ports --json should emit valid JSON");
    assert!(parsed.is_array());
}

#[test]
fn completions_bash_writes_script_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("recoflash"));
}

#[test]
fn erase_without_a_target_fails_before_touching_any_port() {
    let mut cmd = cli_cmd();
    cmd.arg("erase")
        .env_remove("RECOFLASH_PORT")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--page"));
}

#[test]
fn flash_requires_an_existing_image() {
    let mut cmd = cli_cmd();
    cmd.args(["--quiet", "flash", "no-such-image.hex"])
        .env_remove("RECOFLASH_PORT")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-image.hex"));
}

#[test]
fn verify_requires_a_port() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hex = dir.path().join("tiny.hex");
    std::fs::write(&hex, ":0400000001020304F2\n:00000001FF\n").expect("write hex");

    let mut cmd = cli_cmd();
    cmd.args(["--quiet", "verify"])
        .arg(&hex)
        .env_remove("RECOFLASH_PORT")
        .assert()
        .failure()
        .stderr(predicate::str::contains("serial port"));
}

#[test]
fn unknown_subcommand_fails() {
    let mut cmd = cli_cmd();
    cmd.arg("frobnicate").assert().failure();
}
