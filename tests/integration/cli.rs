//! Tests for the `weave` binary.

use std::process::{Command, Output};

use crate::fixtures::{ManifestDir, LIB_APP_MANIFEST};

fn weave(dir: &ManifestDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_weave"))
        .args(args)
        .arg("--config")
        .arg(dir.config_path())
        .env("HOME", dir.dir.path())
        .env_remove("WEAVE_DEBUG")
        .output()
        .expect("Failed to run weave")
}

/// Test: `weave run --json` reports every task
#[test]
fn test_run_json_output() {
    let dir = ManifestDir::new(LIB_APP_MANIFEST);
    let manifest = dir.path.to_string_lossy().to_string();
    let output = weave(&dir, &["run", "--json", &manifest, "app:test"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["success"], true);

    let tasks = report["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|task| task["state"] == "success"));
    assert!(report["outcome"]["results"]["lib"].is_object());
}

/// Test: A failing task makes the run exit non-zero
#[test]
fn test_run_failure_exit_code() {
    let dir = ManifestDir::new(
        r#"
[[build]]
name = "app"

[[build.task]]
name = "compile"
command = "exit 2"

[[build.task]]
name = "test"
depends_on = ["compile"]
"#,
    );
    let manifest = dir.path.to_string_lossy().to_string();
    let output = weave(&dir, &["run", &manifest, "app:test"]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("BUILD FAILED"), "{}", stdout);
    assert!(stdout.contains("app:compile"), "{}", stdout);
}

/// Test: Unqualified task names are rejected
#[test]
fn test_run_rejects_unqualified_task() {
    let dir = ManifestDir::new(LIB_APP_MANIFEST);
    let manifest = dir.path.to_string_lossy().to_string();
    let output = weave(&dir, &["run", &manifest, "test"]);
    assert!(!output.status.success());
}

/// Test: `weave graph` lists tasks after their dependencies
#[test]
fn test_graph_output() {
    let dir = ManifestDir::new(LIB_APP_MANIFEST);
    let manifest = dir.path.to_string_lossy().to_string();
    let output = weave(&dir, &["graph", &manifest]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let compile = stdout.find("  lib:compile").unwrap();
    let jar = stdout.find("  lib:jar <- lib:compile").unwrap();
    assert!(compile < jar);
    assert!(stdout.contains("app:compile <- lib:jar"));
}
