//! CLI tests for `dodder list` and `dodder run`.
//!
//! Spawns the dodder binary against a backend URL nothing listens on and
//! checks exit codes and messages.

use std::net::TcpListener;
use std::process::{Command, Stdio};

use dodder::exit_codes;
use dodder::test_support::TestProject;

/// A local URL with no server behind it.
fn dead_backend_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);
    url
}

fn project_with_dead_backend() -> TestProject {
    let project = TestProject::new().expect("project");
    project
        .write_config(&format!(
            "[backend]\nurl = \"{}\"\nrequest_timeout_secs = 5\nmax_attempts = 1\n",
            dead_backend_url()
        ))
        .expect("write config");
    project
}

fn dodder() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dodder"));
    cmd.stdin(Stdio::null()).env_remove("OLLAMA_HOST");
    cmd
}

#[test]
fn list_with_unreachable_backend_exits_with_backend_code() {
    let project = project_with_dead_backend();
    let output = dodder()
        .current_dir(project.path())
        .arg("list")
        .output()
        .expect("dodder list");
    assert_eq!(output.status.code(), Some(exit_codes::BACKEND_UNAVAILABLE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("list models"), "stderr: {stderr}");
}

#[test]
fn run_with_unreachable_backend_exits_with_backend_code() {
    let project = project_with_dead_backend();
    let output = dodder()
        .arg("run")
        .arg("llama3.1")
        .arg("write a hello world script")
        .arg("--dir")
        .arg(project.path())
        .output()
        .expect("dodder run");
    assert_eq!(output.status.code(), Some(exit_codes::BACKEND_UNAVAILABLE));
}

#[test]
fn run_without_description_and_no_input_fails() {
    let project = project_with_dead_backend();
    let output = dodder()
        .arg("run")
        .arg("llama3.1")
        .arg("--dir")
        .arg(project.path())
        .output()
        .expect("dodder run");
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no project description"), "stderr: {stderr}");
}

#[test]
fn run_rejects_out_of_range_parameters() {
    let project = project_with_dead_backend();
    let output = dodder()
        .args(["run", "llama3.1", "hello", "--top-p", "1.5", "--dir"])
        .arg(project.path())
        .output()
        .expect("dodder run");
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("top_p"), "stderr: {stderr}");
}

#[test]
fn run_rejects_unsupported_instructions_file() {
    let project = project_with_dead_backend();
    let rules = project.path().join("rules.json");
    std::fs::write(&rules, "{}").expect("write rules");
    let output = dodder()
        .args(["run", "llama3.1", "hello", "--instructions"])
        .arg(&rules)
        .arg("--dir")
        .arg(project.path())
        .output()
        .expect("dodder run");
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
}

#[test]
fn short_version_flag_prints_version() {
    let output = dodder().arg("-v").output().expect("dodder -v");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "stdout: {stdout}");
}
