//! Shared helpers for the integration tests: build throwaway repositories
//! with pinned dates and identities so commit ids are deterministic, and
//! drive the cbridge binary the way an operator would.

#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};

pub struct CmdResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CmdResult {
    fn from(output: Output) -> CmdResult {
        CmdResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed in {}:\n{}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn try_git(dir: &Path, args: &[&str]) -> CmdResult {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to spawn git")
        .into()
}

/// Fresh repository on branch `main` with a pinned identity.
pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Test Operator"]);
    git(dir, &["config", "user.email", "operator@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// Commit with author == committer and a pinned date, so the commit id is a
/// pure function of tree + parent + message.
pub fn commit_all(dir: &Path, message_args: &[&str], date: &str) {
    git(dir, &["add", "-A"]);
    let mut args = vec!["commit", "-q"];
    args.extend_from_slice(message_args);
    let output = Command::new("git")
        .args(&args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Ada Lovelace")
        .env("GIT_AUTHOR_EMAIL", "ada@example.com")
        .env("GIT_AUTHOR_DATE", date)
        .env("GIT_COMMITTER_NAME", "Ada Lovelace")
        .env("GIT_COMMITTER_EMAIL", "ada@example.com")
        .env("GIT_COMMITTER_DATE", date)
        .output()
        .expect("failed to spawn git commit");
    assert!(
        output.status.success(),
        "git commit failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn write_and_commit(dir: &Path, file: &str, content: &str, subject: &str, date: &str) {
    std::fs::write(dir.join(file), content).unwrap();
    commit_all(dir, &["-m", subject], date);
}

/// Carrier repository: one commit so HEAD exists, plus an `origin` remote
/// pointing at a bare hub, which export requires to be configured.
pub fn setup_carrier(dir: &Path, hub: &Path) {
    std::fs::create_dir_all(hub).unwrap();
    let hub_str = hub.to_string_lossy().to_string();
    let output = Command::new("git")
        .args(["init", "-q", "--bare", &hub_str])
        .output()
        .expect("failed to spawn git init --bare");
    assert!(output.status.success());

    init_repo(dir);
    write_and_commit(dir, "README.md", "carrier\n", "init carrier", "2024-01-01T09:00:00+00:00");
    git(dir, &["remote", "add", "origin", &hub_str]);
}

pub fn cbridge(args: &[&str]) -> CmdResult {
    Command::new(env!("CARGO_BIN_EXE_cbridge"))
        .args(args)
        .output()
        .expect("failed to spawn cbridge")
        .into()
}

pub fn cbridge_ok(args: &[&str]) -> CmdResult {
    let result = cbridge(args);
    assert_eq!(
        result.exit_code, 0,
        "cbridge {:?} failed:\nstdout:\n{}\nstderr:\n{}",
        args, result.stdout, result.stderr
    );
    result
}

pub fn head_sha(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

pub fn log_subjects_oldest_first(dir: &Path) -> Vec<String> {
    git(dir, &["log", "--reverse", "--format=%s"])
        .lines()
        .map(|line| line.to_string())
        .collect()
}
