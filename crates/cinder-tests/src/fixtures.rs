//! Pipeline files and trigger payloads.

use cinder_core::build::{BuildEvent, Commit, JobState};
use cinder_scheduler::{Hook, TaskFilter};

/// One step, no matrix.
pub const SIMPLE: &str = "
steps:
  build:
    image: golang:1.22
    commands:
      - go build ./...
      - go test ./...
";

/// Two Go versions on two operating systems.
pub const MATRIX: &str = "
steps:
  test:
    image: golang:${GO}
    commands: [go test ./...]
matrix:
  GO: ['1', '2']
  OS: [linux, windows]
";

/// The same matrix with every windows axis excluded.
pub const MATRIX_EXCLUDE: &str = "
steps:
  test:
    image: golang:${GO}
    commands: [go test ./...]
matrix:
  GO: ['1', '2']
  OS: [linux, windows]
  exclude:
    OS: [windows]
";

/// Jobs that need a windows agent.
pub const WINDOWS: &str = "
platform: windows/amd64
steps:
  test:
    image: mcr.microsoft.com/windows/servercore
    commands: [dir]
";

pub fn commit(branch: &str, message: &str) -> Commit {
    Commit {
        sha: "d6cd1e2bd19e03a81132a23b2025920577f84e37".to_string(),
        git_ref: format!("refs/heads/{}", branch),
        branch: branch.to_string(),
        message: message.to_string(),
        author: "octocat".to_string(),
        link: None,
    }
}

pub fn push_hook(repo: &str, branch: &str) -> Hook {
    Hook {
        repo: repo.to_string(),
        event: BuildEvent::Push,
        commit: commit(branch, "update build"),
        deploy_to: None,
        sender: "octocat".to_string(),
    }
}

pub fn platform(name: &str) -> TaskFilter {
    TaskFilter::new([("platform".to_string(), name.to_string())].into())
}

pub fn linux() -> TaskFilter {
    platform("linux/amd64")
}

pub fn exited(code: i32) -> JobState {
    JobState {
        exited: true,
        exit_code: code,
        ..Default::default()
    }
}
