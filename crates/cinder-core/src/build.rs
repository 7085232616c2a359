//! Build, job and agent protocol types.

use crate::ids::{BuildId, JobId, RepoId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One assignment of matrix variables to values.
pub type Axis = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildEvent {
    Push,
    Pull,
    Tag,
    Deploy,
}

impl BuildEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildEvent::Push => "push",
            BuildEvent::Pull => "pull",
            BuildEvent::Tag => "tag",
            BuildEvent::Deploy => "deploy",
        }
    }
}

impl fmt::Display for BuildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status shared by builds and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Killed,
    Skipped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
            Status::Killed => "killed",
            Status::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub branch: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    /// Monotonic per repository, reserved from the store before compiling.
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
    pub event: BuildEvent,
    pub status: Status,
    pub commit: Commit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_to: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub signed: bool,
    pub verified: bool,
    /// Set once by cancellation. Running jobs report `killed` when they finish.
    #[serde(default)]
    pub cancelled: bool,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(repo_id: RepoId, event: BuildEvent, commit: Commit) -> Self {
        Self {
            id: BuildId::new(),
            repo_id,
            number: 0,
            parent: None,
            event,
            status: Status::Pending,
            commit,
            deploy_to: None,
            sender: String::new(),
            error: None,
            signed: false,
            verified: false,
            cancelled: false,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    /// 1-based position within the build. Child processes share their parent's number.
    pub number: u32,
    /// Set for nested processes reported through `Update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobId>,
    #[serde(default)]
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub environ: Axis,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(build_id: BuildId, number: u32, environ: Axis) -> Self {
        Self {
            id: JobId::new(),
            build_id,
            number,
            parent: None,
            name: String::new(),
            status: Status::Pending,
            exit_code: 0,
            error: None,
            environ,
            platform: String::new(),
            agent: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

/// Process state reported by an agent through `Init`, `Update` and `Done`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Name of the (child) process the report refers to.
    #[serde(default)]
    pub proc: String,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Work unit handed to an agent by `Next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: JobId,
    /// Compiled execution plan, opaque to the queue.
    pub config: serde_json::Value,
    /// Timeout in minutes.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub job_id: JobId,
    #[serde(default)]
    pub proc: String,
    #[serde(default)]
    pub pos: u64,
    /// Seconds since the process started.
    #[serde(default)]
    pub time: i64,
    pub out: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub mime: String,
    pub size: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_terminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        for status in [
            Status::Success,
            Status::Failure,
            Status::Error,
            Status::Killed,
            Status::Skipped,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_commit_ref_field_name() {
        let commit = Commit {
            sha: "abc".into(),
            git_ref: "refs/heads/main".into(),
            branch: "main".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&commit).unwrap();
        assert_eq!(json["ref"], "refs/heads/main");
    }

    #[test]
    fn test_job_state_defaults() {
        let state: JobState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, JobState::default());
    }
}
