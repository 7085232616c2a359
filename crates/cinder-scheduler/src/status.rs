//! Build status reduction.

use cinder_core::build::{Job, JobState, Status};

/// Exit code an agent reports for a killed process.
pub const EXIT_KILLED: i32 = 137;

/// Derive a build's status from its jobs.
///
/// Only top-level jobs count; child processes are bookkeeping for their parent.
/// A build is `running` while any job runs, `pending` while any job has yet to
/// finish, and otherwise takes the most severe terminal status.
pub fn reduce(jobs: &[Job]) -> Status {
    let top: Vec<Status> = jobs
        .iter()
        .filter(|job| job.is_top_level())
        .map(|job| job.status)
        .collect();

    if top.is_empty() {
        return Status::Pending;
    }
    if top.contains(&Status::Running) {
        return Status::Running;
    }
    if top.iter().any(|status| !status.is_terminal()) {
        return Status::Pending;
    }

    for severe in [Status::Error, Status::Failure, Status::Killed] {
        if top.contains(&severe) {
            return severe;
        }
    }
    Status::Success
}

/// Terminal status for a job given the agent's final report.
pub fn derive_done_status(state: &JobState, cancelled: bool) -> Status {
    if cancelled {
        return Status::Killed;
    }
    if state.error.as_deref().is_some_and(|e| !e.is_empty()) {
        return Status::Error;
    }
    match state.exit_code {
        0 => Status::Success,
        EXIT_KILLED => Status::Killed,
        _ => Status::Failure,
    }
}
