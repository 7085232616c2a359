//! Trigger handling: the path from an inbound hook to queued tasks.

use crate::queue::{Task, TaskQueue};
use chrono::Utc;
use cinder_auth::{TokenKind, peek_subject, verify_config, verify_token};
use cinder_compiler::{CompileOutcome, CompileRequest, Compiler};
use cinder_core::build::{Axis, Build, BuildEvent, Commit, Job, Pipeline};
use cinder_core::events::{EVENTS_TOPIC, EventKind, Message};
use cinder_core::ports::{EventBus, Remote, Stores};
use cinder_core::repo::Repo;
use cinder_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static SKIP_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(ci *skip|skip *ci)\]").expect("valid skip pattern")
});

/// Normalized trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    /// Repository full name, `owner/name`.
    pub repo: String,
    pub event: BuildEvent,
    pub commit: Commit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_to: Option<String>,
    #[serde(default)]
    pub sender: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Created { build: Build, jobs: Vec<Job> },
    /// The trigger was valid but produced no build.
    Skipped { reason: String },
}

impl TriggerOutcome {
    pub fn build(&self) -> Option<&Build> {
        match self {
            TriggerOutcome::Created { build, .. } => Some(build),
            TriggerOutcome::Skipped { .. } => None,
        }
    }
}

/// Composition root for new builds: validate, compile, persist, publish, enqueue.
pub struct TriggerHandler {
    stores: Stores,
    remote: Arc<dyn Remote>,
    compiler: Arc<Compiler>,
    queue: Arc<TaskQueue>,
    bus: Arc<dyn EventBus>,
    link: String,
}

impl TriggerHandler {
    pub fn new(
        stores: Stores,
        remote: Arc<dyn Remote>,
        compiler: Arc<Compiler>,
        queue: Arc<TaskQueue>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let link = compiler.options().link.trim_end_matches('/').to_string();
        Self {
            stores,
            remote,
            compiler,
            queue,
            bus,
            link,
        }
    }

    /// Handle an inbound hook. The token must be a hook token signed with the
    /// repo's hash whose subject is the repo's full name; every failure looks
    /// the same to the caller.
    pub async fn handle(&self, hook: Hook, token: &str) -> Result<TriggerOutcome> {
        let denied = || Error::Unauthorized("invalid or missing hook token".into());

        let subject = peek_subject(token).map_err(|_| denied())?;
        if subject != hook.repo {
            warn!(repo = %hook.repo, "hook token subject mismatch");
            return Err(denied());
        }
        let Some(repo) = self.stores.repos.find_by_name(&hook.repo).await? else {
            warn!(repo = %hook.repo, "hook for unknown repo");
            return Err(denied());
        };
        verify_token(token, &repo, TokenKind::Hook).map_err(|err| {
            warn!(repo = %repo.full_name, error = %err, "hook token rejected");
            denied()
        })?;

        self.trigger(&repo, hook).await
    }

    /// Start a build for an already-authorized trigger.
    pub async fn trigger(&self, repo: &Repo, hook: Hook) -> Result<TriggerOutcome> {
        if SKIP_MARKER.is_match(&hook.commit.message) {
            info!(repo = %repo.full_name, sha = %hook.commit.sha, "skip marker in commit message");
            return Ok(TriggerOutcome::Skipped {
                reason: "commit message contains a skip marker".into(),
            });
        }
        if !repo.policy.allows(hook.event) {
            info!(repo = %repo.full_name, event = %hook.event, "event disabled by repo policy");
            return Ok(TriggerOutcome::Skipped {
                reason: format!("{} events are disabled for {}", hook.event, repo.full_name),
            });
        }
        if hook.event == BuildEvent::Deploy && hook.deploy_to.is_none() {
            return Err(Error::InvalidInput("deploy events need a target environment".into()));
        }

        let mut build = Build::new(repo.id, hook.event, hook.commit);
        build.deploy_to = hook.deploy_to;
        build.sender = hook.sender;
        self.enqueue(repo, build).await
    }

    /// Re-run a finished build as a new build with the same commit.
    pub async fn restart(
        &self,
        repo: &Repo,
        number: u64,
        sender: &str,
        deploy_to: Option<String>,
    ) -> Result<TriggerOutcome> {
        let previous = self
            .stores
            .builds
            .find_by_number(repo.id, number)
            .await?
            .ok_or_else(|| Error::not_found("build", number))?;
        if !previous.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "build {} is still {}",
                previous.number, previous.status
            )));
        }

        let event = if deploy_to.is_some() {
            BuildEvent::Deploy
        } else {
            previous.event
        };
        let mut build = Build::new(repo.id, event, previous.commit.clone());
        build.parent = Some(previous.number);
        build.deploy_to = deploy_to.or(previous.deploy_to.clone());
        build.sender = sender.to_string();
        info!(repo = %repo.full_name, parent = previous.number, "restarting build");
        self.enqueue(repo, build).await
    }

    async fn enqueue(&self, repo: &Repo, mut build: Build) -> Result<TriggerOutcome> {
        let config = self.remote.fetch_config(repo, &build).await?;
        let signature = verify_config(repo, &config.data, config.signature.as_deref());
        build.signed = signature.signed;
        build.verified = signature.verified;

        let prev = self
            .stores
            .builds
            .last_on_branch(repo.id, &build.commit.branch)
            .await?;
        let secrets = self.stores.secrets.list(repo.id).await?;

        // The number is part of the job environment, so reserve it before compiling.
        build.number = self.stores.builds.reserve_number(repo.id).await?;
        build.enqueued_at = Utc::now();

        let outcome = self.compiler.compile(CompileRequest {
            repo,
            build: &build,
            prev: prev.as_ref(),
            secrets: &secrets,
            config: &config.data,
        });
        let specs = match outcome {
            Ok(CompileOutcome::Jobs(specs)) => specs,
            Ok(CompileOutcome::Skipped { reason }) => {
                info!(repo = %repo.full_name, branch = %build.commit.branch, %reason, "trigger skipped");
                return Ok(TriggerOutcome::Skipped { reason });
            }
            Err(err) => {
                warn!(repo = %repo.full_name, number = build.number, error = %err, "pipeline rejected");
                return Err(err);
            }
        };

        let jobs: Vec<Job> = specs
            .iter()
            .map(|spec| {
                let mut job = Job::new(build.id, spec.number, spec.axis.clone());
                job.name = job_name(&spec.axis);
                job.platform = spec.platform.clone();
                job.enqueued_at = build.enqueued_at;
                job
            })
            .collect();

        let tasks = specs
            .into_iter()
            .zip(&jobs)
            .map(|(spec, job)| {
                let pipeline = Pipeline {
                    id: job.id,
                    config: serde_json::to_value(&spec.plan)?,
                    timeout: repo.policy.timeout_minutes,
                };
                Ok(Task {
                    id: job.id.to_string(),
                    labels: spec.labels,
                    data: serde_json::to_vec(&pipeline)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.stores.builds.create(&build).await?;
        self.stores.jobs.create_batch(&jobs).await?;
        info!(
            repo = %repo.full_name,
            number = build.number,
            event = %build.event,
            jobs = jobs.len(),
            verified = build.verified,
            "build enqueued"
        );

        self.bus.publish(
            EVENTS_TOPIC,
            Message::build_event(EventKind::Enqueued, repo, &build, jobs.clone()),
        );
        self.dispatch(repo.clone(), build.clone(), tasks);

        Ok(TriggerOutcome::Created { build, jobs })
    }

    /// Push tasks and post the pending commit status after the caller has its answer.
    fn dispatch(&self, repo: Repo, build: Build, tasks: Vec<Task>) {
        let queue = self.queue.clone();
        let remote = self.remote.clone();
        let link = format!("{}/{}/{}", self.link, repo.full_name, build.number);
        tokio::spawn(async move {
            for task in tasks {
                queue.push(task);
            }
            debug!(repo = %repo.full_name, number = build.number, "tasks pushed");
            if let Err(err) = remote.set_status(&repo, &build, &link).await {
                warn!(repo = %repo.full_name, number = build.number, error = %err, "failed to post commit status");
            }
        });
    }
}

fn job_name(axis: &Axis) -> String {
    axis.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
