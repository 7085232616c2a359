//! Agent RPC gateway.
//!
//! Bridges the agent protocol (`next`, `extend`, `wait`, `init`, `update`,
//! `done`, `upload`, `log`) to the task queue, the stores and the event bus.
//! Every job transition runs under its build's lock together with the build
//! status reduction. Store writes that fail on this path are handed to the
//! [`StoreRetrier`] instead of failing the agent.

use crate::locks::BuildLocks;
use crate::queue::{TaskFilter, TaskQueue};
use crate::retry::{PendingWrite, StoreRetrier, WriteKey};
use crate::status::{EXIT_KILLED, derive_done_status, reduce};
use chrono::Utc;
use cinder_core::build::{Build, File, Job, JobState, LogLine, Pipeline, Status};
use cinder_core::events::{EVENTS_TOPIC, EventKind, Message, log_topic};
use cinder_core::ports::{EventBus, Remote, Stores};
use cinder_core::{BuildId, Error, JobId, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Gateway {
    queue: Arc<TaskQueue>,
    stores: Stores,
    bus: Arc<dyn EventBus>,
    locks: Arc<BuildLocks>,
    retrier: Arc<StoreRetrier>,
    remote: Option<Arc<dyn Remote>>,
    link: String,
}

impl Gateway {
    pub fn new(
        queue: Arc<TaskQueue>,
        stores: Stores,
        bus: Arc<dyn EventBus>,
        retrier: Arc<StoreRetrier>,
    ) -> Self {
        Self {
            queue,
            stores,
            bus,
            locks: retrier.locks().clone(),
            retrier,
            remote: None,
            link: String::new(),
        }
    }

    /// Post commit status to source control when a build finishes.
    pub fn with_remote(mut self, remote: Arc<dyn Remote>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Server base URL used for build links.
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into().trim_end_matches('/').to_string();
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The build as last written, including state still waiting to reach the store.
    pub fn current_build(&self, build: Build) -> Build {
        self.retrier.pending_build(build.id).unwrap_or(build)
    }

    /// Jobs of a build, including state still waiting to reach the store.
    pub async fn current_jobs(&self, build_id: BuildId) -> Result<Vec<Job>> {
        self.load_jobs(build_id).await
    }

    /// Lease the next pipeline the agent can run.
    ///
    /// Tasks whose job already finished (or whose build was cancelled while the
    /// task sat in the queue) are acknowledged and skipped.
    pub async fn next(&self, filter: &TaskFilter, cancel: &CancellationToken) -> Result<Pipeline> {
        loop {
            let task = self.queue.poll(filter, cancel).await?;
            let pipeline: Pipeline = match serde_json::from_slice(&task.data) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    error!(task = %task.id, error = %err, "dropping undecodable task");
                    self.queue.done(&task.id);
                    continue;
                }
            };

            let job = match self.load_job(pipeline.id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job = %pipeline.id, "dropping task for unknown job");
                    self.queue.done(&task.id);
                    continue;
                }
                Err(err) => {
                    // The lease is the source of truth; hand the work out anyway.
                    warn!(job = %pipeline.id, error = %err, "job lookup failed, delivering task");
                    return Ok(pipeline);
                }
            };

            if job.status.is_terminal() {
                debug!(job = %job.id, status = %job.status, "skipping finished job");
                self.queue.done(&task.id);
                continue;
            }

            if let Ok(Some(build)) = self.load_build(job.build_id).await {
                if build.cancelled {
                    info!(job = %job.id, build = %build.id, "closing job of cancelled build");
                    let killed = JobState {
                        exited: true,
                        exit_code: EXIT_KILLED,
                        ..Default::default()
                    };
                    if let Err(err) = self.done(job.id, killed).await {
                        warn!(job = %job.id, error = %err, "failed to close cancelled job");
                    }
                    continue;
                }
            }

            debug!(job = %job.id, "pipeline leased");
            return Ok(pipeline);
        }
    }

    /// Keep the lease alive. `NotFound` tells the agent to stop: the task is
    /// gone, the job finished, or the build was cancelled.
    pub async fn extend(&self, id: JobId) -> Result<()> {
        let job = self
            .load_job(id)
            .await?
            .ok_or_else(|| Error::not_found("job", id))?;
        if job.status.is_terminal() {
            return Err(Error::not_found("job", id));
        }
        if let Some(build) = self.load_build(job.build_id).await? {
            if build.cancelled {
                return Err(Error::not_found("job", id));
            }
        }
        self.queue.extend(&id.to_string())
    }

    /// Block until the job's task is acknowledged.
    pub async fn wait(&self, id: JobId, cancel: &CancellationToken) -> Result<()> {
        self.queue.wait(&id.to_string(), cancel).await
    }

    /// Agent started the job.
    pub async fn init(&self, id: JobId, state: JobState, agent: Option<String>) -> Result<()> {
        let build_id = self.build_of(id).await?;
        let _guard = self.locks.acquire(build_id).await;

        let mut build = self.require_build(build_id).await?;
        let mut jobs = self.load_jobs(build_id).await?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| Error::not_found("job", id))?;

        let was_pending = build.status == Status::Pending;
        if job.status == Status::Pending {
            job.status = Status::Running;
            job.started_at = Some(state.started.unwrap_or_else(Utc::now));
            job.agent = agent;
            let job = job.clone();
            self.persist_job(&job, false).await;
            info!(job = %id, build = %build_id, agent = ?job.agent, "job started");
        } else {
            debug!(job = %id, status = %job.status, "ignoring init");
        }

        let status = reduce(&jobs);
        if status != build.status {
            build.status = status;
            if status == Status::Running && build.started_at.is_none() {
                build.started_at = Some(Utc::now());
            }
            self.persist_build(&build).await;
        }

        let kind = if was_pending && build.status == Status::Running {
            EventKind::Started
        } else {
            EventKind::Updated
        };
        self.publish(kind, &build, jobs).await;
        Ok(())
    }

    /// Progress report for a child process of the job, identified by `state.proc`.
    pub async fn update(&self, id: JobId, state: JobState) -> Result<()> {
        let build_id = self.build_of(id).await?;
        let _guard = self.locks.acquire(build_id).await;

        let build = self.require_build(build_id).await?;
        let mut jobs = self.load_jobs(build_id).await?;
        let parent = jobs
            .iter()
            .find(|job| job.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", id))?;

        if parent.status.is_terminal() {
            debug!(job = %id, "ignoring update for finished job");
        } else if state.proc.is_empty() || state.proc == parent.name {
            if let Some(job) = jobs.iter_mut().find(|job| job.id == id) {
                if job.status == Status::Pending && state.started.is_some() {
                    job.status = Status::Running;
                    job.started_at = state.started;
                    let job = job.clone();
                    self.persist_job(&job, false).await;
                }
            }
        } else {
            let existing = jobs
                .iter()
                .position(|job| job.parent == Some(id) && job.name == state.proc);
            let (index, create) = match existing {
                Some(index) => (index, self.retrier.needs_create(jobs[index].id)),
                None => {
                    let mut child = Job::new(build_id, parent.number, parent.environ.clone());
                    child.parent = Some(id);
                    child.name = state.proc.clone();
                    child.platform = parent.platform.clone();
                    child.agent = parent.agent.clone();
                    jobs.push(child);
                    (jobs.len() - 1, true)
                }
            };

            let child = &mut jobs[index];
            if !child.status.is_terminal() {
                if child.status == Status::Pending && state.started.is_some() {
                    child.status = Status::Running;
                    child.started_at = state.started;
                }
                if state.exited {
                    child.status = derive_done_status(&state, build.cancelled);
                    child.exit_code = state.exit_code;
                    child.error = state.error.clone().filter(|e| !e.is_empty());
                    child.finished_at = Some(state.finished.unwrap_or_else(Utc::now));
                    if child.started_at.is_none() {
                        child.started_at = child.finished_at;
                    }
                }
                let child = child.clone();
                debug!(job = %id, proc = %child.name, status = %child.status, "process updated");
                self.persist_job(&child, create).await;
            }
        }

        self.publish(EventKind::Updated, &build, jobs).await;
        Ok(())
    }

    /// Agent finished the job. Safe to repeat: a job that is already terminal
    /// is left unchanged.
    pub async fn done(&self, id: JobId, state: JobState) -> Result<()> {
        // Acknowledge first so queue progress survives any store failure below.
        self.queue.done(&id.to_string());

        match self.finish(id, &state).await {
            Err(err) if err.is_transient() => {
                warn!(job = %id, error = %err, "store unavailable, finishing job in background");
                self.retrier.defer_done(id, state);
                Ok(())
            }
            result => result,
        }
    }

    /// Replay deferred `done` reports that are due. Returns how many were applied.
    pub async fn flush_deferred(&self) -> usize {
        let mut applied = 0;
        for entry in self.retrier.take_due_done() {
            match self.finish(entry.id, &entry.state).await {
                Ok(()) => {
                    debug!(job = %entry.id, attempts = entry.attempts + 1, "deferred done applied");
                    self.retrier.done_applied(entry.id);
                    applied += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(job = %entry.id, error = %err, "deferred done failed, will retry");
                    self.retrier.retry_done(entry);
                }
                Err(err) => warn!(job = %entry.id, error = %err, "dropping deferred done"),
            }
        }
        applied
    }

    /// Flush pending store writes and deferred `done` reports on a fixed tick
    /// until `cancel` fires.
    pub async fn run_retries(self: Arc<Self>, cancel: CancellationToken) {
        let delay = self.retrier.config().delay;
        let mut ticker = tokio::time::interval(delay);
        info!(attempts = self.retrier.config().attempts, ?delay, "store retrier started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.retrier.flush().await;
                    self.flush_deferred().await;
                }
                _ = cancel.cancelled() => {
                    let left = self.retrier.pending_count() + self.retrier.deferred_count();
                    if left > 0 {
                        warn!(pending = left, "store retrier stopping with unwritten state");
                    }
                    info!("store retrier stopped");
                    return;
                }
            }
        }
    }

    async fn finish(&self, id: JobId, state: &JobState) -> Result<()> {
        let build_id = self.build_of(id).await?;
        let _guard = self.locks.acquire(build_id).await;

        let mut build = self.require_build(build_id).await?;
        let mut jobs = self.load_jobs(build_id).await?;
        let Some(index) = jobs.iter().position(|job| job.id == id) else {
            return Err(Error::not_found("job", id));
        };

        if jobs[index].status.is_terminal() {
            debug!(job = %id, status = %jobs[index].status, "duplicate done");
            self.publish(EventKind::Updated, &build, jobs).await;
            return Ok(());
        }

        let now = Utc::now();
        let finished = state.finished.unwrap_or(now);
        {
            let job = &mut jobs[index];
            job.status = derive_done_status(state, build.cancelled);
            job.exit_code = state.exit_code;
            job.error = state.error.clone().filter(|e| !e.is_empty());
            job.finished_at = Some(finished);
            if job.started_at.is_none() {
                job.started_at = Some(finished);
            }
            info!(job = %id, build = %build_id, status = %job.status, exit_code = job.exit_code, "job finished");
        }
        let job = jobs[index].clone();
        self.persist_job(&job, false).await;

        // Close child processes the agent left open.
        let mut closed = Vec::new();
        for child in jobs.iter_mut() {
            if child.parent == Some(id) && !child.status.is_terminal() {
                child.status = if child.started_at.is_some() {
                    Status::Success
                } else {
                    Status::Skipped
                };
                child.finished_at = Some(finished);
                closed.push(child.clone());
            }
        }
        for child in &closed {
            let create = self.retrier.needs_create(child.id);
            self.persist_job(child, create).await;
        }

        let status = reduce(&jobs);
        let mut finished_build = false;
        if status != build.status {
            build.status = status;
            if build.started_at.is_none() && status != Status::Pending {
                build.started_at = Some(now);
            }
            if status.is_terminal() {
                build.finished_at = Some(now);
                finished_build = true;
                info!(build = %build_id, number = build.number, status = %status, "build finished");
            }
            self.persist_build(&build).await;
        }

        let kind = if build.status.is_terminal() {
            EventKind::Finished
        } else {
            EventKind::Updated
        };
        self.publish(kind, &build, jobs).await;
        if finished_build {
            self.report_status(build);
        }
        Ok(())
    }

    /// Attach an artifact to the job.
    pub async fn upload(&self, id: JobId, file: File) -> Result<()> {
        if self.load_job(id).await?.is_none() {
            return Err(Error::not_found("job", id));
        }
        debug!(job = %id, file = %file.name, size = file.data.len(), "artifact uploaded");
        self.stores.logs.upload(id, file).await
    }

    /// Append a log line and stream it to `logs/{job}` subscribers.
    pub async fn log(&self, id: JobId, mut line: LogLine) -> Result<()> {
        line.job_id = id;
        self.stores.logs.append(id, &line).await?;
        self.bus.publish(&log_topic(id), Message::log(line));
        Ok(())
    }

    /// Cancel a build: pending jobs are killed and their tasks evicted. Running
    /// jobs are left to their agent, which learns of the cancellation on its
    /// next call.
    pub async fn cancel_build(&self, build_id: BuildId) -> Result<Build> {
        let _guard = self.locks.acquire(build_id).await;

        let mut build = self.require_build(build_id).await?;
        if build.cancelled {
            return Ok(build);
        }
        if build.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "build {} already finished with status {}",
                build.number, build.status
            )));
        }

        build.cancelled = true;
        let now = Utc::now();
        let mut jobs = self.load_jobs(build_id).await?;
        let mut evicted = 0;
        let mut killed = Vec::new();
        for job in jobs.iter_mut() {
            if job.status != Status::Pending {
                continue;
            }
            job.status = Status::Killed;
            job.exit_code = EXIT_KILLED;
            job.finished_at = Some(now);
            if job.is_top_level() && self.queue.evict(&job.id.to_string()) {
                evicted += 1;
            }
            killed.push(job.clone());
        }
        for job in &killed {
            let create = self.retrier.needs_create(job.id);
            self.persist_job(job, create).await;
        }

        build.status = reduce(&jobs);
        if build.status.is_terminal() {
            build.finished_at = Some(now);
        }
        self.persist_build(&build).await;
        info!(build = %build_id, number = build.number, killed = killed.len(), evicted, status = %build.status, "build cancelled");

        self.publish(EventKind::Cancelled, &build, jobs).await;
        if build.status.is_terminal() {
            self.report_status(build.clone());
        }
        Ok(build)
    }

    async fn build_of(&self, id: JobId) -> Result<BuildId> {
        self.load_job(id)
            .await?
            .map(|job| job.build_id)
            .ok_or_else(|| Error::not_found("job", id))
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        if let Some(job) = self.retrier.pending_job(id) {
            return Ok(Some(job));
        }
        self.stores.jobs.get(id).await
    }

    async fn load_build(&self, id: BuildId) -> Result<Option<Build>> {
        if let Some(build) = self.retrier.pending_build(id) {
            return Ok(Some(build));
        }
        self.stores.builds.get(id).await
    }

    async fn require_build(&self, id: BuildId) -> Result<Build> {
        self.load_build(id)
            .await?
            .ok_or_else(|| Error::not_found("build", id))
    }

    async fn load_jobs(&self, build_id: BuildId) -> Result<Vec<Job>> {
        let jobs = self.stores.jobs.list_by_build(build_id).await?;
        Ok(self.retrier.overlay_jobs(build_id, jobs))
    }

    async fn persist_job(&self, job: &Job, create: bool) {
        let result = if create {
            self.stores.jobs.create(job).await
        } else {
            self.stores.jobs.update(job).await
        };
        match result {
            Ok(()) => self.retrier.record_success(WriteKey::Job(job.id)),
            Err(err) => {
                warn!(job = %job.id, error = %err, "job write failed, retrying in background");
                self.retrier.record_failure(PendingWrite::Job {
                    job: job.clone(),
                    create,
                });
            }
        }
    }

    async fn persist_build(&self, build: &Build) {
        match self.stores.builds.update(build).await {
            Ok(()) => self.retrier.record_success(WriteKey::Build(build.id)),
            Err(err) => {
                warn!(build = %build.id, error = %err, "build write failed, retrying in background");
                self.retrier.record_failure(PendingWrite::Build(build.clone()));
            }
        }
    }

    async fn publish(&self, kind: EventKind, build: &Build, jobs: Vec<Job>) {
        match self.stores.repos.get(build.repo_id).await {
            Ok(Some(repo)) => {
                self.bus
                    .publish(EVENTS_TOPIC, Message::build_event(kind, &repo, build, jobs));
            }
            Ok(None) => warn!(build = %build.id, "repo missing, event not published"),
            Err(err) => warn!(build = %build.id, error = %err, "repo lookup failed, event not published"),
        }
    }

    fn report_status(&self, build: Build) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let repos = self.stores.repos.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            let repo = match repos.get(build.repo_id).await {
                Ok(Some(repo)) => repo,
                Ok(None) => return,
                Err(err) => {
                    warn!(build = %build.id, error = %err, "repo lookup failed, status not posted");
                    return;
                }
            };
            let link = format!("{}/{}/{}", link, repo.full_name, build.number);
            if let Err(err) = remote.set_status(&repo, &build, &link).await {
                warn!(repo = %repo.full_name, build = build.number, error = %err, "failed to post commit status");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Task;
    use crate::retry::RetryConfig;
    use crate::retry::tests::flaky_stores;
    use cinder_bus::InMemoryEventBus;
    use cinder_core::build::{BuildEvent, Commit};
    use cinder_core::events::{LabelFilter, Payload};
    use cinder_core::ports::{BuildStore, JobStore, Subscription};
    use cinder_core::repo::Repo;
    use cinder_store::{MemoryStore, StaticRemote};
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        gateway: Gateway,
        queue: Arc<TaskQueue>,
        memory: Arc<MemoryStore>,
        retrier: Arc<StoreRetrier>,
        bus: Arc<InMemoryEventBus>,
        remote: Arc<StaticRemote>,
        build: Build,
        jobs: Vec<Job>,
    }

    fn linux() -> TaskFilter {
        TaskFilter::new([("platform".to_string(), "linux/amd64".to_string())].into())
    }

    async fn fixture_with(stores: Stores, memory: Arc<MemoryStore>, jobs: usize) -> Fixture {
        let repo = Repo::new("octocat", "hello-world", "hash");
        stores.repos.create(&repo).await.unwrap();
        let mut build = Build::new(repo.id, BuildEvent::Push, Commit::default());
        build.number = stores.builds.reserve_number(repo.id).await.unwrap();
        stores.builds.create(&build).await.unwrap();

        let jobs: Vec<Job> = (1..=jobs as u32)
            .map(|n| {
                let mut job = Job::new(build.id, n, BTreeMap::new());
                job.platform = "linux/amd64".into();
                job
            })
            .collect();
        stores.jobs.create_batch(&jobs).await.unwrap();

        let queue = Arc::new(TaskQueue::default());
        for job in &jobs {
            let pipeline = Pipeline {
                id: job.id,
                config: serde_json::json!({"steps": []}),
                timeout: 60,
            };
            queue.push(Task {
                id: job.id.to_string(),
                labels: [("platform".to_string(), "linux/amd64".to_string())].into(),
                data: serde_json::to_vec(&pipeline).unwrap(),
            });
        }

        let bus = Arc::new(InMemoryEventBus::new());
        let remote = Arc::new(StaticRemote::new());
        let retrier = Arc::new(StoreRetrier::new(
            stores.clone(),
            Arc::new(BuildLocks::new()),
            RetryConfig::default().with_delay(Duration::from_millis(5)),
        ));
        let gateway = Gateway::new(queue.clone(), stores, bus.clone(), retrier.clone())
            .with_remote(remote.clone())
            .with_link("http://ci.example.com/");

        Fixture {
            gateway,
            queue,
            memory,
            retrier,
            bus,
            remote,
            build,
            jobs,
        }
    }

    async fn fixture(jobs: usize) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        fixture_with(Stores::from_shared(memory.clone()), memory, jobs).await
    }

    impl Fixture {
        async fn build(&self) -> Build {
            BuildStore::get(&*self.memory, self.build.id).await.unwrap().unwrap()
        }

        async fn job(&self, n: usize) -> Job {
            JobStore::get(&*self.memory, self.jobs[n].id).await.unwrap().unwrap()
        }

        fn subscribe(&self) -> Subscription {
            self.bus.subscribe(EVENTS_TOPIC, LabelFilter::any())
        }
    }

    fn exited(code: i32) -> JobState {
        JobState {
            exited: true,
            exit_code: code,
            ..Default::default()
        }
    }

    async fn next_kind(sub: &mut Subscription) -> EventKind {
        let message = tokio::time::timeout(Duration::from_secs(1), sub.stream.next())
            .await
            .unwrap()
            .unwrap();
        match message.payload {
            Payload::Build(event) => event.kind,
            Payload::Log(_) => panic!("unexpected log payload"),
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let fx = fixture(1).await;
        let mut events = fx.subscribe();
        let cancel = CancellationToken::new();

        let pipeline = fx.gateway.next(&linux(), &cancel).await.unwrap();
        assert_eq!(pipeline.id, fx.jobs[0].id);

        fx.gateway
            .init(pipeline.id, JobState::default(), Some("agent-1".into()))
            .await
            .unwrap();
        assert_eq!(next_kind(&mut events).await, EventKind::Started);
        let job = fx.job(0).await;
        assert_eq!(job.status, Status::Running);
        assert_eq!(job.agent.as_deref(), Some("agent-1"));
        let build = fx.build().await;
        assert_eq!(build.status, Status::Running);
        assert!(build.started_at.is_some());

        fx.gateway.extend(pipeline.id).await.unwrap();
        fx.gateway.done(pipeline.id, exited(0)).await.unwrap();
        assert_eq!(next_kind(&mut events).await, EventKind::Finished);

        assert_eq!(fx.job(0).await.status, Status::Success);
        let build = fx.build().await;
        assert_eq!(build.status, Status::Success);
        assert!(build.finished_at.is_some());
        assert!(!fx.queue.contains(&pipeline.id.to_string()));
    }

    #[tokio::test]
    async fn test_build_waits_for_every_job() {
        let fx = fixture(2).await;
        fx.gateway.init(fx.jobs[0].id, JobState::default(), None).await.unwrap();
        fx.gateway.done(fx.jobs[0].id, exited(1)).await.unwrap();
        assert_eq!(fx.build().await.status, Status::Pending);

        fx.gateway.init(fx.jobs[1].id, JobState::default(), None).await.unwrap();
        assert_eq!(fx.build().await.status, Status::Running);
        fx.gateway.done(fx.jobs[1].id, exited(0)).await.unwrap();
        assert_eq!(fx.build().await.status, Status::Failure);
    }

    #[tokio::test]
    async fn test_duplicate_done_is_idempotent() {
        let fx = fixture(1).await;
        let id = fx.jobs[0].id;
        fx.gateway.init(id, JobState::default(), None).await.unwrap();
        fx.gateway.done(id, exited(0)).await.unwrap();
        let job = fx.job(0).await;
        let build = fx.build().await;

        fx.gateway.done(id, exited(2)).await.unwrap();
        assert_eq!(fx.job(0).await, job);
        assert_eq!(fx.build().await, build);
    }

    #[tokio::test]
    async fn test_concurrent_done_reduces_once() {
        let fx = Arc::new(fixture(4).await);
        for job in &fx.jobs {
            fx.gateway.init(job.id, JobState::default(), None).await.unwrap();
        }

        let mut handles = Vec::new();
        for job in fx.jobs.clone() {
            let fx = fx.clone();
            handles.push(tokio::spawn(async move {
                fx.gateway.done(job.id, exited(0)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fx.build().await.status, Status::Success);
        // One finished status for the build, posted once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.remote.statuses().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_kills_pending_and_leaves_running() {
        let fx = fixture(4).await;
        let cancel = CancellationToken::new();
        let running = fx.gateway.next(&linux(), &cancel).await.unwrap().id;
        fx.gateway.init(running, JobState::default(), None).await.unwrap();

        let build = fx.gateway.cancel_build(fx.build.id).await.unwrap();
        assert!(build.cancelled);
        assert_eq!(build.status, Status::Running);

        let jobs = JobStore::list_by_build(&*fx.memory, fx.build.id).await.unwrap();
        let killed = jobs.iter().filter(|j| j.status == Status::Killed).count();
        assert_eq!(killed, 3);
        assert_eq!(jobs.iter().find(|j| j.id == running).unwrap().status, Status::Running);
        assert_eq!(fx.queue.info().pending.len(), 0);

        // The agent learns of the cancellation through extend.
        assert!(matches!(fx.gateway.extend(running).await, Err(Error::NotFound(_))));

        // Whatever exit code it reports, the job is recorded killed.
        fx.gateway.done(running, exited(0)).await.unwrap();
        let job = JobStore::get(&*fx.memory, running).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Killed);
        assert_eq!(fx.build().await.status, Status::Killed);
    }

    #[tokio::test]
    async fn test_cancel_finished_build_conflicts() {
        let fx = fixture(1).await;
        fx.gateway.init(fx.jobs[0].id, JobState::default(), None).await.unwrap();
        fx.gateway.done(fx.jobs[0].id, exited(0)).await.unwrap();

        let err = fx.gateway.cancel_build(fx.build.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture(2).await;
        let first = fx.gateway.cancel_build(fx.build.id).await.unwrap();
        assert_eq!(first.status, Status::Killed);
        let second = fx.gateway.cancel_build(fx.build.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_update_tracks_child_processes() {
        let fx = fixture(1).await;
        let id = fx.jobs[0].id;
        fx.gateway.init(id, JobState::default(), None).await.unwrap();

        let started = JobState {
            proc: "test".into(),
            started: Some(Utc::now()),
            ..Default::default()
        };
        fx.gateway.update(id, started).await.unwrap();
        let finished = JobState {
            proc: "lint".into(),
            exited: true,
            exit_code: 1,
            ..Default::default()
        };
        fx.gateway.update(id, finished).await.unwrap();
        fx.gateway
            .update(id, JobState { proc: "deploy".into(), ..Default::default() })
            .await
            .unwrap();

        let jobs = JobStore::list_by_build(&*fx.memory, fx.build.id).await.unwrap();
        assert_eq!(jobs.len(), 4);
        let child = |name: &str| jobs.iter().find(|j| j.name == name).unwrap().clone();
        assert_eq!(child("test").status, Status::Running);
        assert_eq!(child("test").parent, Some(id));
        assert_eq!(child("lint").status, Status::Failure);

        // Children do not drive the build status.
        assert_eq!(fx.build().await.status, Status::Running);

        fx.gateway.done(id, exited(0)).await.unwrap();
        let jobs = JobStore::list_by_build(&*fx.memory, fx.build.id).await.unwrap();
        let child = |name: &str| jobs.iter().find(|j| j.name == name).unwrap().clone();
        assert_eq!(child("test").status, Status::Success);
        assert_eq!(child("lint").status, Status::Failure);
        assert_eq!(child("deploy").status, Status::Skipped);
        assert_eq!(fx.build().await.status, Status::Success);
    }

    #[tokio::test]
    async fn test_next_skips_finished_jobs() {
        let fx = fixture(2).await;
        let first = fx.jobs[0].id;
        fx.gateway.init(first, JobState::default(), None).await.unwrap();
        // Finished out of band while its task was still queued.
        let mut job = fx.job(0).await;
        job.status = Status::Success;
        JobStore::update(&*fx.memory, &job).await.unwrap();

        let pipeline = fx.gateway.next(&linux(), &CancellationToken::new()).await.unwrap();
        assert_eq!(pipeline.id, fx.jobs[1].id);
        assert!(!fx.queue.contains(&first.to_string()));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let fx = fixture(1).await;
        let missing = JobId::new();
        assert!(matches!(fx.gateway.extend(missing).await, Err(Error::NotFound(_))));
        assert!(matches!(
            fx.gateway.init(missing, JobState::default(), None).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(fx.gateway.done(missing, exited(0)).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_done() {
        let (stores, memory, flaky) = flaky_stores(0);
        let fx = fixture_with(stores, memory, 1).await;
        let id = fx.jobs[0].id;
        fx.gateway.init(id, JobState::default(), None).await.unwrap();

        flaky.failures.store(1, Ordering::SeqCst);
        fx.gateway.done(id, exited(0)).await.unwrap();
        assert!(!fx.queue.contains(&id.to_string()));
        assert_eq!(fx.retrier.pending_count(), 1);
        // The store still has the old state; the build status was written.
        assert_eq!(fx.job(0).await.status, Status::Running);
        assert_eq!(fx.build().await.status, Status::Success);

        // A repeated done sees the pending state and changes nothing.
        fx.gateway.done(id, exited(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.retrier.flush().await, 1);
        assert_eq!(fx.job(0).await.status, Status::Success);
    }

    #[tokio::test]
    async fn test_unreadable_store_defers_done() {
        let (stores, memory, flaky) = flaky_stores(0);
        let fx = fixture_with(stores, memory, 1).await;
        let mut events = fx.subscribe();
        let pipeline = fx.gateway.next(&linux(), &CancellationToken::new()).await.unwrap();
        fx.gateway.init(pipeline.id, JobState::default(), None).await.unwrap();
        assert_eq!(next_kind(&mut events).await, EventKind::Started);

        flaky.read_failures.store(1, Ordering::SeqCst);
        fx.gateway.done(pipeline.id, exited(0)).await.unwrap();
        assert!(!fx.queue.contains(&pipeline.id.to_string()));
        assert_eq!(fx.retrier.deferred_count(), 1);
        assert_eq!(fx.job(0).await.status, Status::Running);

        // Store reads recover before the first replay is due.
        assert_eq!(fx.gateway.flush_deferred().await, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.gateway.flush_deferred().await, 1);
        assert_eq!(fx.retrier.deferred_count(), 0);

        assert_eq!(next_kind(&mut events).await, EventKind::Finished);
        assert_eq!(fx.job(0).await.status, Status::Success);
        assert_eq!(fx.build().await.status, Status::Success);
    }

    #[tokio::test]
    async fn test_deferred_done_retries_while_store_is_down() {
        let (stores, memory, flaky) = flaky_stores(0);
        let fx = fixture_with(stores, memory, 1).await;
        let id = fx.jobs[0].id;
        fx.gateway.init(id, JobState::default(), None).await.unwrap();

        flaky.read_failures.store(2, Ordering::SeqCst);
        fx.gateway.done(id, exited(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.gateway.flush_deferred().await, 0);
        assert_eq!(fx.retrier.deferred_count(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.gateway.flush_deferred().await, 1);
        assert_eq!(fx.job(0).await.status, Status::Failure);
        assert_eq!(fx.build().await.status, Status::Failure);
    }

    #[tokio::test]
    async fn test_log_is_stored_and_streamed() {
        let fx = fixture(1).await;
        let id = fx.jobs[0].id;
        let mut logs = fx.bus.subscribe(&log_topic(id), LabelFilter::any());

        let line = LogLine {
            job_id: id,
            proc: "test".into(),
            pos: 0,
            time: 1,
            out: "ok\n".into(),
        };
        fx.gateway.log(id, line.clone()).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), logs.stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message.payload, Payload::Log(ref l) if l.out == "ok\n"));
        let stored = cinder_core::ports::LogStore::read(&*fx.memory, id).await.unwrap();
        assert_eq!(stored, vec![line]);
    }

    #[tokio::test]
    async fn test_upload_requires_known_job() {
        let fx = fixture(1).await;
        let file = File {
            name: "coverage.xml".into(),
            mime: "application/xml".into(),
            data: b"<coverage/>".to_vec(),
        };
        fx.gateway.upload(fx.jobs[0].id, file.clone()).await.unwrap();
        assert_eq!(
            fx.memory.file_data(fx.jobs[0].id, "coverage.xml"),
            Some(b"<coverage/>".to_vec())
        );
        assert!(matches!(
            fx.gateway.upload(JobId::new(), file).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_returns_after_done() {
        let fx = Arc::new(fixture(1).await);
        let id = fx.jobs[0].id;
        let waiter = {
            let fx = fx.clone();
            tokio::spawn(async move { fx.gateway.wait(id, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        fx.gateway.done(id, exited(0)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
