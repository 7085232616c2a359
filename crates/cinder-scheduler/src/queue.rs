//! Leasable task queue.
//!
//! Pending tasks are kept in arrival order. `poll` leases the oldest task whose
//! labels the agent satisfies; a lease that is not extended in time puts the
//! task back in its original position.

use cinder_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue-level representation of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    /// Capabilities an agent must have: every label must be present with an equal value.
    pub labels: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Labels advertised by a polling agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub labels: BTreeMap<String, String>,
}

impl TaskFilter {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self { labels }
    }

    /// Agent capabilities must be a superset of the task's requirements.
    pub fn accepts(&self, task: &Task) -> bool {
        task.labels
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a lease lives without `extend`.
    pub lease_timeout: Duration,
    /// How often expired leases are swept back to pending.
    pub reap_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

/// Why a waited-on task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Done,
    Evicted,
}

struct Pending {
    seq: u64,
    task: Task,
    enqueued: Instant,
}

struct Lease {
    seq: u64,
    task: Task,
    enqueued: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    seq: u64,
    /// Pending tasks by arrival sequence.
    pending: BTreeMap<u64, Task>,
    pending_ids: HashMap<String, (u64, Instant)>,
    leased: HashMap<String, Lease>,
    waiters: HashMap<String, watch::Sender<Option<Exit>>>,
    stats: QueueStats,
}

impl State {
    fn contains(&self, id: &str) -> bool {
        self.pending_ids.contains_key(id) || self.leased.contains_key(id)
    }

    fn insert_pending(&mut self, entry: Pending) {
        self.pending_ids
            .insert(entry.task.id.clone(), (entry.seq, entry.enqueued));
        self.pending.insert(entry.seq, entry.task);
    }

    fn remove_pending(&mut self, id: &str) -> Option<Pending> {
        let (seq, enqueued) = self.pending_ids.remove(id)?;
        let task = self.pending.remove(&seq)?;
        Some(Pending { seq, task, enqueued })
    }

    fn finish(&mut self, id: &str, exit: Exit) {
        if let Some(tx) = self.waiters.remove(id) {
            let _ = tx.send(Some(exit));
        }
    }

    fn reap(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(lease) = self.leased.remove(id) {
                let err = Error::QueueTimeout(id.clone());
                warn!(error = %err, "requeueing task");
                self.insert_pending(Pending {
                    seq: lease.seq,
                    task: lease.task,
                    enqueued: lease.enqueued,
                });
                self.stats.requeued += 1;
            }
        }
        expired.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub leased: u64,
    pub completed: u64,
    pub evicted: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    /// Seconds since the task was first pushed.
    pub age_secs: u64,
    /// Seconds left on the lease, for leased tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub pending: Vec<TaskInfo>,
    pub running: Vec<TaskInfo>,
    pub stats: QueueStats,
}

/// In-memory task queue with leases.
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<State>,
    /// Woken whenever a task becomes pending.
    available: Notify,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            available: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a task. Pushing an id that is already queued or leased is a no-op.
    pub fn push(&self, task: Task) {
        {
            let mut state = self.state.lock();
            if state.contains(&task.id) {
                debug!(task = %task.id, "task already queued");
                return;
            }
            state.seq += 1;
            let seq = state.seq;
            debug!(task = %task.id, "task queued");
            state.insert_pending(Pending {
                seq,
                task,
                enqueued: Instant::now(),
            });
            state.stats.pushed += 1;
        }
        self.available.notify_waiters();
    }

    /// Lease the oldest task accepted by `filter`, waiting until one exists.
    ///
    /// Returns `Error::Cancelled` once `cancel` fires. Dropping the future also
    /// abandons the wait without side effects.
    pub async fn poll(&self, filter: &TaskFilter, cancel: &CancellationToken) -> Result<Task> {
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_lease(filter) {
                return Ok(task);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("poll cancelled".into()));
                }
                _ = tokio::time::sleep(self.config.reap_interval) => {}
            }
        }
    }

    /// Non-blocking variant of [`poll`](Self::poll).
    pub fn try_lease(&self, filter: &TaskFilter) -> Option<Task> {
        let now = Instant::now();
        let (task, requeued) = {
            let mut state = self.state.lock();
            let requeued = state.reap(now);
            let seq = state
                .pending
                .iter()
                .find(|(_, task)| filter.accepts(task))
                .map(|(seq, _)| *seq);
            let task = seq.and_then(|seq| {
                let id = state.pending.get(&seq)?.id.clone();
                let entry = state.remove_pending(&id)?;
                let task = entry.task.clone();
                state.leased.insert(
                    id,
                    Lease {
                        seq: entry.seq,
                        task: entry.task,
                        enqueued: entry.enqueued,
                        deadline: now + self.config.lease_timeout,
                    },
                );
                state.stats.leased += 1;
                Some(task)
            });
            (task, requeued)
        };

        if requeued > 0 {
            self.available.notify_waiters();
        }
        if let Some(task) = &task {
            debug!(task = %task.id, "task leased");
        }
        task
    }

    /// Reset the lease timer of a leased task.
    pub fn extend(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.leased.get_mut(id) {
            Some(lease) => {
                lease.deadline = Instant::now() + self.config.lease_timeout;
                Ok(())
            }
            None => Err(Error::not_found("task", id)),
        }
    }

    /// Remove a task permanently, whether pending or leased. Idempotent.
    pub fn done(&self, id: &str) {
        let mut state = self.state.lock();
        let removed = state.leased.remove(id).is_some() || state.remove_pending(id).is_some();
        if removed {
            state.stats.completed += 1;
            debug!(task = %id, "task done");
        }
        state.finish(id, Exit::Done);
    }

    /// Remove a task that has not been leased yet. Returns whether it was removed.
    pub fn evict(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.remove_pending(id).is_none() {
            return false;
        }
        state.stats.evicted += 1;
        state.finish(id, Exit::Evicted);
        debug!(task = %id, "task evicted");
        true
    }

    /// Block until the task is done. Returns immediately for unknown ids and
    /// fails with `Error::Cancelled` if the task is evicted or `cancel` fires.
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut rx = {
            let mut state = self.state.lock();
            if !state.contains(id) {
                return Ok(());
            }
            state
                .waiters
                .entry(id.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return match exit {
                    Exit::Done => Ok(()),
                    Exit::Evicted => Err(Error::Cancelled(format!("task {} was evicted", id))),
                };
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("wait cancelled".into()));
                }
            }
        }
    }

    /// Requeue every expired lease. Returns the number requeued.
    pub fn reap_expired(&self) -> usize {
        let requeued = self.state.lock().reap(Instant::now());
        if requeued > 0 {
            self.available.notify_waiters();
        }
        requeued
    }

    /// Sweep expired leases until `cancel` fires.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        info!(interval = ?self.config.reap_interval, "lease reaper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let requeued = self.reap_expired();
                    if requeued > 0 {
                        info!(requeued, "expired leases requeued");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("lease reaper stopped");
                    return;
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().contains(id)
    }

    pub fn is_leased(&self, id: &str) -> bool {
        self.state.lock().leased.contains_key(id)
    }

    pub fn info(&self) -> QueueInfo {
        let now = Instant::now();
        let state = self.state.lock();
        let pending = state
            .pending
            .values()
            .map(|task| TaskInfo {
                id: task.id.clone(),
                labels: task.labels.clone(),
                age_secs: state
                    .pending_ids
                    .get(&task.id)
                    .map_or(0, |(_, enqueued)| now.duration_since(*enqueued).as_secs()),
                lease_remaining_secs: None,
            })
            .collect();
        let mut running: Vec<(u64, TaskInfo)> = state
            .leased
            .values()
            .map(|lease| {
                (
                    lease.seq,
                    TaskInfo {
                        id: lease.task.id.clone(),
                        labels: lease.task.labels.clone(),
                        age_secs: now.duration_since(lease.enqueued).as_secs(),
                        lease_remaining_secs: Some(lease.deadline.saturating_duration_since(now).as_secs()),
                    },
                )
            })
            .collect();
        running.sort_by_key(|(seq, _)| *seq);

        QueueInfo {
            pending,
            running: running.into_iter().map(|(_, info)| info).collect(),
            stats: state.stats,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
