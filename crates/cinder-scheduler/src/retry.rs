//! Out-of-band retry of store writes that failed on the agent path.
//!
//! Agent acknowledgements never fail because the store is unavailable. The
//! gateway records the state it meant to write here and carries on; the
//! retrier keeps the latest state per record and writes it back with
//! exponential backoff. Until then the gateway reads through the pending
//! writes, so its view stays ahead of the store.
//!
//! When the store cannot even be read after a task was acknowledged, the
//! whole `done` transition is deferred here and replayed by the gateway.

use crate::locks::BuildLocks;
use cinder_core::build::{Build, Job, JobState};
use cinder_core::ports::Stores;
use cinder_core::{BuildId, JobId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a write is abandoned.
    pub attempts: u32,
    /// Delay before the first retry; doubled after every failed attempt.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(1 << attempt.min(16))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKey {
    Build(BuildId),
    Job(JobId),
}

#[derive(Debug, Clone)]
pub enum PendingWrite {
    Build(Build),
    /// `create` is set when the job has never reached the store.
    Job { job: Job, create: bool },
}

impl PendingWrite {
    pub fn key(&self) -> WriteKey {
        match self {
            PendingWrite::Build(build) => WriteKey::Build(build.id),
            PendingWrite::Job { job, .. } => WriteKey::Job(job.id),
        }
    }

    fn build_id(&self) -> BuildId {
        match self {
            PendingWrite::Build(build) => build.id,
            PendingWrite::Job { job, .. } => job.build_id,
        }
    }
}

struct Entry {
    write: PendingWrite,
    attempts: u32,
    next_due: Instant,
}

/// A `done` report whose transition could not be applied yet.
#[derive(Debug, Clone)]
pub struct DeferredDone {
    pub id: JobId,
    pub state: JobState,
    pub attempts: u32,
    next_due: Instant,
}

#[derive(Debug, Default)]
pub struct RetryMetrics {
    pub recorded: AtomicU64,
    pub written: AtomicU64,
    pub abandoned: AtomicU64,
}

impl RetryMetrics {
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrySnapshot {
    pub recorded: u64,
    pub written: u64,
    pub abandoned: u64,
}

pub struct StoreRetrier {
    config: RetryConfig,
    stores: Stores,
    locks: Arc<BuildLocks>,
    pending: Mutex<HashMap<WriteKey, Entry>>,
    deferred: Mutex<HashMap<JobId, DeferredDone>>,
    metrics: RetryMetrics,
}

impl StoreRetrier {
    pub fn new(stores: Stores, locks: Arc<BuildLocks>, config: RetryConfig) -> Self {
        Self {
            config,
            stores,
            locks,
            pending: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            metrics: RetryMetrics::default(),
        }
    }

    pub fn locks(&self) -> &Arc<BuildLocks> {
        &self.locks
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RetryMetrics {
        &self.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remember a failed write. A newer state for the same record replaces the
    /// older one and resets its attempt count.
    pub fn record_failure(&self, write: PendingWrite) {
        let key = write.key();
        let mut pending = self.pending.lock();
        let create = match (&write, pending.get(&key)) {
            (PendingWrite::Job { create, .. }, Some(Entry { write: PendingWrite::Job { create: prev, .. }, .. })) => {
                *create || *prev
            }
            (PendingWrite::Job { create, .. }, _) => *create,
            _ => false,
        };
        let write = match write {
            PendingWrite::Job { job, .. } => PendingWrite::Job { job, create },
            other => other,
        };
        pending.insert(
            key,
            Entry {
                write,
                attempts: 0,
                next_due: Instant::now() + self.config.delay,
            },
        );
        self.metrics.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// A direct write for this record succeeded; nothing left to retry.
    pub fn record_success(&self, key: WriteKey) {
        self.pending.lock().remove(&key);
    }

    /// Whether the record's last write has never reached the store.
    pub fn needs_create(&self, id: JobId) -> bool {
        matches!(
            self.pending.lock().get(&WriteKey::Job(id)),
            Some(Entry { write: PendingWrite::Job { create: true, .. }, .. })
        )
    }

    pub fn pending_build(&self, id: BuildId) -> Option<Build> {
        match self.pending.lock().get(&WriteKey::Build(id)) {
            Some(Entry { write: PendingWrite::Build(build), .. }) => Some(build.clone()),
            _ => None,
        }
    }

    pub fn pending_job(&self, id: JobId) -> Option<Job> {
        match self.pending.lock().get(&WriteKey::Job(id)) {
            Some(Entry { write: PendingWrite::Job { job, .. }, .. }) => Some(job.clone()),
            _ => None,
        }
    }

    /// Replace stored jobs of `build_id` with their pending state and add pending
    /// jobs the store has not seen yet.
    pub fn overlay_jobs(&self, build_id: BuildId, mut jobs: Vec<Job>) -> Vec<Job> {
        let pending = self.pending.lock();
        for job in jobs.iter_mut() {
            if let Some(Entry { write: PendingWrite::Job { job: newer, .. }, .. }) = pending.get(&WriteKey::Job(job.id)) {
                *job = newer.clone();
            }
        }
        for entry in pending.values() {
            if let PendingWrite::Job { job, create: true } = &entry.write {
                if job.build_id == build_id && !jobs.iter().any(|j| j.id == job.id) {
                    jobs.push(job.clone());
                }
            }
        }
        jobs.sort_by_key(|j| (j.number, j.parent.is_some(), j.id));
        jobs
    }

    /// Remember a `done` report to apply later. A newer report for the same job
    /// replaces the older one.
    pub fn defer_done(&self, id: JobId, state: JobState) {
        self.deferred.lock().insert(
            id,
            DeferredDone {
                id,
                state,
                attempts: 0,
                next_due: Instant::now() + self.config.delay,
            },
        );
        self.metrics.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Remove and return every deferred `done` that is due.
    pub fn take_due_done(&self) -> Vec<DeferredDone> {
        let now = Instant::now();
        let mut deferred = self.deferred.lock();
        let due: Vec<JobId> = deferred
            .values()
            .filter(|entry| entry.next_due <= now)
            .map(|entry| entry.id)
            .collect();
        due.iter().filter_map(|id| deferred.remove(id)).collect()
    }

    /// A deferred `done` was applied.
    pub fn done_applied(&self, id: JobId) {
        self.deferred.lock().remove(&id);
        self.metrics.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Put a deferred `done` back after another failed attempt, or give up on it.
    pub fn retry_done(&self, mut entry: DeferredDone) {
        entry.attempts += 1;
        if entry.attempts >= self.config.attempts {
            error!(job = %entry.id, attempts = entry.attempts, "giving up on deferred done");
            self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
            return;
        }
        entry.next_due = Instant::now() + self.config.backoff(entry.attempts);
        // A report that arrived meanwhile is newer.
        self.deferred.lock().entry(entry.id).or_insert(entry);
    }

    /// Attempt every write that is due. Returns how many reached the store.
    pub async fn flush(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(WriteKey, BuildId)> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, entry)| entry.next_due <= now)
            .map(|(key, entry)| (*key, entry.write.build_id()))
            .collect();

        let mut written = 0;
        for (key, build_id) in due {
            // Serialize with live transitions on the same build.
            let _guard = self.locks.acquire(build_id).await;
            let Some(mut entry) = self.pending.lock().remove(&key) else {
                continue;
            };

            match self.write(&entry.write).await {
                Ok(()) => {
                    debug!(?key, attempts = entry.attempts + 1, "pending write stored");
                    self.metrics.written.fetch_add(1, Ordering::Relaxed);
                    written += 1;
                }
                Err(err) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.attempts {
                        error!(?key, attempts = entry.attempts, error = %err, "giving up on store write");
                        self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                    } else {
                        warn!(?key, attempts = entry.attempts, error = %err, "store write failed, will retry");
                        entry.next_due = Instant::now() + self.config.backoff(entry.attempts);
                        self.pending.lock().insert(key, entry);
                    }
                }
            }
        }
        written
    }

    async fn write(&self, write: &PendingWrite) -> Result<()> {
        match write {
            PendingWrite::Build(build) => self.stores.builds.update(build).await,
            PendingWrite::Job { job, create: true } => self.stores.jobs.create(job).await,
            PendingWrite::Job { job, create: false } => self.stores.jobs.update(job).await,
        }
    }
}
