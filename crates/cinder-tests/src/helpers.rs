//! Assertion helpers shared by the integration tests.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use cinder_core::build::{Job, Pipeline};
use cinder_core::events::{Event, Payload};
use cinder_core::ports::{JobStore, Subscription};
use cinder_core::{BuildId, Error, JobId, Result};
use cinder_scheduler::{Gateway, TaskFilter};
use cinder_store::MemoryStore;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

/// Next build event on a subscription; log payloads are skipped.
pub async fn next_event(sub: &mut Subscription) -> Event {
    loop {
        let message = tokio::time::timeout(WAIT, sub.stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended");
        if let Payload::Build(event) = message.payload {
            return *event;
        }
    }
}

/// Lease the next matching job, failing the test if none shows up.
///
/// Trigger dispatch pushes tasks from a spawned task, so the wait is bounded
/// rather than immediate.
pub async fn lease(gateway: &Gateway, filter: &TaskFilter) -> Pipeline {
    let cancel = CancellationToken::new();
    tokio::time::timeout(WAIT, gateway.next(filter, &cancel))
        .await
        .expect("timed out waiting for a task")
        .expect("next failed")
}

/// Poll until `pred` holds, for state written by spawned tasks.
pub async fn eventually<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not json")
}

/// Job store whose updates fail a fixed number of times before succeeding.
pub struct FlakyJobStore {
    pub inner: Arc<MemoryStore>,
    failures: AtomicU32,
}

impl FlakyJobStore {
    pub fn new(inner: Arc<MemoryStore>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn fail(&self) -> Result<()> {
        let taken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(Error::TransientStore("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.fail()?;
        JobStore::create(&*self.inner, job).await
    }

    async fn create_batch(&self, jobs: &[Job]) -> Result<()> {
        JobStore::create_batch(&*self.inner, jobs).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        JobStore::get(&*self.inner, id).await
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
        JobStore::list_by_build(&*self.inner, build_id).await
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.fail()?;
        JobStore::update(&*self.inner, job).await
    }
}
