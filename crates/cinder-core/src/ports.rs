//! Port traits (hexagonal architecture).
//!
//! The config store, the source-control remote, the log store and the event bus
//! are external collaborators. The engine only talks to them through these traits.

use crate::build::{Build, File, FileMeta, Job, LogLine};
use crate::events::{LabelFilter, Message};
use crate::ids::*;
use crate::repo::Repo;
use crate::secret::Secret;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of messages delivered to one subscriber.
pub type EventStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// A live subscription. Dropping the stream ends delivery; `unsubscribe` also
/// removes the registration eagerly.
pub struct Subscription {
    pub id: SubscriptionId,
    pub stream: EventStream,
}

/// Topic-based publish/subscribe.
///
/// Publishing is best-effort and never fails the caller: slow subscribers lose
/// messages instead of blocking the publisher.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, message: Message);

    fn subscribe(&self, topic: &str, filter: LabelFilter) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn create(&self, repo: &Repo) -> Result<()>;

    async fn get(&self, id: RepoId) -> Result<Option<Repo>>;

    /// Look up by `owner/name`.
    async fn find_by_name(&self, full_name: &str) -> Result<Option<Repo>>;

    async fn update(&self, repo: &Repo) -> Result<()>;

    async fn list(&self) -> Result<Vec<Repo>>;
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Reserve the next build number for a repository. Numbers are never reused,
    /// so a trigger that fails after reserving leaves a gap.
    async fn reserve_number(&self, repo_id: RepoId) -> Result<u64>;

    async fn create(&self, build: &Build) -> Result<()>;

    async fn get(&self, id: BuildId) -> Result<Option<Build>>;

    async fn find_by_number(&self, repo_id: RepoId, number: u64) -> Result<Option<Build>>;

    /// Most recent build on `branch`, used as the previous-build reference.
    async fn last_on_branch(&self, repo_id: RepoId, branch: &str) -> Result<Option<Build>>;

    /// Newest first.
    async fn list(&self, repo_id: RepoId, limit: usize) -> Result<Vec<Build>>;

    async fn update(&self, build: &Build) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn create_batch(&self, jobs: &[Job]) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// All jobs of a build, including child processes, ordered by number.
    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>>;

    async fn update(&self, job: &Job) -> Result<()>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn list(&self, repo_id: RepoId) -> Result<Vec<Secret>>;

    /// Insert or replace by name.
    async fn upsert(&self, secret: &Secret) -> Result<()>;

    async fn delete(&self, repo_id: RepoId, name: &str) -> Result<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, job_id: JobId, line: &LogLine) -> Result<()>;

    async fn read(&self, job_id: JobId) -> Result<Vec<LogLine>>;

    async fn upload(&self, job_id: JobId, file: File) -> Result<()>;

    async fn files(&self, job_id: JobId) -> Result<Vec<FileMeta>>;
}

/// Pipeline file fetched from source control, with an optional detached signature.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub data: String,
    pub signature: Option<String>,
}

/// Source-control integration: fetch the pipeline file and post commit status.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn fetch_config(&self, repo: &Repo, build: &Build) -> Result<ConfigFile>;

    async fn set_status(&self, repo: &Repo, build: &Build, link: &str) -> Result<()>;
}

/// The store ports bundled for injection.
#[derive(Clone)]
pub struct Stores {
    pub repos: Arc<dyn RepoStore>,
    pub builds: Arc<dyn BuildStore>,
    pub jobs: Arc<dyn JobStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub logs: Arc<dyn LogStore>,
}

impl Stores {
    /// Use one adapter for every store port.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: RepoStore + BuildStore + JobStore + SecretStore + LogStore + 'static,
    {
        Self {
            repos: store.clone(),
            builds: store.clone(),
            jobs: store.clone(),
            secrets: store.clone(),
            logs: store,
        }
    }
}
