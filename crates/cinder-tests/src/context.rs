//! Test context providing the fully wired engine.

use axum::Router;
use cinder_api::{AppState, create_router};
use cinder_auth::SharedSecret;
use cinder_bus::InMemoryEventBus;
use cinder_compiler::Compiler;
use cinder_core::ports::{RepoStore, Stores};
use cinder_core::repo::{Repo, RepoPolicy};
use cinder_scheduler::{BuildLocks, Gateway, QueueConfig, RetryConfig, StoreRetrier, TaskQueue, TriggerHandler};
use cinder_store::{MemoryStore, StaticRemote};
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_SECRET: &str = "agent-secret";
pub const ADMIN_SECRET: &str = "admin-secret";

pub struct TestContext {
    pub memory: Arc<MemoryStore>,
    pub stores: Stores,
    pub remote: Arc<StaticRemote>,
    pub bus: Arc<InMemoryEventBus>,
    pub queue: Arc<TaskQueue>,
    pub retrier: Arc<StoreRetrier>,
    pub gateway: Arc<Gateway>,
    pub triggers: Arc<TriggerHandler>,
    pub state: Arc<AppState>,
}

impl TestContext {
    pub fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::with_stores(memory.clone(), Stores::from_shared(memory))
    }

    /// Wire the engine over `stores`; `memory` is what the assertions read.
    pub fn with_stores(memory: Arc<MemoryStore>, stores: Stores) -> Self {
        crate::init_test_logging();

        let remote = Arc::new(StaticRemote::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(TaskQueue::new(
            QueueConfig::default().with_reap_interval(Duration::from_millis(50)),
        ));
        let retrier = Arc::new(StoreRetrier::new(
            stores.clone(),
            Arc::new(BuildLocks::new()),
            RetryConfig::default().with_delay(Duration::from_millis(10)),
        ));
        let gateway = Arc::new(
            Gateway::new(queue.clone(), stores.clone(), bus.clone(), retrier.clone())
                .with_remote(remote.clone())
                .with_link("http://ci.example.com"),
        );
        let triggers = Arc::new(TriggerHandler::new(
            stores.clone(),
            remote.clone(),
            Arc::new(Compiler::default()),
            queue.clone(),
            bus.clone(),
        ));
        let state = Arc::new(
            AppState::new(
                stores.clone(),
                gateway.clone(),
                triggers.clone(),
                bus.clone(),
                SharedSecret::new(AGENT_SECRET),
                SharedSecret::new(ADMIN_SECRET),
            )
            .with_poll_timeout(Duration::from_millis(200)),
        );

        Self {
            memory,
            stores,
            remote,
            bus,
            queue,
            retrier,
            gateway,
            triggers,
            state,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Register a repository and serve `config` as its pipeline file.
    pub async fn register_repo(&self, full_name: &str, config: &str) -> Repo {
        self.register_repo_with(full_name, config, false, RepoPolicy::default())
            .await
    }

    pub async fn register_repo_with(
        &self,
        full_name: &str,
        config: &str,
        private: bool,
        policy: RepoPolicy,
    ) -> Repo {
        let (owner, name) = full_name
            .split_once('/')
            .unwrap_or_else(|| panic!("repo name must be owner/name: {}", full_name));
        let repo = Repo::new(owner, name, format!("hash-of-{}", full_name))
            .with_private(private)
            .with_policy(policy);
        RepoStore::create(&*self.memory, &repo)
            .await
            .expect("failed to create repo");
        self.remote.set_config(full_name, config, None);
        repo
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
