//! Wiring of stores, engine and HTTP surface.

use cinder_api::{AppState, create_router};
use cinder_auth::SharedSecret;
use cinder_bus::InMemoryEventBus;
use cinder_compiler::Compiler;
use cinder_core::ports::{EventBus, Remote, Stores};
use cinder_scheduler::{BuildLocks, Gateway, StoreRetrier, TaskQueue, TriggerHandler};
use cinder_store::{DirectoryRemote, MemoryStore, PgStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;

pub struct App {
    pub router: axum::Router,
    pub queue: Arc<TaskQueue>,
    pub gateway: Arc<Gateway>,
}

impl App {
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let stores = match &config.store.database_url {
            Some(url) => {
                let store = PgStore::connect(url, config.store.max_connections).await?;
                store.migrate().await?;
                info!("using postgres store");
                Stores::from_shared(Arc::new(store))
            }
            None => {
                info!("using in-memory store");
                Stores::from_shared(Arc::new(MemoryStore::new()))
            }
        };

        let remote: Arc<dyn Remote> = Arc::new(
            DirectoryRemote::new(config.remote.config_dir.clone())
                .with_config_file(config.remote.config_file.clone())
                .with_signature_file(config.remote.signature_file.clone()),
        );
        Ok(Self::with_parts(config, stores, remote))
    }

    pub fn with_parts(config: &ServerConfig, stores: Stores, remote: Arc<dyn Remote>) -> Self {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::with_config(config.bus_config()));
        let queue = Arc::new(TaskQueue::new(config.queue_config()));
        let retrier = Arc::new(StoreRetrier::new(
            stores.clone(),
            Arc::new(BuildLocks::new()),
            config.retry_config(),
        ));

        let gateway = Arc::new(
            Gateway::new(queue.clone(), stores.clone(), bus.clone(), retrier)
                .with_remote(remote.clone())
                .with_link(config.server.link.clone()),
        );
        let compiler = Arc::new(Compiler::new(config.compiler_options()));
        let triggers = TriggerHandler::new(stores.clone(), remote, compiler, queue.clone(), bus.clone());

        let state = AppState::new(
            stores,
            gateway.clone(),
            Arc::new(triggers),
            bus,
            SharedSecret::new(&config.agent.secret),
            SharedSecret::new(&config.admin.secret),
        )
        .with_poll_timeout(config.poll_timeout());

        Self {
            router: create_router(Arc::new(state)),
            queue,
            gateway,
        }
    }

    /// Start the lease reaper and the store retrier.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.queue.clone().run_reaper(cancel.clone())),
            tokio::spawn(self.gateway.clone().run_retries(cancel.clone())),
        ]
    }
}
