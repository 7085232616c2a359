//! Application state shared across handlers.

use cinder_auth::SharedSecret;
use cinder_core::ports::{EventBus, Stores};
use cinder_scheduler::{Gateway, TaskQueue, TriggerHandler};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub gateway: Arc<Gateway>,
    pub triggers: Arc<TriggerHandler>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<dyn EventBus>,
    /// Credential shared by all agents.
    pub agent_secret: SharedSecret,
    /// Credential for repository and secret administration.
    pub admin_secret: SharedSecret,
    /// Upper bound on one `next` long poll before the agent is told to retry.
    pub poll_timeout: Duration,
}

impl AppState {
    pub fn new(
        stores: Stores,
        gateway: Arc<Gateway>,
        triggers: Arc<TriggerHandler>,
        bus: Arc<dyn EventBus>,
        agent_secret: SharedSecret,
        admin_secret: SharedSecret,
    ) -> Self {
        Self {
            queue: gateway.queue().clone(),
            stores,
            gateway,
            triggers,
            bus,
            agent_secret,
            admin_secret,
            poll_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
