//! Build orchestration for Cinder CI: the task queue, the agent RPC gateway
//! and the trigger handler that feeds them.

pub mod gateway;
pub mod locks;
pub mod queue;
pub mod retry;
pub mod status;
pub mod triggers;

pub use gateway::Gateway;
pub use locks::BuildLocks;
pub use queue::{QueueConfig, QueueInfo, Task, TaskFilter, TaskQueue};
pub use retry::{RetryConfig, StoreRetrier};
pub use status::reduce;
pub use triggers::{Hook, TriggerHandler, TriggerOutcome};
