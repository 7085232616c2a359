//! Integration test infrastructure for Cinder CI.
//!
//! [`TestContext`] wires the whole engine over in-memory adapters: the
//! memory store, a static remote and the in-process bus.
//!
//! ```ignore
//! use cinder_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new();
//!     let repo = ctx.register_repo("octocat/hello-world", SIMPLE).await;
//!     // Use ctx.triggers, ctx.gateway, ctx.router(), etc.
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,cinder_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
