//! Storage and source-control adapters for Cinder CI.
//!
//! [`MemoryStore`] backs tests and single-node deployments, [`PgStore`] keeps
//! records in PostgreSQL. Both implement every store port in `cinder_core::ports`.

pub mod memory;
pub mod postgres;
pub mod remote;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use remote::{DirectoryRemote, StaticRemote};
