//! Cinder CI Core
//!
//! Domain types, port traits and error handling shared by every Cinder crate.
//! Adapters (stores, remotes, the event bus) implement the traits in [`ports`].

pub mod build;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod repo;
pub mod secret;

pub use error::{Error, Result};
pub use ids::*;
