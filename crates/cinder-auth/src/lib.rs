//! Credentials for Cinder CI.
//!
//! - Repository tokens (HS256, keyed by the repo hash) authorize hooks and
//!   event-stream access.
//! - Shared secrets authorize agents and administrators.
//! - Config signatures mark a pipeline file as approved by a repo admin.

pub mod secret;
pub mod signature;
pub mod token;

pub use secret::{SharedSecret, generate_hash};
pub use signature::{SignatureStatus, sign_config, verify_config};
pub use token::{TokenError, TokenKind, TokenClaims, peek_subject, sign_token, verify_token};
