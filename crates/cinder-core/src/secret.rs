//! Repository secrets as consumed by the pipeline compiler.

use crate::build::BuildEvent;
use crate::ids::{RepoId, SecretId};
use serde::{Deserialize, Serialize};

/// Events a secret is exposed to when none are listed.
pub const DEFAULT_SECRET_EVENTS: [BuildEvent; 3] =
    [BuildEvent::Push, BuildEvent::Tag, BuildEvent::Deploy];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    pub repo_id: RepoId,
    pub name: String,
    #[serde(default, skip_serializing)]
    pub value: String,
    /// Image glob patterns; empty means every image.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub events: Vec<BuildEvent>,
    /// Expose to builds whose config signature was not verified.
    #[serde(default)]
    pub skip_verify: bool,
    /// Mask the value in job output.
    #[serde(default)]
    pub conceal: bool,
}

impl Secret {
    pub fn new(repo_id: RepoId, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: SecretId::new(),
            repo_id,
            name: name.into(),
            value: value.into(),
            images: Vec::new(),
            events: Vec::new(),
            skip_verify: false,
            conceal: false,
        }
    }

    pub fn with_events(mut self, events: Vec<BuildEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    pub fn match_event(&self, event: BuildEvent) -> bool {
        if self.events.is_empty() {
            return DEFAULT_SECRET_EVENTS.contains(&event);
        }
        self.events.contains(&event)
    }
}
