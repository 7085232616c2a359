//! Repository records and trigger policy.

use crate::build::BuildEvent;
use crate::ids::RepoId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub private: bool,
    /// Signing key for hook tokens and config signatures. Never serialized outward.
    #[serde(default, skip_serializing)]
    pub hash: String,
    #[serde(default)]
    pub policy: RepoPolicy,
    pub created_at: DateTime<Utc>,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, hash: impl Into<String>) -> Self {
        let owner = owner.into();
        let name = name.into();
        Self {
            id: RepoId::new(),
            full_name: format!("{}/{}", owner, name),
            owner,
            name,
            link: None,
            private: false,
            hash: hash.into(),
            policy: RepoPolicy::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_policy(mut self, policy: RepoPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPolicy {
    #[serde(default)]
    pub trusted: bool,
    #[serde(default = "default_true")]
    pub allow_push: bool,
    #[serde(default = "default_true")]
    pub allow_pull: bool,
    #[serde(default = "default_true")]
    pub allow_tag: bool,
    #[serde(default)]
    pub allow_deploy: bool,
    /// Per-job timeout handed to agents.
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u64,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

impl Default for RepoPolicy {
    fn default() -> Self {
        Self {
            trusted: false,
            allow_push: true,
            allow_pull: true,
            allow_tag: true,
            allow_deploy: false,
            timeout_minutes: default_timeout(),
        }
    }
}

impl RepoPolicy {
    pub fn allows(&self, event: BuildEvent) -> bool {
        match event {
            BuildEvent::Push => self.allow_push,
            BuildEvent::Pull => self.allow_pull,
            BuildEvent::Tag => self.allow_tag,
            BuildEvent::Deploy => self.allow_deploy,
        }
    }
}

/// Partial update to a repository's policy and visibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoPatch {
    pub private: Option<bool>,
    pub trusted: Option<bool>,
    pub allow_push: Option<bool>,
    pub allow_pull: Option<bool>,
    pub allow_tag: Option<bool>,
    pub allow_deploy: Option<bool>,
    pub timeout_minutes: Option<u64>,
}

impl RepoPatch {
    pub fn apply(&self, repo: &mut Repo) {
        if let Some(v) = self.private {
            repo.private = v;
        }
        let policy = &mut repo.policy;
        if let Some(v) = self.trusted {
            policy.trusted = v;
        }
        if let Some(v) = self.allow_push {
            policy.allow_push = v;
        }
        if let Some(v) = self.allow_pull {
            policy.allow_pull = v;
        }
        if let Some(v) = self.allow_tag {
            policy.allow_tag = v;
        }
        if let Some(v) = self.allow_deploy {
            policy.allow_deploy = v;
        }
        if let Some(v) = self.timeout_minutes {
            policy.timeout_minutes = v;
        }
    }
}
