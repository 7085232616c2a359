//! Event envelopes published on the bus.

use crate::build::{Build, Job, LogLine};
use crate::ids::JobId;
use crate::repo::Repo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Topic carrying build lifecycle events.
pub const EVENTS_TOPIC: &str = "topic/events";

pub const LABEL_REPO: &str = "repo";
pub const LABEL_PRIVATE: &str = "private";

/// Topic carrying log lines for one job.
pub fn log_topic(job: JobId) -> String {
    format!("logs/{}", job)
}

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueued,
    Started,
    Updated,
    Finished,
    Cancelled,
}

/// Build snapshot carried by an event: the build plus its jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    #[serde(flatten)]
    pub build: Build,
    pub jobs: Vec<Job>,
}

/// `{type, repo, build}` envelope delivered to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub repo: Repo,
    pub build: BuildSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Build(Box<Event>),
    Log(LogLine),
}

/// A published message: routing labels plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub labels: Labels,
    pub payload: Payload,
}

impl Message {
    /// Build lifecycle message labelled with the repo name and its visibility.
    pub fn build_event(kind: EventKind, repo: &Repo, build: &Build, jobs: Vec<Job>) -> Self {
        let mut labels = Labels::new();
        labels.insert(LABEL_REPO.to_string(), repo.full_name.clone());
        labels.insert(LABEL_PRIVATE.to_string(), repo.private.to_string());
        Self {
            labels,
            payload: Payload::Build(Box::new(Event {
                kind,
                repo: repo.clone(),
                build: BuildSnapshot {
                    build: build.clone(),
                    jobs,
                },
            })),
        }
    }

    pub fn log(line: LogLine) -> Self {
        Self {
            labels: Labels::new(),
            payload: Payload::Log(line),
        }
    }
}

/// Subscriber-side filter. A message matches when it carries every filter label
/// with an equal value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter(Labels);

impl LabelFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Only events from public repositories.
    pub fn public() -> Self {
        Self::any().with(LABEL_PRIVATE, "false")
    }

    pub fn repo(full_name: impl Into<String>) -> Self {
        Self::any().with(LABEL_REPO, full_name)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildEvent, Commit};

    fn sample(private: bool) -> Message {
        let repo = Repo::new("octocat", "hello-world", "h").with_private(private);
        let build = Build::new(repo.id, BuildEvent::Push, Commit::default());
        Message::build_event(EventKind::Enqueued, &repo, &build, vec![])
    }

    #[test]
    fn test_public_filter_rejects_private() {
        let filter = LabelFilter::public();
        assert!(filter.matches(&sample(false).labels));
        assert!(!filter.matches(&sample(true).labels));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(LabelFilter::any().matches(&sample(true).labels));
        assert!(LabelFilter::any().matches(&Labels::new()));
    }

    #[test]
    fn test_missing_label_does_not_match() {
        let filter = LabelFilter::repo("octocat/hello-world");
        assert!(!filter.matches(&Labels::new()));
        assert!(filter.matches(&sample(true).labels));
    }

    #[test]
    fn test_event_envelope_shape() {
        let Payload::Build(event) = sample(false).payload else {
            panic!("expected build payload");
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "enqueued");
        assert_eq!(json["repo"]["full_name"], "octocat/hello-world");
        assert_eq!(json["build"]["status"], "pending");
        assert!(json["build"]["jobs"].is_array());
    }
}
