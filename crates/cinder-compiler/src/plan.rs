//! Execution plan handed to agents inside a task payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub platform: String,
    pub workspace: WorkspacePlan,
    /// Shared by every container in the job.
    pub environment: BTreeMap<String, String>,
    pub services: Vec<StepPlan>,
    pub steps: Vec<StepPlan>,
    #[serde(default)]
    pub secrets: Vec<PlanSecret>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspacePlan {
    pub base: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub pull: bool,
}

/// Secret value shipped with the plan so the agent can mask it in output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSecret {
    pub name: String,
    pub value: String,
    pub mask: bool,
}
