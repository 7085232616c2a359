//! Pipeline document as written by users.

use crate::constraint::Constraint;
use cinder_core::{Error, Result};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// The sections read from the raw text, before any variable is substituted.
/// Everything else may hold `${VAR}` references in place of typed values, so it
/// is only parsed per axis as a [`Document`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub branches: Constraint,
    /// Left untyped here; see [`crate::matrix::Matrix::from_yaml`].
    #[serde(default)]
    pub matrix: Value,
    #[serde(default)]
    platform: Value,
}

impl Outline {
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(Error::Config("pipeline configuration is empty".into()));
        }
        let value: Value = serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        if !matches!(value, Value::Mapping(_)) {
            return Err(Error::Config("pipeline configuration must be a map".into()));
        }
        serde_yaml::from_value(value).map_err(|e| Error::Config(e.to_string()))
    }

    /// The declared platform, when it is a literal.
    pub fn platform(&self) -> Option<&str> {
        self.platform.as_str().filter(|p| !p.is_empty())
    }
}

/// A pipeline after substitution for one axis.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub workspace: Option<Workspace>,
    #[serde(default)]
    pub services: IndexMap<String, Container>,
    #[serde(default)]
    pub steps: IndexMap<String, Container>,
}

impl Document {
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(Error::Config("pipeline configuration is empty".into()));
        }
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Services first, then steps, in declaration order.
    pub fn containers(&self) -> impl Iterator<Item = (&String, &Container)> {
        self.services.iter().chain(self.steps.iter())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub image: String,
    #[serde(default, deserialize_with = "string_list")]
    pub commands: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub entrypoint: Vec<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub pull: bool,
    /// Names of repository secrets to expose as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Render a YAML scalar the way it was written. Collections have no string form.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

/// Accepts `{KEY: value}` or `["KEY=value"]`.
fn string_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(BTreeMap::new()),
        Value::Mapping(map) => map
            .iter()
            .map(|(k, v)| {
                let key = scalar_to_string(k).ok_or_else(|| D::Error::custom("keys must be scalars"))?;
                let value = scalar_to_string(v)
                    .ok_or_else(|| D::Error::custom(format!("value of {} must be a scalar", key)))?;
                Ok((key, value))
            })
            .collect(),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                let entry = scalar_to_string(item)
                    .ok_or_else(|| D::Error::custom("list entries must be KEY=value strings"))?;
                Ok(match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry, String::new()),
                })
            })
            .collect(),
        _ => Err(D::Error::custom("expected a map or a list")),
    }
}

/// Accepts a single string or a list of strings.
pub(crate) fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| scalar_to_string(item).ok_or_else(|| D::Error::custom("expected a string")))
            .collect(),
        other => scalar_to_string(&other)
            .map(|s| vec![s])
            .ok_or_else(|| D::Error::custom("expected a string or a list of strings")),
    }
}
