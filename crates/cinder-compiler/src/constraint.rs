//! Branch include/exclude filter.

use crate::yaml::scalar_to_string;
use glob::{MatchOptions, Pattern};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Glob include/exclude lists.
///
/// Written as a bare string (`branches: main`), a list, or a map with
/// `include` and `exclude` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraint {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Constraint {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Exclusion wins over inclusion. An empty include list includes everything.
    pub fn matches(&self, value: &str) -> bool {
        if self.exclude.iter().any(|p| glob_match(p, value)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| glob_match(p, value))
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(value, MATCH_OPTIONS),
        Err(_) => pattern == value,
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        fn patterns<E: serde::de::Error>(value: &Value) -> Result<Vec<String>, E> {
            match value {
                Value::Null => Ok(Vec::new()),
                Value::Sequence(items) => items
                    .iter()
                    .map(|v| scalar_to_string(v).ok_or_else(|| E::custom("branch patterns must be strings")))
                    .collect(),
                other => scalar_to_string(other)
                    .map(|s| vec![s])
                    .ok_or_else(|| E::custom("branch patterns must be strings")),
            }
        }

        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Mapping(map) => {
                for key in map.keys() {
                    if !matches!(key.as_str(), Some("include") | Some("exclude")) {
                        return Err(D::Error::custom("branches accepts only include and exclude"));
                    }
                }
                Ok(Constraint {
                    include: patterns(map.get("include").unwrap_or(&Value::Null))?,
                    exclude: patterns(map.get("exclude").unwrap_or(&Value::Null))?,
                })
            }
            other => Ok(Constraint {
                include: patterns(other)?,
                exclude: Vec::new(),
            }),
        }
    }
}
