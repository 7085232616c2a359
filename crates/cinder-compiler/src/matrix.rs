//! Build matrix expansion.

use crate::yaml::scalar_to_string;
use cinder_core::build::Axis;
use cinder_core::{Error, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Upper bounds on matrix size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixLimits {
    pub max_axes: usize,
    pub max_variables: usize,
}

impl Default for MatrixLimits {
    fn default() -> Self {
        Self {
            max_axes: 25,
            max_variables: 10,
        }
    }
}

/// A parsed `matrix:` section.
///
/// Variables map a name to its candidate values. `include` lists explicit axes
/// and replaces the Cartesian product. `exclude` is either a map of value lists
/// or a list of such maps; every entry is expanded by product and an axis is
/// dropped when it contains all pairs of any expanded entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    pub variables: BTreeMap<String, Vec<String>>,
    pub include: Vec<Axis>,
    pub exclude: Vec<Axis>,
}

impl Matrix {
    pub fn from_yaml(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(map) => map,
            _ => return Err(Error::Config("matrix must be a map".into())),
        };

        let mut matrix = Self::default();
        for (key, value) in map {
            let key = key
                .as_str()
                .ok_or_else(|| Error::Config("matrix keys must be strings".into()))?;
            match key {
                "include" => {
                    let items = value
                        .as_sequence()
                        .ok_or_else(|| Error::Config("matrix include must be a list".into()))?;
                    for item in items {
                        matrix.include.extend(product_of_entry(item)?);
                    }
                }
                "exclude" => match value {
                    Value::Sequence(items) => {
                        for item in items {
                            matrix.exclude.extend(product_of_entry(item)?);
                        }
                    }
                    other => matrix.exclude.extend(product_of_entry(other)?),
                },
                name => {
                    matrix.variables.insert(name.to_string(), values_of(name, value)?);
                }
            }
        }
        // An empty entry would match every axis.
        matrix.exclude.retain(|entry| !entry.is_empty());
        Ok(matrix)
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.include.is_empty()
    }

    /// Expand into the ordered list of surviving axes.
    ///
    /// Variables are taken in name order and the first one varies slowest.
    /// Without variables or includes the result is a single empty axis.
    pub fn expand(&self, limits: MatrixLimits) -> Vec<Axis> {
        if !self.include.is_empty() {
            return self
                .include
                .iter()
                .filter(|axis| !self.is_excluded(axis))
                .take(limits.max_axes)
                .cloned()
                .collect();
        }

        if self.variables.is_empty() {
            return vec![Axis::new()];
        }

        if self.variables.len() > limits.max_variables {
            warn!(
                variables = self.variables.len(),
                max = limits.max_variables,
                "matrix has too many variables, truncating"
            );
        }
        let dims: Vec<(&String, &Vec<String>)> =
            self.variables.iter().take(limits.max_variables).collect();

        let mut axes = Vec::new();
        for axis in Product::new(&dims) {
            if self.is_excluded(&axis) {
                continue;
            }
            if axes.len() == limits.max_axes {
                warn!(max = limits.max_axes, "matrix exceeds axis limit, truncating");
                break;
            }
            axes.push(axis);
        }
        axes
    }

    fn is_excluded(&self, axis: &Axis) -> bool {
        self.exclude
            .iter()
            .any(|entry| entry.iter().all(|(k, v)| axis.get(k) == Some(v)))
    }
}

fn values_of(name: &str, value: &Value) -> Result<Vec<String>> {
    let invalid = || Error::Config(format!("matrix variable {} must be a scalar or a list of scalars", name));
    match value {
        Value::Sequence(items) => items.iter().map(|v| scalar_to_string(v).ok_or_else(invalid)).collect(),
        other => scalar_to_string(other).map(|s| vec![s]).ok_or_else(invalid),
    }
}

/// Expand one `{key: value | [values]}` entry into every axis it denotes.
fn product_of_entry(entry: &Value) -> Result<Vec<Axis>> {
    let map = entry
        .as_mapping()
        .ok_or_else(|| Error::Config("matrix include/exclude entries must be maps".into()))?;

    let mut dims = BTreeMap::new();
    for (key, value) in map {
        let key = scalar_to_string(key)
            .ok_or_else(|| Error::Config("matrix keys must be strings".into()))?;
        let values = values_of(&key, value)?;
        dims.insert(key, values);
    }
    let dims: Vec<(&String, &Vec<String>)> = dims.iter().collect();
    Ok(Product::new(&dims).collect())
}

/// Odometer over the Cartesian product of the given dimensions.
struct Product<'a> {
    dims: &'a [(&'a String, &'a Vec<String>)],
    indices: Vec<usize>,
    done: bool,
}

impl<'a> Product<'a> {
    fn new(dims: &'a [(&'a String, &'a Vec<String>)]) -> Self {
        Self {
            dims,
            indices: vec![0; dims.len()],
            done: dims.iter().any(|(_, values)| values.is_empty()),
        }
    }
}

impl Iterator for Product<'_> {
    type Item = Axis;

    fn next(&mut self) -> Option<Axis> {
        if self.done {
            return None;
        }

        let axis = self
            .dims
            .iter()
            .zip(&self.indices)
            .map(|((name, values), &i)| ((*name).clone(), values[i].clone()))
            .collect();

        // Advance the last dimension first.
        self.done = true;
        for pos in (0..self.indices.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < self.dims[pos].1.len() {
                self.done = false;
                break;
            }
            self.indices[pos] = 0;
        }

        Some(axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matrix(text: &str) -> Matrix {
        Matrix::from_yaml(&serde_yaml::from_str(text).unwrap()).unwrap()
    }

    fn axis(pairs: &[(&str, &str)]) -> Axis {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_no_matrix_yields_single_empty_axis() {
        let axes = Matrix::default().expand(MatrixLimits::default());
        assert_eq!(axes, vec![Axis::new()]);
    }

    #[test]
    fn test_empty_matrix_ignores_exclude() {
        let m = matrix("exclude: {os: [windows]}");
        assert_eq!(m.expand(MatrixLimits::default()), vec![Axis::new()]);
    }

    #[test]
    fn test_product_order() {
        let axes = matrix("{go: [1, 2], os: [linux, windows]}").expand(MatrixLimits::default());
        assert_eq!(
            axes,
            vec![
                axis(&[("go", "1"), ("os", "linux")]),
                axis(&[("go", "1"), ("os", "windows")]),
                axis(&[("go", "2"), ("os", "linux")]),
                axis(&[("go", "2"), ("os", "windows")]),
            ]
        );
    }

    #[test]
    fn test_exclude_map_of_lists() {
        let axes = matrix("{go: [1, 2], os: [linux, windows], exclude: {os: [windows]}}")
            .expand(MatrixLimits::default());
        assert_eq!(
            axes,
            vec![axis(&[("go", "1"), ("os", "linux")]), axis(&[("go", "2"), ("os", "linux")])]
        );
    }

    #[test]
    fn test_exclude_entries_are_and_within_or_across() {
        let m = matrix(
            r#"
go: [1, 2, 3]
os: [linux, windows]
exclude:
  - {go: 1, os: windows}
  - {go: 3}
"#,
        );
        let axes = m.expand(MatrixLimits::default());
        assert_eq!(axes.len(), 6 - 1 - 2);
        assert!(axes.contains(&axis(&[("go", "1"), ("os", "linux")])));
        assert!(!axes.contains(&axis(&[("go", "1"), ("os", "windows")])));
        assert!(axes.iter().all(|a| a["go"] != "3"));
    }

    #[test]
    fn test_exclude_on_unknown_key_excludes_nothing() {
        let axes = matrix("{go: [1, 2], exclude: {arch: arm64}}").expand(MatrixLimits::default());
        assert_eq!(axes.len(), 2);
    }

    #[test]
    fn test_size_property_without_cap() {
        let m = matrix(
            r#"
a: [1, 2, 3]
b: [x, y]
c: [p, q]
exclude:
  b: [y]
  c: [p, q]
"#,
        );
        let all = Matrix {
            exclude: vec![],
            ..m.clone()
        }
        .expand(MatrixLimits::default());
        let excluded = all
            .iter()
            .filter(|a| m.exclude.iter().any(|e| e.iter().all(|(k, v)| a.get(k) == Some(v))))
            .count();

        let axes = m.expand(MatrixLimits::default());
        assert_eq!(all.len(), 12);
        assert_eq!(axes.len(), all.len() - excluded);
        assert!(axes.iter().all(|a| a["b"] == "x"));
    }

    #[test]
    fn test_axis_cap() {
        let axes = matrix("{a: [1,2,3,4,5,6], b: [1,2,3,4,5,6]}").expand(MatrixLimits::default());
        assert_eq!(axes.len(), 25);
        assert_eq!(axes[0], axis(&[("a", "1"), ("b", "1")]));
    }

    #[test]
    fn test_cap_counts_surviving_axes() {
        let axes = matrix("{a: [1,2,3,4,5,6], b: [1,2,3,4,5,6], exclude: {a: 1}}")
            .expand(MatrixLimits::default());
        assert_eq!(axes.len(), 25);
        assert!(axes.iter().all(|a| a["a"] != "1"));
    }

    #[test]
    fn test_variable_cap_keeps_first_names() {
        let limits = MatrixLimits {
            max_axes: 25,
            max_variables: 2,
        };
        let axes = matrix("{c: [1], a: [1], b: [1]}").expand(limits);
        assert_eq!(axes, vec![axis(&[("a", "1"), ("b", "1")])]);
    }

    #[test]
    fn test_include_replaces_product() {
        let m = matrix(
            r#"
include:
  - {go: "1.21", db: postgres}
  - {go: "1.22", db: mysql}
"#,
        );
        let axes = m.expand(MatrixLimits::default());
        assert_eq!(axes.len(), 2);
        assert_eq!(axes[1]["db"], "mysql");
    }

    #[test]
    fn test_empty_value_list_yields_no_axes() {
        let axes = matrix("{go: []}").expand(MatrixLimits::default());
        assert!(axes.is_empty());
    }

    #[test]
    fn test_non_map_matrix_is_config_error() {
        let err = Matrix::from_yaml(&serde_yaml::from_str("[1, 2]").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
