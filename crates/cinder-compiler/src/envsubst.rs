//! Shell-style variable substitution over pipeline text.
//!
//! Supported forms: `$NAME`, `${NAME}`, `${NAME-default}`, `${NAME:-default}`,
//! `${NAME=default}`, `${NAME:=default}`, and `$$` for a literal dollar sign.
//! Unknown variables expand to the empty string.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-=])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid substitution pattern")
});

/// Substitute every variable reference in `text` using `lookup`.
pub fn substitute<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    VARIABLE
        .replace_all(text, |caps: &Captures<'_>| {
            if let Some(name) = caps.get(4) {
                return lookup(name.as_str()).unwrap_or_default();
            }
            let Some(name) = caps.get(1) else {
                return "$".to_string();
            };
            let value = lookup(name.as_str());
            match caps.get(2).map(|m| m.as_str()) {
                None => value.unwrap_or_default(),
                // `-` and `=` fall back only when unset, `:-` and `:=` also when empty.
                Some(op) => {
                    let default = caps.get(3).map_or("", |m| m.as_str());
                    match value {
                        Some(v) if !(op.starts_with(':') && v.is_empty()) => v,
                        _ => default.to_string(),
                    }
                }
            }
        })
        .into_owned()
}

/// Quote values that would otherwise break the surrounding YAML line.
pub fn yaml_safe(value: String) -> String {
    if value.contains('\n') {
        serde_json::to_string(&value).unwrap_or(value)
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn run(text: &str, vars: &HashMap<String, String>) -> String {
        substitute(text, |name| vars.get(name).cloned())
    }

    #[test]
    fn test_braced_and_bare() {
        let vars = env(&[("GO", "1.22"), ("OS", "linux")]);
        assert_eq!(run("image: golang:${GO}-$OS", &vars), "image: golang:1.22-linux");
    }

    #[test]
    fn test_unknown_is_empty() {
        assert_eq!(run("a${MISSING}b$ALSO_MISSING", &env(&[])), "ab");
    }

    #[test]
    fn test_dollar_escape() {
        let vars = env(&[("HOME", "/root")]);
        assert_eq!(run("echo $$HOME is $HOME", &vars), "echo $HOME is /root");
    }

    #[test]
    fn test_defaults() {
        let vars = env(&[("EMPTY", ""), ("SET", "x")]);
        assert_eq!(run("${UNSET-def}", &vars), "def");
        assert_eq!(run("${EMPTY-def}", &vars), "");
        assert_eq!(run("${EMPTY:-def}", &vars), "def");
        assert_eq!(run("${SET:-def}", &vars), "x");
        assert_eq!(run("${UNSET:=def}", &vars), "def");
    }

    #[test]
    fn test_non_variable_dollar_is_untouched() {
        assert_eq!(run("cost: $5", &env(&[])), "cost: $5");
    }

    #[test]
    fn test_yaml_safe_quotes_multiline() {
        assert_eq!(yaml_safe("one".into()), "one");
        assert_eq!(yaml_safe("a\nb".into()), "\"a\\nb\"");
    }
}
