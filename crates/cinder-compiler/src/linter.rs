//! Structural and trust-policy checks on a parsed pipeline.

use crate::yaml::{Container, Document};
use cinder_core::{Error, Result};

/// Checks a document before it is rendered.
///
/// Structural problems are configuration errors. Use of host-level features
/// from an untrusted repository is a policy error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Linter {
    trusted: bool,
}

impl Linter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn lint(&self, doc: &Document) -> Result<()> {
        if doc.steps.is_empty() {
            return Err(Error::Config("pipeline has no steps".into()));
        }
        for (name, container) in doc.containers() {
            self.lint_container(name, container)?;
        }
        Ok(())
    }

    fn lint_container(&self, name: &str, c: &Container) -> Result<()> {
        if c.image.trim().is_empty() {
            return Err(Error::Config(format!("{}: missing image", name)));
        }
        if !c.commands.is_empty() && !c.entrypoint.is_empty() {
            return Err(Error::Config(format!(
                "{}: commands cannot be combined with a custom entrypoint",
                name
            )));
        }
        if self.trusted {
            return Ok(());
        }
        if c.privileged {
            return Err(Error::Policy(format!("{}: privileged mode requires a trusted repository", name)));
        }
        if c.network_mode.as_deref().is_some_and(|m| !m.is_empty()) {
            return Err(Error::Policy(format!("{}: network_mode requires a trusted repository", name)));
        }
        if !c.volumes.is_empty() {
            return Err(Error::Policy(format!("{}: volumes require a trusted repository", name)));
        }
        if !c.devices.is_empty() {
            return Err(Error::Policy(format!("{}: devices require a trusted repository", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::parse(text).unwrap()
    }

    #[test]
    fn test_valid_pipeline() {
        let d = doc("steps: {build: {image: alpine, commands: [make]}}");
        assert!(Linter::new().lint(&d).is_ok());
    }

    #[test]
    fn test_no_steps_is_config_error() {
        let d = doc("platform: linux/amd64");
        assert!(matches!(Linter::new().lint(&d), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_image_is_config_error() {
        let d = doc("steps: {build: {commands: [make]}}");
        assert!(matches!(Linter::new().lint(&d), Err(Error::Config(_))));
    }

    #[test]
    fn test_untrusted_privileged_is_policy_error() {
        let d = doc("steps: {dind: {image: docker, privileged: true}}");
        assert!(matches!(Linter::new().lint(&d), Err(Error::Policy(_))));
        assert!(Linter::new().with_trusted(true).lint(&d).is_ok());
    }

    #[test]
    fn test_untrusted_host_network_is_policy_error() {
        let d = doc("steps: {a: {image: alpine, network_mode: host}}");
        assert!(matches!(Linter::new().lint(&d), Err(Error::Policy(_))));
    }

    #[test]
    fn test_untrusted_volumes_in_service_is_policy_error() {
        let d = doc(
            r#"
services:
  cache: {image: redis, volumes: ["/var/run/docker.sock:/var/run/docker.sock"]}
steps:
  a: {image: alpine}
"#,
        );
        assert!(matches!(Linter::new().lint(&d), Err(Error::Policy(_))));
    }
}
