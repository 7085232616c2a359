//! Per-axis rendering of a pipeline into job specifications.

use crate::envsubst::{substitute, yaml_safe};
use crate::linter::Linter;
use crate::matrix::{Matrix, MatrixLimits};
use crate::metadata::Metadata;
use crate::plan::{ExecutionPlan, PlanSecret, StepPlan, WorkspacePlan};
use crate::yaml::{Container, Document, Outline};
use cinder_core::build::{Axis, Build, BuildEvent};
use cinder_core::repo::Repo;
use cinder_core::secret::Secret;
use cinder_core::Result;
use glob::Pattern;
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_PLATFORM: &str = "linux/amd64";
pub const LABEL_PLATFORM: &str = "platform";

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Platform used when the pipeline does not name one.
    pub default_platform: String,
    /// Plugin images that run privileged regardless of repository trust.
    pub escalated: Vec<String>,
    pub workspace_base: String,
    /// Public base URL of the server, used in build links.
    pub link: String,
    pub limits: MatrixLimits,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            default_platform: DEFAULT_PLATFORM.to_string(),
            escalated: vec![
                "plugins/docker".to_string(),
                "plugins/gcr".to_string(),
                "plugins/ecr".to_string(),
            ],
            workspace_base: "/cinder".to_string(),
            link: "http://localhost:8000".to_string(),
            limits: MatrixLimits::default(),
        }
    }
}

impl CompilerOptions {
    pub fn with_default_platform(mut self, platform: impl Into<String>) -> Self {
        self.default_platform = platform.into();
        self
    }

    pub fn with_escalated(mut self, images: Vec<String>) -> Self {
        self.escalated = images;
        self
    }

    pub fn with_workspace_base(mut self, base: impl Into<String>) -> Self {
        self.workspace_base = base.into();
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    pub fn with_limits(mut self, limits: MatrixLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Everything the compiler reads for one trigger.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub repo: &'a Repo,
    /// The new build, with its number already reserved. `sender` is the requester.
    pub build: &'a Build,
    pub prev: Option<&'a Build>,
    pub secrets: &'a [Secret],
    pub config: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub number: u32,
    pub axis: Axis,
    pub platform: String,
    /// Capabilities an agent must advertise to lease this job.
    pub labels: BTreeMap<String, String>,
    pub plan: ExecutionPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Jobs(Vec<JobSpec>),
    /// Not an error: the trigger is valid but produces no work.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompilerOptions,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn compile(&self, req: CompileRequest<'_>) -> Result<CompileOutcome> {
        let outline = Outline::parse(req.config)?;

        let build = req.build;
        let bypass_branches = matches!(build.event, BuildEvent::Tag | BuildEvent::Deploy);
        if !bypass_branches && !outline.branches.matches(&build.commit.branch) {
            return Ok(CompileOutcome::Skipped {
                reason: format!("branch {} does not match the pipeline branch filter", build.commit.branch),
            });
        }

        let axes = Matrix::from_yaml(&outline.matrix)?.expand(self.options.limits);
        if axes.is_empty() {
            return Ok(CompileOutcome::Skipped {
                reason: "matrix produced no jobs".to_string(),
            });
        }

        let linter = Linter::new().with_trusted(req.repo.policy.trusted);
        let secrets: Vec<&Secret> = req
            .secrets
            .iter()
            .filter(|s| s.match_event(build.event) && (build.verified || s.skip_verify))
            .collect();
        let platform_hint = outline
            .platform()
            .map_or_else(|| self.options.default_platform.clone(), str::to_string);

        let mut specs = Vec::with_capacity(axes.len());
        for (index, axis) in axes.into_iter().enumerate() {
            let number = index as u32 + 1;
            specs.push(self.render(&req, &linter, &secrets, &platform_hint, number, axis)?);
        }

        debug!(
            repo = %req.repo.full_name,
            build = build.number,
            jobs = specs.len(),
            "pipeline compiled"
        );
        Ok(CompileOutcome::Jobs(specs))
    }

    fn render(
        &self,
        req: &CompileRequest<'_>,
        linter: &Linter,
        secrets: &[&Secret],
        platform_hint: &str,
        number: u32,
        axis: Axis,
    ) -> Result<JobSpec> {
        let mut environ = Metadata {
            repo: req.repo,
            build: req.build,
            prev: req.prev,
            link: &self.options.link,
            platform: platform_hint,
            job_number: number,
            axis: &axis,
        }
        .environ();

        let text = substitute(req.config, |name| {
            environ
                .get(name)
                .cloned()
                .or_else(|| {
                    secrets
                        .iter()
                        .find(|s| s.name.eq_ignore_ascii_case(name))
                        .map(|s| s.value.clone())
                })
                .map(yaml_safe)
        });
        let doc = Document::parse(&text)?;
        linter.lint(&doc)?;

        let platform = doc
            .platform
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.options.default_platform.clone());
        let mut labels = doc.labels.clone();
        labels.insert(LABEL_PLATFORM.to_string(), platform.clone());

        let workspace = doc.workspace.clone().unwrap_or_default();
        let workspace = WorkspacePlan {
            base: workspace.base.unwrap_or_else(|| self.options.workspace_base.clone()),
            path: workspace
                .path
                .unwrap_or_else(|| format!("src/{}", req.repo.full_name)),
        };
        environ.insert(
            "CI_WORKSPACE".to_string(),
            format!("{}/{}", workspace.base, workspace.path),
        );

        let render_all = |containers: &indexmap::IndexMap<String, Container>| -> Vec<StepPlan> {
            containers
                .iter()
                .map(|(name, c)| self.render_container(name, c, secrets))
                .collect()
        };

        let plan = ExecutionPlan {
            platform: platform.clone(),
            workspace,
            environment: environ,
            services: render_all(&doc.services),
            steps: render_all(&doc.steps),
            secrets: secrets
                .iter()
                .map(|s| PlanSecret {
                    name: s.name.clone(),
                    value: s.value.clone(),
                    mask: s.conceal,
                })
                .collect(),
        };

        Ok(JobSpec {
            number,
            axis,
            platform,
            labels,
            plan,
        })
    }

    fn render_container(&self, name: &str, c: &Container, secrets: &[&Secret]) -> StepPlan {
        let mut environment = c.environment.clone();
        for wanted in &c.secrets {
            match secrets.iter().find(|s| s.name.eq_ignore_ascii_case(wanted)) {
                Some(secret) if image_matches(&secret.images, &c.image) => {
                    environment.insert(wanted.to_uppercase(), secret.value.clone());
                }
                Some(_) => debug!(step = name, secret = %wanted, image = %c.image, "secret not exposed to image"),
                None => debug!(step = name, secret = %wanted, "secret not available to this build"),
            }
        }

        // Escalated plugins run privileged but only with their own entrypoint.
        let escalated = self.is_escalated(&c.image);
        StepPlan {
            name: name.to_string(),
            image: c.image.clone(),
            commands: if escalated { Vec::new() } else { c.commands.clone() },
            entrypoint: if escalated { Vec::new() } else { c.entrypoint.clone() },
            environment,
            privileged: c.privileged || escalated,
            network_mode: c.network_mode.clone().filter(|m| !m.is_empty()),
            volumes: c.volumes.clone(),
            devices: c.devices.clone(),
            detach: c.detach,
            pull: c.pull,
        }
    }

    fn is_escalated(&self, image: &str) -> bool {
        let name = image_name(image);
        self.options.escalated.iter().any(|e| e == name)
    }
}

/// Image reference without its tag or digest.
fn image_name(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}

fn image_matches(patterns: &[String], image: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let name = image_name(image);
    patterns.iter().any(|p| match Pattern::new(p) {
        Ok(pattern) => pattern.matches(image) || pattern.matches(name),
        Err(_) => p == image || p == name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::build::Commit;
    use cinder_core::Error;
    use pretty_assertions::assert_eq;

    const MATRIX_PIPELINE: &str = r#"
matrix:
  go: [1, 2]
  os: [linux, windows]
steps:
  test:
    image: golang:${go}
    commands:
      - go test ./... # $os
"#;

    fn repo() -> Repo {
        Repo::new("octocat", "hello-world", "hash")
    }

    fn build(repo: &Repo, event: BuildEvent, branch: &str) -> Build {
        let mut build = Build::new(
            repo.id,
            event,
            Commit {
                sha: "deadbeef".into(),
                git_ref: format!("refs/heads/{}", branch),
                branch: branch.into(),
                message: "update".into(),
                author: "octocat".into(),
                link: None,
            },
        );
        build.number = 1;
        build
    }

    fn compile(repo: &Repo, build: &Build, secrets: &[Secret], config: &str) -> Result<CompileOutcome> {
        Compiler::default().compile(CompileRequest {
            repo,
            build,
            prev: None,
            secrets,
            config,
        })
    }

    fn jobs(outcome: CompileOutcome) -> Vec<JobSpec> {
        match outcome {
            CompileOutcome::Jobs(jobs) => jobs,
            CompileOutcome::Skipped { reason } => panic!("unexpected skip: {}", reason),
        }
    }

    #[test]
    fn test_matrix_produces_ordered_jobs() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let specs = jobs(compile(&repo, &b, &[], MATRIX_PIPELINE).unwrap());

        let axes: Vec<(String, String)> = specs
            .iter()
            .map(|s| (s.axis["go"].clone(), s.axis["os"].clone()))
            .collect();
        assert_eq!(
            axes,
            vec![
                ("1".into(), "linux".into()),
                ("1".into(), "windows".into()),
                ("2".into(), "linux".into()),
                ("2".into(), "windows".into()),
            ]
        );
        assert_eq!(specs.iter().map(|s| s.number).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_substitution_is_per_axis() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let specs = jobs(compile(&repo, &b, &[], MATRIX_PIPELINE).unwrap());

        assert_eq!(specs[0].plan.steps[0].image, "golang:1");
        assert_eq!(specs[3].plan.steps[0].image, "golang:2");
        assert_eq!(specs[1].plan.environment["os"], "windows");
        assert_eq!(specs[1].plan.environment["CI_JOB_NUMBER"], "2");
    }

    #[test]
    fn test_exclude_removes_axes() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = r#"
matrix:
  go: [1, 2]
  os: [linux, windows]
  exclude:
    os: [windows]
steps:
  test: {image: "golang:${go}"}
"#;
        let specs = jobs(compile(&repo, &b, &[], config).unwrap());
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.axis["os"] == "linux"));
    }

    #[test]
    fn test_default_platform_label() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = "labels: {gpu: 'true'}\nsteps: {a: {image: alpine}}";
        let specs = jobs(compile(&repo, &b, &[], config).unwrap());

        assert_eq!(specs[0].platform, DEFAULT_PLATFORM);
        assert_eq!(specs[0].labels["platform"], DEFAULT_PLATFORM);
        assert_eq!(specs[0].labels["gpu"], "true");
        assert_eq!(specs[0].plan.workspace.path, "src/octocat/hello-world");
    }

    #[test]
    fn test_branch_mismatch_is_skipped() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "develop");
        let config = "branches: main\nsteps: {a: {image: alpine}}";
        let outcome = compile(&repo, &b, &[], config).unwrap();
        assert!(matches!(outcome, CompileOutcome::Skipped { .. }));
    }

    #[test]
    fn test_tag_and_deploy_bypass_branch_filter() {
        let repo = repo();
        let config = "branches: main\nsteps: {a: {image: alpine}}";
        for event in [BuildEvent::Tag, BuildEvent::Deploy] {
            let b = build(&repo, event, "develop");
            assert_eq!(jobs(compile(&repo, &b, &[], config).unwrap()).len(), 1);
        }
    }

    #[test]
    fn test_branch_filter_runs_before_matrix() {
        let repo = repo();
        let config = "branches: main\nmatrix: [not, a, map]\nsteps: {a: {image: alpine}}";

        let b = build(&repo, BuildEvent::Push, "develop");
        let outcome = compile(&repo, &b, &[], config).unwrap();
        assert!(matches!(outcome, CompileOutcome::Skipped { .. }));

        let b = build(&repo, BuildEvent::Push, "main");
        assert!(matches!(compile(&repo, &b, &[], config).unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_axis_drives_typed_fields() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = r#"
matrix:
  DETACH: [true, false]
services:
  db:
    image: postgres
    detach: ${DETACH}
steps:
  test:
    image: alpine
    privileged: ${PRIVILEGED:-false}
"#;
        let specs = jobs(compile(&repo, &b, &[], config).unwrap());
        assert_eq!(specs.len(), 2);
        assert!(specs[0].plan.services[0].detach);
        assert!(!specs[1].plan.services[0].detach);
        assert!(!specs[0].plan.steps[0].privileged);
    }

    #[test]
    fn test_substituted_privileged_is_still_linted() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = "matrix: {PRIV: [true]}\nsteps: {a: {image: alpine, privileged: ${PRIV}}}";
        assert!(matches!(compile(&repo, &b, &[], config).unwrap_err(), Error::Policy(_)));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let err = compile(&repo, &b, &[], "steps: [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_untrusted_privileged_is_policy_error() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = "steps: {dind: {image: docker:dind, privileged: true}}";
        assert!(matches!(compile(&repo, &b, &[], config).unwrap_err(), Error::Policy(_)));

        let mut trusted = repo.clone();
        trusted.policy.trusted = true;
        let specs = jobs(compile(&trusted, &b, &[], config).unwrap());
        assert!(specs[0].plan.steps[0].privileged);
    }

    #[test]
    fn test_escalated_plugin_runs_privileged_without_commands() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let config = "steps: {publish: {image: 'plugins/docker:18', commands: [whoami]}}";
        let specs = jobs(compile(&repo, &b, &[], config).unwrap());
        let step = &specs[0].plan.steps[0];
        assert!(step.privileged);
        assert!(step.commands.is_empty());
    }

    #[test]
    fn test_secrets_require_verified_build() {
        let repo = repo();
        let mut b = build(&repo, BuildEvent::Push, "main");
        let secrets = vec![
            Secret::new(repo.id, "docker_password", "s3cret"),
            Secret::new(repo.id, "public_token", "open").with_skip_verify(true),
        ];
        let config = "steps: {a: {image: alpine, secrets: [docker_password, public_token]}}";

        let specs = jobs(compile(&repo, &b, &secrets, config).unwrap());
        let env = &specs[0].plan.steps[0].environment;
        assert!(!env.contains_key("DOCKER_PASSWORD"));
        assert_eq!(env["PUBLIC_TOKEN"], "open");

        b.verified = true;
        let specs = jobs(compile(&repo, &b, &secrets, config).unwrap());
        assert_eq!(specs[0].plan.steps[0].environment["DOCKER_PASSWORD"], "s3cret");
        assert_eq!(specs[0].plan.secrets.len(), 2);
    }

    #[test]
    fn test_secrets_filtered_by_event_and_image() {
        let repo = repo();
        let mut b = build(&repo, BuildEvent::Pull, "main");
        b.verified = true;
        let secrets = vec![
            Secret::new(repo.id, "push_only", "a"),
            Secret::new(repo.id, "docker_only", "b")
                .with_events(vec![BuildEvent::Pull])
                .with_images(vec!["plugins/docker".into()]),
        ];
        let config = r#"
steps:
  test: {image: alpine, secrets: [push_only, docker_only]}
  publish: {image: "plugins/docker:latest", secrets: [docker_only]}
"#;
        let specs = jobs(compile(&repo, &b, &secrets, config).unwrap());
        let steps = &specs[0].plan.steps;
        assert!(steps[0].environment.is_empty());
        assert_eq!(steps[1].environment["DOCKER_ONLY"], "b");
    }

    #[test]
    fn test_empty_matrix_values_skip() {
        let repo = repo();
        let b = build(&repo, BuildEvent::Push, "main");
        let outcome = compile(&repo, &b, &[], "matrix: {go: []}\nsteps: {a: {image: alpine}}").unwrap();
        assert!(matches!(outcome, CompileOutcome::Skipped { .. }));
    }

    #[test]
    fn test_image_name_strips_tag_and_digest() {
        assert_eq!(image_name("plugins/docker:18"), "plugins/docker");
        assert_eq!(image_name("registry:5000/plugins/docker"), "registry:5000/plugins/docker");
        assert_eq!(image_name("alpine@sha256:abc"), "alpine");
    }
}
