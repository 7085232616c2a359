//! Build metadata exposed to jobs as `CI_*` environment variables.

use cinder_core::build::{Axis, Build};
use cinder_core::repo::Repo;
use std::collections::BTreeMap;

pub struct Metadata<'a> {
    pub repo: &'a Repo,
    pub build: &'a Build,
    pub prev: Option<&'a Build>,
    /// Public base URL of the server.
    pub link: &'a str,
    pub platform: &'a str,
    pub job_number: u32,
    pub axis: &'a Axis,
}

impl Metadata<'_> {
    pub fn build_link(&self) -> String {
        format!(
            "{}/{}/{}",
            self.link.trim_end_matches('/'),
            self.repo.full_name,
            self.build.number
        )
    }

    /// Environment for one job. Axis variables are merged last and win on conflict.
    pub fn environ(&self) -> BTreeMap<String, String> {
        let build = self.build;
        let commit = &build.commit;
        let arch = self.platform.replace('/', "_");

        let mut env = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            env.insert(k.to_string(), v);
        };
        set("CI", "true".into());
        set("CI_REPO", self.repo.full_name.clone());
        set("CI_REPO_NAME", self.repo.name.clone());
        set("CI_REPO_OWNER", self.repo.owner.clone());
        set("CI_REPO_LINK", self.repo.link.clone().unwrap_or_default());
        set("CI_REPO_PRIVATE", self.repo.private.to_string());
        set("CI_REPO_TRUSTED", self.repo.policy.trusted.to_string());
        set("CI_BUILD_NUMBER", build.number.to_string());
        set("CI_BUILD_EVENT", build.event.to_string());
        set("CI_BUILD_LINK", self.build_link());
        set("CI_BUILD_CREATED", build.enqueued_at.timestamp().to_string());
        set("CI_BUILD_SENDER", build.sender.clone());
        set("CI_COMMIT_SHA", commit.sha.clone());
        set("CI_COMMIT_REF", commit.git_ref.clone());
        set("CI_COMMIT_BRANCH", commit.branch.clone());
        set("CI_COMMIT_MESSAGE", commit.message.clone());
        set("CI_COMMIT_AUTHOR", commit.author.clone());
        set("CI_COMMIT_LINK", commit.link.clone().unwrap_or_default());
        set("CI_DEPLOY_TARGET", build.deploy_to.clone().unwrap_or_default());
        set("CI_JOB_NUMBER", self.job_number.to_string());
        set("CI_SYSTEM_ARCH", arch);
        set("CI_SYSTEM_LINK", self.link.to_string());
        if let Some(prev) = self.prev {
            set("CI_PREV_BUILD_NUMBER", prev.number.to_string());
            set("CI_PREV_BUILD_STATUS", prev.status.to_string());
            set("CI_PREV_COMMIT_SHA", prev.commit.sha.clone());
        }
        if build.event == cinder_core::build::BuildEvent::Tag {
            let tag = commit.git_ref.strip_prefix("refs/tags/").unwrap_or(&commit.git_ref);
            set("CI_TAG", tag.to_string());
        }

        for (k, v) in self.axis {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}
