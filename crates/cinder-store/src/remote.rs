//! Source-control remotes.

use async_trait::async_trait;
use cinder_core::build::{Build, Status};
use cinder_core::ports::{ConfigFile, Remote};
use cinder_core::repo::Repo;
use cinder_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::info;

/// Reads pipeline files from `<root>/<owner>/<name>/<file>` on local disk.
///
/// Useful for self-hosted mirrors and local development. Commit statuses are
/// only logged.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
    config_file: String,
    signature_file: String,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_file: ".cinder.yml".to_string(),
            signature_file: ".cinder.yml.sig".to_string(),
        }
    }

    pub fn with_config_file(mut self, name: impl Into<String>) -> Self {
        self.config_file = name.into();
        self
    }

    pub fn with_signature_file(mut self, name: impl Into<String>) -> Self {
        self.signature_file = name.into();
        self
    }

    fn repo_dir(&self, repo: &Repo) -> PathBuf {
        self.root.join(&repo.owner).join(&repo.name)
    }
}

#[async_trait]
impl Remote for DirectoryRemote {
    async fn fetch_config(&self, repo: &Repo, _build: &Build) -> Result<ConfigFile> {
        let dir = self.repo_dir(repo);
        let path = dir.join(&self.config_file);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found("pipeline configuration", path.display()));
            }
            Err(e) => return Err(Error::Internal(format!("reading {}: {}", path.display(), e))),
        };
        let signature = tokio::fs::read_to_string(dir.join(&self.signature_file))
            .await
            .ok();
        Ok(ConfigFile { data, signature })
    }

    async fn set_status(&self, repo: &Repo, build: &Build, link: &str) -> Result<()> {
        info!(
            repo = %repo.full_name,
            build = build.number,
            sha = %build.commit.sha,
            status = %build.status,
            link,
            "commit status"
        );
        Ok(())
    }
}

/// Remote serving pipeline files from memory and recording status updates.
#[derive(Debug, Default)]
pub struct StaticRemote {
    configs: RwLock<HashMap<String, ConfigFile>>,
    statuses: RwLock<Vec<(String, u64, Status)>>,
}

impl StaticRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&self, full_name: &str, data: impl Into<String>, signature: Option<String>) {
        self.configs.write().insert(
            full_name.to_string(),
            ConfigFile {
                data: data.into(),
                signature,
            },
        );
    }

    /// Status updates received so far, as `(repo, build number, status)`.
    pub fn statuses(&self) -> Vec<(String, u64, Status)> {
        self.statuses.read().clone()
    }
}

#[async_trait]
impl Remote for StaticRemote {
    async fn fetch_config(&self, repo: &Repo, _build: &Build) -> Result<ConfigFile> {
        self.configs
            .read()
            .get(&repo.full_name)
            .cloned()
            .ok_or_else(|| Error::not_found("pipeline configuration", &repo.full_name))
    }

    async fn set_status(&self, repo: &Repo, build: &Build, _link: &str) -> Result<()> {
        self.statuses
            .write()
            .push((repo.full_name.clone(), build.number, build.status));
        Ok(())
    }
}
