//! In-memory store.

use async_trait::async_trait;
use chrono::Utc;
use cinder_core::build::{Build, File, FileMeta, Job, LogLine};
use cinder_core::ids::{BuildId, JobId, RepoId};
use cinder_core::ports::{BuildStore, JobStore, LogStore, RepoStore, SecretStore};
use cinder_core::repo::Repo;
use cinder_core::secret::Secret;
use cinder_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local implementation of every store port.
///
/// Each table sits behind its own lock, and no lock is held across an await.
#[derive(Default)]
pub struct MemoryStore {
    repos: RwLock<HashMap<RepoId, Repo>>,
    builds: RwLock<HashMap<BuildId, Build>>,
    build_numbers: RwLock<HashMap<RepoId, u64>>,
    jobs: RwLock<HashMap<JobId, Job>>,
    secrets: RwLock<HashMap<RepoId, Vec<Secret>>>,
    logs: RwLock<HashMap<JobId, Vec<LogLine>>>,
    files: RwLock<HashMap<JobId, Vec<(FileMeta, Vec<u8>)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of an uploaded file.
    pub fn file_data(&self, job_id: JobId, name: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .get(&job_id)?
            .iter()
            .find(|(meta, _)| meta.name == name)
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn create(&self, repo: &Repo) -> Result<()> {
        let mut repos = self.repos.write();
        if repos.values().any(|r| r.full_name == repo.full_name) {
            return Err(Error::Conflict(format!("repository {} already exists", repo.full_name)));
        }
        repos.insert(repo.id, repo.clone());
        Ok(())
    }

    async fn get(&self, id: RepoId) -> Result<Option<Repo>> {
        Ok(self.repos.read().get(&id).cloned())
    }

    async fn find_by_name(&self, full_name: &str) -> Result<Option<Repo>> {
        Ok(self
            .repos
            .read()
            .values()
            .find(|r| r.full_name == full_name)
            .cloned())
    }

    async fn update(&self, repo: &Repo) -> Result<()> {
        match self.repos.write().get_mut(&repo.id) {
            Some(existing) => {
                *existing = repo.clone();
                Ok(())
            }
            None => Err(Error::not_found("repository", &repo.full_name)),
        }
    }

    async fn list(&self) -> Result<Vec<Repo>> {
        let mut repos: Vec<Repo> = self.repos.read().values().cloned().collect();
        repos.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(repos)
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn reserve_number(&self, repo_id: RepoId) -> Result<u64> {
        let mut numbers = self.build_numbers.write();
        let next = numbers.entry(repo_id).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn create(&self, build: &Build) -> Result<()> {
        let mut builds = self.builds.write();
        if builds
            .values()
            .any(|b| b.repo_id == build.repo_id && b.number == build.number)
        {
            return Err(Error::Conflict(format!("build {} already exists", build.number)));
        }
        builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.builds.read().get(&id).cloned())
    }

    async fn find_by_number(&self, repo_id: RepoId, number: u64) -> Result<Option<Build>> {
        Ok(self
            .builds
            .read()
            .values()
            .find(|b| b.repo_id == repo_id && b.number == number)
            .cloned())
    }

    async fn last_on_branch(&self, repo_id: RepoId, branch: &str) -> Result<Option<Build>> {
        Ok(self
            .builds
            .read()
            .values()
            .filter(|b| b.repo_id == repo_id && b.commit.branch == branch)
            .max_by_key(|b| b.number)
            .cloned())
    }

    async fn list(&self, repo_id: RepoId, limit: usize) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .values()
            .filter(|b| b.repo_id == repo_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        builds.truncate(limit);
        Ok(builds)
    }

    async fn update(&self, build: &Build) -> Result<()> {
        match self.builds.write().get_mut(&build.id) {
            Some(existing) => {
                *existing = build.clone();
                Ok(())
            }
            None => Err(Error::not_found("build", build.id)),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn create_batch(&self, jobs: &[Job]) -> Result<()> {
        let mut table = self.jobs.write();
        for job in jobs {
            table.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.number, j.parent.is_some(), j.id));
        Ok(jobs)
    }

    async fn update(&self, job: &Job) -> Result<()> {
        match self.jobs.write().get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(Error::not_found("job", job.id)),
        }
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn list(&self, repo_id: RepoId) -> Result<Vec<Secret>> {
        Ok(self.secrets.read().get(&repo_id).cloned().unwrap_or_default())
    }

    async fn upsert(&self, secret: &Secret) -> Result<()> {
        let mut secrets = self.secrets.write();
        let list = secrets.entry(secret.repo_id).or_default();
        match list.iter_mut().find(|s| s.name == secret.name) {
            Some(existing) => *existing = secret.clone(),
            None => list.push(secret.clone()),
        }
        Ok(())
    }

    async fn delete(&self, repo_id: RepoId, name: &str) -> Result<()> {
        let mut secrets = self.secrets.write();
        let list = secrets.entry(repo_id).or_default();
        let before = list.len();
        list.retain(|s| s.name != name);
        if list.len() == before {
            return Err(Error::not_found("secret", name));
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, job_id: JobId, line: &LogLine) -> Result<()> {
        self.logs.write().entry(job_id).or_default().push(line.clone());
        Ok(())
    }

    async fn read(&self, job_id: JobId) -> Result<Vec<LogLine>> {
        Ok(self.logs.read().get(&job_id).cloned().unwrap_or_default())
    }

    async fn upload(&self, job_id: JobId, file: File) -> Result<()> {
        let meta = FileMeta {
            name: file.name,
            mime: file.mime,
            size: file.data.len(),
            created_at: Utc::now(),
        };
        let mut files = self.files.write();
        let list = files.entry(job_id).or_default();
        list.retain(|(m, _)| m.name != meta.name);
        list.push((meta, file.data));
        Ok(())
    }

    async fn files(&self, job_id: JobId) -> Result<Vec<FileMeta>> {
        Ok(self
            .files
            .read()
            .get(&job_id)
            .map(|list| list.iter().map(|(meta, _)| meta.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::build::{BuildEvent, Commit, Status};
    use pretty_assertions::assert_eq;

    fn build(repo: &Repo, number: u64, branch: &str) -> Build {
        let mut build = Build::new(
            repo.id,
            BuildEvent::Push,
            Commit {
                branch: branch.into(),
                ..Default::default()
            },
        );
        build.number = number;
        build
    }

    #[tokio::test]
    async fn test_repo_names_are_unique() {
        let store = MemoryStore::new();
        let repo = Repo::new("octocat", "hello-world", "h");
        RepoStore::create(&store, &repo).await.unwrap();

        let dup = Repo::new("octocat", "hello-world", "h2");
        let err = RepoStore::create(&store, &dup).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let found = store.find_by_name("octocat/hello-world").await.unwrap().unwrap();
        assert_eq!(found.id, repo.id);
    }

    #[tokio::test]
    async fn test_build_numbers_are_monotonic_per_repo() {
        let store = MemoryStore::new();
        let a = RepoId::new();
        let b = RepoId::new();
        assert_eq!(store.reserve_number(a).await.unwrap(), 1);
        assert_eq!(store.reserve_number(a).await.unwrap(), 2);
        assert_eq!(store.reserve_number(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_on_branch_and_list_order() {
        let store = MemoryStore::new();
        let repo = Repo::new("octocat", "hello-world", "h");
        for (n, branch) in [(1, "main"), (2, "dev"), (3, "main")] {
            BuildStore::create(&store, &build(&repo, n, branch)).await.unwrap();
        }

        let last = store.last_on_branch(repo.id, "main").await.unwrap().unwrap();
        assert_eq!(last.number, 3);
        assert!(store.last_on_branch(repo.id, "other").await.unwrap().is_none());

        let numbers: Vec<u64> = BuildStore::list(&store, repo.id, 2)
            .await
            .unwrap()
            .iter()
            .map(|b| b.number)
            .collect();
        assert_eq!(numbers, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let store = MemoryStore::new();
        let job = Job::new(BuildId::new(), 1, Default::default());
        let err = JobStore::update(&store, &job).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_jobs_listed_with_children_after_parent() {
        let store = MemoryStore::new();
        let build_id = BuildId::new();
        let first = Job::new(build_id, 1, Default::default());
        let second = Job::new(build_id, 2, Default::default());
        let mut child = Job::new(build_id, 1, Default::default());
        child.parent = Some(first.id);
        child.status = Status::Running;

        store.create_batch(&[second.clone(), first.clone()]).await.unwrap();
        JobStore::create(&store, &child).await.unwrap();

        let ids: Vec<JobId> = store
            .list_by_build(build_id)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![first.id, child.id, second.id]);
    }

    #[tokio::test]
    async fn test_secret_upsert_and_delete() {
        let store = MemoryStore::new();
        let repo_id = RepoId::new();
        store.upsert(&Secret::new(repo_id, "token", "a")).await.unwrap();
        store.upsert(&Secret::new(repo_id, "token", "b")).await.unwrap();

        let secrets = SecretStore::list(&store, repo_id).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].value, "b");

        store.delete(repo_id, "token").await.unwrap();
        assert!(store.delete(repo_id, "token").await.is_err());
    }

    #[tokio::test]
    async fn test_logs_and_files() {
        let store = MemoryStore::new();
        let job_id = JobId::new();
        let line = LogLine {
            job_id,
            proc: "build".into(),
            pos: 0,
            time: 1,
            out: "hello".into(),
        };
        store.append(job_id, &line).await.unwrap();
        assert_eq!(store.read(job_id).await.unwrap(), vec![line]);

        store
            .upload(
                job_id,
                File {
                    name: "coverage.xml".into(),
                    mime: "application/xml".into(),
                    data: b"<xml/>".to_vec(),
                },
            )
            .await
            .unwrap();
        let files = store.files(job_id).await.unwrap();
        assert_eq!(files[0].size, 6);
        assert_eq!(store.file_data(job_id, "coverage.xml").unwrap(), b"<xml/>".to_vec());
    }
}
