//! PostgreSQL store.
//!
//! Records are kept as JSONB documents next to the columns used for lookups.
//! Fields that never leave the server (repo hash, secret value) live in their
//! own columns because they are skipped when serializing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinder_core::build::{Build, File, FileMeta, Job, LogLine};
use cinder_core::ids::{BuildId, JobId, RepoId};
use cinder_core::ports::{BuildStore, JobStore, LogStore, RepoStore, SecretStore};
use cinder_core::repo::Repo;
use cinder_core::secret::Secret;
use cinder_core::{Error, Result};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS repos (
        id UUID PRIMARY KEY,
        full_name TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL,
        data JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS build_numbers (
        repo_id UUID PRIMARY KEY,
        last BIGINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS builds (
        id UUID PRIMARY KEY,
        repo_id UUID NOT NULL,
        number BIGINT NOT NULL,
        branch TEXT NOT NULL,
        data JSONB NOT NULL,
        UNIQUE (repo_id, number)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        build_id UUID NOT NULL,
        number INT NOT NULL,
        is_child BOOLEAN NOT NULL,
        data JSONB NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS jobs_build_id_idx ON jobs (build_id)",
    r#"CREATE TABLE IF NOT EXISTS secrets (
        repo_id UUID NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        data JSONB NOT NULL,
        PRIMARY KEY (repo_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS log_lines (
        seq BIGSERIAL PRIMARY KEY,
        job_id UUID NOT NULL,
        data JSONB NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS log_lines_job_id_idx ON log_lines (job_id)",
    r#"CREATE TABLE IF NOT EXISTS files (
        job_id UUID NOT NULL,
        name TEXT NOT NULL,
        mime TEXT NOT NULL,
        data BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (job_id, name)
    )"#,
];

fn store_err(e: sqlx::Error) -> Error {
    Error::TransientStore(e.to_string())
}

fn decode<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let Json(value) = row
        .try_get::<Json<T>, _>("data")
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(value)
}

/// PostgreSQL implementation of every store port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(store_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables that do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        info!("database schema is up to date");
        Ok(())
    }

    fn repo_from_row(row: &PgRow) -> Result<Repo> {
        let mut repo: Repo = decode(row)?;
        repo.hash = row.try_get("hash").map_err(store_err)?;
        Ok(repo)
    }

    fn secret_from_row(row: &PgRow) -> Result<Secret> {
        let mut secret: Secret = decode(row)?;
        secret.value = row.try_get("value").map_err(store_err)?;
        Ok(secret)
    }
}

#[async_trait]
impl RepoStore for PgStore {
    async fn create(&self, repo: &Repo) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO repos (id, full_name, hash, data) VALUES ($1, $2, $3, $4) ON CONFLICT (full_name) DO NOTHING",
        )
        .bind(repo.id.as_uuid())
        .bind(&repo.full_name)
        .bind(&repo.hash)
        .bind(Json(repo))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!("repository {} already exists", repo.full_name)));
        }
        Ok(())
    }

    async fn get(&self, id: RepoId) -> Result<Option<Repo>> {
        let row = sqlx::query("SELECT hash, data FROM repos WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::repo_from_row).transpose()
    }

    async fn find_by_name(&self, full_name: &str) -> Result<Option<Repo>> {
        let row = sqlx::query("SELECT hash, data FROM repos WHERE full_name = $1")
            .bind(full_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::repo_from_row).transpose()
    }

    async fn update(&self, repo: &Repo) -> Result<()> {
        let result = sqlx::query("UPDATE repos SET hash = $2, data = $3 WHERE id = $1")
            .bind(repo.id.as_uuid())
            .bind(&repo.hash)
            .bind(Json(repo))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("repository", &repo.full_name));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Repo>> {
        let rows = sqlx::query("SELECT hash, data FROM repos ORDER BY full_name")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::repo_from_row).collect()
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn reserve_number(&self, repo_id: RepoId) -> Result<u64> {
        let last: i64 = sqlx::query_scalar(
            r#"INSERT INTO build_numbers (repo_id, last) VALUES ($1, 1)
               ON CONFLICT (repo_id) DO UPDATE SET last = build_numbers.last + 1
               RETURNING last"#,
        )
        .bind(repo_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(last as u64)
    }

    async fn create(&self, build: &Build) -> Result<()> {
        sqlx::query("INSERT INTO builds (id, repo_id, number, branch, data) VALUES ($1, $2, $3, $4, $5)")
            .bind(build.id.as_uuid())
            .bind(build.repo_id.as_uuid())
            .bind(build.number as i64)
            .bind(&build.commit.branch)
            .bind(Json(build))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        let row = sqlx::query("SELECT data FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn find_by_number(&self, repo_id: RepoId, number: u64) -> Result<Option<Build>> {
        let row = sqlx::query("SELECT data FROM builds WHERE repo_id = $1 AND number = $2")
            .bind(repo_id.as_uuid())
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn last_on_branch(&self, repo_id: RepoId, branch: &str) -> Result<Option<Build>> {
        let row = sqlx::query(
            "SELECT data FROM builds WHERE repo_id = $1 AND branch = $2 ORDER BY number DESC LIMIT 1",
        )
        .bind(repo_id.as_uuid())
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn list(&self, repo_id: RepoId, limit: usize) -> Result<Vec<Build>> {
        let rows = sqlx::query("SELECT data FROM builds WHERE repo_id = $1 ORDER BY number DESC LIMIT $2")
            .bind(repo_id.as_uuid())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(decode).collect()
    }

    async fn update(&self, build: &Build) -> Result<()> {
        let result = sqlx::query("UPDATE builds SET data = $2 WHERE id = $1")
            .bind(build.id.as_uuid())
            .bind(Json(build))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("build", build.id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.create_batch(std::slice::from_ref(job)).await
    }

    async fn create_batch(&self, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for job in jobs {
            sqlx::query("INSERT INTO jobs (id, build_id, number, is_child, data) VALUES ($1, $2, $3, $4, $5)")
                .bind(job.id.as_uuid())
                .bind(job.build_id.as_uuid())
                .bind(job.number as i32)
                .bind(job.parent.is_some())
                .bind(Json(job))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT data FROM jobs WHERE build_id = $1 ORDER BY number, is_child, id")
            .bind(build_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(decode).collect()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET data = $2 WHERE id = $1")
            .bind(job.id.as_uuid())
            .bind(Json(job))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("job", job.id));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for PgStore {
    async fn list(&self, repo_id: RepoId) -> Result<Vec<Secret>> {
        let rows = sqlx::query("SELECT value, data FROM secrets WHERE repo_id = $1 ORDER BY name")
            .bind(repo_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::secret_from_row).collect()
    }

    async fn upsert(&self, secret: &Secret) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO secrets (repo_id, name, value, data) VALUES ($1, $2, $3, $4)
               ON CONFLICT (repo_id, name) DO UPDATE SET value = EXCLUDED.value, data = EXCLUDED.data"#,
        )
        .bind(secret.repo_id.as_uuid())
        .bind(&secret.name)
        .bind(&secret.value)
        .bind(Json(secret))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, repo_id: RepoId, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM secrets WHERE repo_id = $1 AND name = $2")
            .bind(repo_id.as_uuid())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("secret", name));
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn append(&self, job_id: JobId, line: &LogLine) -> Result<()> {
        sqlx::query("INSERT INTO log_lines (job_id, data) VALUES ($1, $2)")
            .bind(job_id.as_uuid())
            .bind(Json(line))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn read(&self, job_id: JobId) -> Result<Vec<LogLine>> {
        let rows = sqlx::query("SELECT data FROM log_lines WHERE job_id = $1 ORDER BY seq")
            .bind(job_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(decode).collect()
    }

    async fn upload(&self, job_id: JobId, file: File) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO files (job_id, name, mime, data, created_at) VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (job_id, name) DO UPDATE SET mime = EXCLUDED.mime, data = EXCLUDED.data, created_at = EXCLUDED.created_at"#,
        )
        .bind(job_id.as_uuid())
        .bind(&file.name)
        .bind(&file.mime)
        .bind(&file.data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn files(&self, job_id: JobId) -> Result<Vec<FileMeta>> {
        let rows = sqlx::query(
            "SELECT name, mime, octet_length(data) AS size, created_at FROM files WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                Ok(FileMeta {
                    name: row.try_get("name").map_err(store_err)?,
                    mime: row.try_get("mime").map_err(store_err)?,
                    size: row.try_get::<i32, _>("size").map_err(store_err)? as usize,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(store_err)?,
                })
            })
            .collect()
    }
}
