//! Server configuration.
//!
//! Loaded from an optional YAML/TOML file and overlaid by `CINDER__*`
//! environment variables, e.g. `CINDER__AGENT__SECRET` or
//! `CINDER__QUEUE__LEASE_TIMEOUT_SECS`.

use cinder_bus::BusConfig;
use cinder_compiler::{CompilerOptions, MatrixLimits};
use cinder_scheduler::{QueueConfig, RetryConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "CINDER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: HttpConfig,
    pub agent: SecretConfig,
    pub admin: SecretConfig,
    pub queue: QueueSettings,
    pub bus: BusSettings,
    pub compiler: CompilerSettings,
    pub store: StoreSettings,
    pub remote: RemoteSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
    /// Public base URL used in build links and status callbacks.
    pub link: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            link: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub lease_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 600,
            reap_interval_secs: 30,
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub buffer_size: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    pub default_platform: String,
    pub escalated: Vec<String>,
    pub workspace_base: String,
    pub max_axes: usize,
    pub max_variables: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        let options = CompilerOptions::default();
        Self {
            default_platform: options.default_platform,
            escalated: options.escalated,
            workspace_base: options.workspace_base,
            max_axes: options.limits.max_axes,
            max_variables: options.limits.max_variables,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// PostgreSQL URL. Records are kept in memory when unset.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            retry_attempts: 5,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Root directory holding `<owner>/<name>/<config_file>`.
    pub config_dir: PathBuf,
    pub config_file: String,
    pub signature_file: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/lib/cinder/repos"),
            config_file: ".cinder.yml".to_string(),
            signature_file: ".cinder.yml.sig".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: ServerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("compiler.escalated")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.secret.is_empty() {
            anyhow::bail!("agent.secret must be set");
        }
        if self.admin.secret.is_empty() {
            anyhow::bail!("admin.secret must be set");
        }
        if self.agent.secret == self.admin.secret {
            anyhow::bail!("agent.secret and admin.secret must differ");
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_lease_timeout(Duration::from_secs(self.queue.lease_timeout_secs.max(1)))
            .with_reap_interval(Duration::from_secs(self.queue.reap_interval_secs.max(1)))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.poll_timeout_secs.max(1))
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig::default().with_buffer_size(self.bus.buffer_size)
    }

    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions::default()
            .with_default_platform(self.compiler.default_platform.clone())
            .with_escalated(self.compiler.escalated.clone())
            .with_workspace_base(self.compiler.workspace_base.clone())
            .with_link(self.server.link.clone())
            .with_limits(MatrixLimits {
                max_axes: self.compiler.max_axes,
                max_variables: self.compiler.max_variables,
            })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
            .with_attempts(self.store.retry_attempts)
            .with_delay(Duration::from_millis(self.store.retry_delay_ms))
    }
}
