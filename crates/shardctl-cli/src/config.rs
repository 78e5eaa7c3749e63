//! Tool configuration.
//!
//! Values resolve in order: defaults, then the TOML file, then env vars and
//! flags (see `apply_args` in main). The result is converted into the
//! library's tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardctl_cluster::{ClusterConfig, MigrationConfig, PollConfig, RetryPolicy, TransferOptions};

use crate::driver::ConnectSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Connect and per-command socket timeout.
    pub timeout_ms: u64,
    /// AUTH password; empty means none.
    pub password: String,
    /// Give up cluster-wide waits after this long; 0 waits forever.
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry: RetrySection,
    pub migration: MigrationSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub transport_attempts: u32,
    pub transport_backoff_ms: u64,
    pub loading_attempts: u32,
    pub loading_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    /// Keys fetched per GETKEYSINSLOT round.
    pub batch_size: usize,
    pub key_timeout_ms: u64,
    pub copy: bool,
    pub replace: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            password: String::new(),
            wait_timeout_secs: 0,
            poll_interval_ms: 1_000,
            retry: RetrySection::default(),
            migration: MigrationSection::default(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            transport_attempts: policy.transport_retries,
            transport_backoff_ms: policy.transport_backoff.as_millis() as u64,
            loading_attempts: policy.loading_retries,
            loading_backoff_ms: policy.loading_backoff.as_millis() as u64,
        }
    }
}

impl Default for MigrationSection {
    fn default() -> Self {
        let config = MigrationConfig::default();
        Self {
            batch_size: config.batch_size,
            key_timeout_ms: config.transfer.timeout_ms,
            copy: config.transfer.copy,
            replace: config.transfer.replace,
        }
    }
}

impl AdminConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let cfg: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        if self.migration.batch_size == 0 {
            return Err(ConfigError::Invalid("migration.batch_size must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            password: (!self.password.is_empty()).then(|| self.password.clone()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            transport_retries: self.retry.transport_attempts,
            transport_backoff: Duration::from_millis(self.retry.transport_backoff_ms),
            loading_retries: self.retry.loading_attempts,
            loading_backoff: Duration::from_millis(self.retry.loading_backoff_ms),
        }
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            migration: MigrationConfig {
                batch_size: self.migration.batch_size,
                transfer: TransferOptions {
                    timeout_ms: self.migration.key_timeout_ms,
                    copy: self.migration.copy,
                    replace: self.migration.replace,
                },
            },
            poll: PollConfig {
                interval: Duration::from_millis(self.poll_interval_ms),
                timeout: (self.wait_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.wait_timeout_secs)),
            },
        }
    }
}
