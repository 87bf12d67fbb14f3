// Porter configuration file

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::executor::{ConnectionPool, ExecutorConfig};
use crate::guard::validation::DEFAULT_MAX_COMMAND_LENGTH;
use crate::guard::{CommandGuard, RateLimiter};
use crate::logstream::StreamOptions;
use crate::orchestrator::DeploySettings;

/// Environment variable naming the config file when `--config` is absent
pub const CONFIG_ENV: &str = "PORTER_CONFIG";

/// Config error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PorterConfig {
    pub ssh: SshSection,
    pub executor: ExecutorSection,
    pub rate_limit: RateLimitSection,
    pub validation: ValidationSection,
    pub streams: StreamSection,
    pub deploy: DeploySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub user: Option<String>,
    pub private_key: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_per_host: usize,
}

impl Default for SshSection {
    fn default() -> Self {
        SshSection {
            user: None,
            private_key: None,
            password: None,
            connect_timeout_secs: 30,
            command_timeout_secs: 300,
            max_per_host: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub retry_delay_ms: u64,
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub dry_run: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        ExecutorSection {
            retry_delay_ms: 2000,
            wait_timeout_secs: 30,
            poll_interval_ms: 1000,
            dry_run: false,
        }
    }
}

/// `max_requests` per `window_secs`, per target machine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        RateLimitSection {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    /// Regexes appended to the builtin dangerous-command heuristics
    pub extra_dangerous_patterns: Vec<String>,
    pub max_command_length: usize,
}

impl Default for ValidationSection {
    fn default() -> Self {
        ValidationSection {
            extra_dangerous_patterns: Vec::new(),
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// How long a stopped stream waits after SIGINT before closing
    pub stop_grace_ms: u64,
    /// Backlog lines shown when a follow starts
    pub initial_lines: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        StreamSection {
            stop_grace_ms: 2000,
            initial_lines: 50,
        }
    }
}

impl PorterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(PorterConfig::default());
        }
        let config: PorterConfig = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Explicit path, then `$PORTER_CONFIG`, then defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::from_file(Path::new(&path)),
                None => Ok(PorterConfig::default()),
            },
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.max_requests",
                message: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.window_secs",
                message: "must be at least 1".to_string(),
            });
        }
        if self.ssh.max_per_host == 0 {
            return Err(ConfigError::Invalid {
                field: "ssh.max_per_host",
                message: "must be at least 1".to_string(),
            });
        }
        if self.deploy.temp_root.is_empty() || !self.deploy.temp_root.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "deploy.temp_root",
                message: "must be an absolute path".to_string(),
            });
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            dry_run: self.executor.dry_run,
            default_delay: Duration::from_millis(self.executor.retry_delay_ms),
            wait_timeout: Duration::from_secs(self.executor.wait_timeout_secs),
            poll_interval: Duration::from_millis(self.executor.poll_interval_ms),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit.max_requests,
            Duration::from_secs(self.rate_limit.window_secs),
        )
    }

    pub fn command_guard(&self) -> Result<CommandGuard, ConfigError> {
        CommandGuard::new()
            .with_max_length(self.validation.max_command_length)
            .with_patterns(&self.validation.extra_dangerous_patterns)
            .map_err(|e| ConfigError::Invalid {
                field: "validation.extra_dangerous_patterns",
                message: e.plain_message(),
            })
    }

    pub fn connection_pool(&self) -> ConnectionPool {
        let mut pool = ConnectionPool::new()
            .with_max_per_host(self.ssh.max_per_host)
            .with_connect_timeout(Duration::from_secs(self.ssh.connect_timeout_secs))
            .with_command_timeout(Duration::from_secs(self.ssh.command_timeout_secs));
        if let Some(user) = &self.ssh.user {
            pool = pool.with_default_user(user.clone());
        }
        if let Some(key) = &self.ssh.private_key {
            pool = pool.with_private_key(key.clone());
        }
        if let Some(password) = &self.ssh.password {
            pool = pool.with_password(password.clone());
        }
        pool
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            lines: self.streams.initial_lines,
            grace: Duration::from_millis(self.streams.stop_grace_ms),
        }
    }
}
