use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cron::{CronExpression, ScheduleError};

/// Durable user configuration: the asset server credentials plus the list of
/// monitored directories. Persisted as JSON by the daemon's config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_url: String,
    pub api_key: String,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

/// One monitored directory with its schedules.
///
/// `id` is assigned by the config store on first save and stays stable from
/// then on; the UI uses it to address manual triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default)]
    pub id: String,
    pub directory: String,
    #[serde(rename = "cronExpressions")]
    pub cron_expressions: Vec<String>,
    pub recursive: bool,
}

/// Immutable connection snapshot used for all outbound calls until the
/// config is explicitly replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub server_url: String,
    pub api_key: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server URL must not be empty")]
    EmptyServerUrl,
    #[error("path #{index}: directory must not be empty")]
    EmptyDirectory { index: usize },
    #[error("path {directory}: invalid cron expression `{expr}`: {source}")]
    InvalidCron {
        directory: String,
        expr: String,
        #[source]
        source: ScheduleError,
    },
    #[error("malformed config file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Config {
    pub fn connection(&self) -> Connection {
        Connection {
            server_url: self.server_url.trim_end_matches('/').to_string(),
            api_key: self.api_key.clone(),
        }
    }

    /// Validate the whole config. Rejection is all-or-nothing: a config that
    /// fails here is never partially applied, so an invalid schedule can
    /// never silently become "expression never fires".
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::EmptyServerUrl);
        }
        for (index, path) in self.paths.iter().enumerate() {
            if path.directory.trim().is_empty() {
                return Err(ConfigError::EmptyDirectory { index });
            }
            for expr in &path.cron_expressions {
                CronExpression::parse(expr).map_err(|source| ConfigError::InvalidCron {
                    directory: path.directory.clone(),
                    expr: expr.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}
