//! Process-level settings, read once at start-up.
//!
//! Sources, highest wins:
//! 1. `SCHOOLD_*` environment variables (`SCHOOLD_LOG`, `SCHOOLD_WORKSPACE`,
//!    `SCHOOLD_BUSY_TIMEOUT_MS`)
//! 2. Built-in defaults
//!
//! Workspace-level settings live in the workspace database instead
//! (`setup.get` / `setup.update`).

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "warn";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Tracing filter directive.
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: DEFAULT_LOG_FILTER.to_string(),
            workspace: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::prefixed("SCHOOLD_"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let cfg: Self = Self::figment().extract()?;
        Ok(cfg.normalized())
    }

    /// Blank variables count as unset.
    fn normalized(mut self) -> Self {
        if self.log.trim().is_empty() {
            self.log = DEFAULT_LOG_FILTER.to_string();
        }
        self.workspace = self
            .workspace
            .filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty());
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
