use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{rlog_debug, Error, Result};

/// Default bound on concurrent operations within one batch.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub state_dir: Option<String>,
    pub concurrency_limit: Option<usize>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_timeout_secs: Option<u64>,
    pub breaker_success_threshold: Option<u32>,
}

impl Config {
    pub fn relay_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".relay"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::relay_dir()?.join("relay.toml"))
    }

    /// Directory holding per-workflow checkpoint files.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::relay_dir()?.join("state")),
        }
    }

    pub fn effective_concurrency_limit(&self) -> usize {
        self.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        rlog_debug!(
            "Config loaded: state_dir={:?}, concurrency_limit={:?}",
            config.state_dir,
            config.concurrency_limit
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let relay_dir = Self::relay_dir()?;
        rlog_debug!("Config::save relay_dir={}", relay_dir.display());
        if !relay_dir.exists() {
            rlog_debug!("Creating relay directory");
            fs::create_dir_all(&relay_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let relay_dir = Self::relay_dir()?;
        let state_dir = self.state_dir()?;
        rlog_debug!(
            "Config::ensure_dirs relay={} state={}",
            relay_dir.display(),
            state_dir.display()
        );
        if !relay_dir.exists() {
            fs::create_dir_all(&relay_dir)?;
        }
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
