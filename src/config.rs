use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::orchestration::LateListenerPolicy;
use crate::{wlog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Tasks each build may run at once. Defaults to the available parallelism.
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub late_listeners: LateListenerPolicy,
    /// Upper bound for `weave run`, in seconds.
    pub timeout_secs: Option<u64>,
}

impl Config {
    pub fn weave_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".weave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::weave_dir()?.join("weave.toml"))
    }

    pub fn effective_workers(&self) -> usize {
        self.max_workers
            .filter(|workers| *workers > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let path = expand_tilde(&path.to_string_lossy());
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        if config.max_workers == Some(0) {
            return Err(Error::Validation(
                "max_workers must be at least 1".to_string(),
            ));
        }
        wlog_debug!(
            "Config loaded: max_workers={:?}, late_listeners={:?}, timeout_secs={:?}",
            config.max_workers,
            config.late_listeners,
            config.timeout_secs
        );
        Ok(config)
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
