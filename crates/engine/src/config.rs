use std::{env, io::Error, path::Path, path::PathBuf, time::Duration};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::DEFAULT_JOB_HISTORY_LIMIT;

/// Trailing-edge debounce applied to triggers when nothing is configured.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Tunables of an app session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Window in which repeated triggers of a runnable collapse into one run.
    pub debounce_ms: u64,
    /// Period of the auto-refresh timer; `None` disables periodic refresh.
    pub auto_refresh_interval_ms: Option<u64>,
    /// Jobs retained per component in the job store.
    pub job_history_limit: usize,
    /// Trigger every auto-refresh runnable once when the session starts.
    pub refresh_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            auto_refresh_interval_ms: None,
            job_history_limit: DEFAULT_JOB_HISTORY_LIMIT,
            refresh_on_start: true,
        }
    }
}

impl SessionConfig {
    /// Loads the configuration file and applies environment overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Self {
        let mut config = Self::load_from(&default_config_path());
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "ignoring unreadable session config");
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies `RUNBOARD_DEBOUNCE_MS` and `RUNBOARD_REFRESH_INTERVAL_MS` (`0` disables the timer).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(debounce_ms) = parse_override(&lookup, "RUNBOARD_DEBOUNCE_MS") {
            self.debounce_ms = debounce_ms;
        }
        if let Some(interval_ms) = parse_override(&lookup, "RUNBOARD_REFRESH_INTERVAL_MS") {
            self.auto_refresh_interval_ms = (interval_ms > 0).then_some(interval_ms);
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn auto_refresh_interval(&self) -> Option<Duration> {
        self.auto_refresh_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

/// Get the default path for the session configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("RUNBOARD_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runboard")
        .join("session.json")
}
