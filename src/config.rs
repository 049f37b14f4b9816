use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::Error, provider::ProviderId};

const POLL_INTERVAL_ENV: &str = "TIREX_TRACKER_POLL_INTERVAL_MS";
const PROVIDERS_ENV: &str = "TIREX_TRACKER_PROVIDERS";

/// The process whose resource use a [`Tracker`](crate::Tracker) reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackedProcess {
    /// The calling process.
    #[default]
    Current,
    /// A child of the calling process, by pid. Its CPU time is only accounted once it
    /// has been waited for, so wait for it before the session stops.
    Child(u32),
}

impl TrackedProcess {
    pub fn pid(self) -> u32 {
        match self {
            TrackedProcess::Current => std::process::id(),
            TrackedProcess::Child(pid) => pid,
        }
    }
}

/// Settings of a [`Tracker`](crate::Tracker).
///
/// ```toml
/// poll_interval_ms = 50
/// providers = ["os", "time|cpu"]
/// git_dir = "/path/to/experiment"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// How often continuously sampled providers poll the system.
    pub poll_interval_ms: u64,
    /// Regex patterns selecting the enabled providers by name. Empty enables all of them.
    pub providers: Vec<String>,
    /// Directory the git provider inspects; the working directory if unset.
    pub git_dir: Option<PathBuf>,
    /// Process the process-scoped measures describe. Not read from files.
    #[serde(skip)]
    pub process: TrackedProcess,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            providers: Vec::new(),
            git_dir: None,
            process: TrackedProcess::Current,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The defaults, overridden by `TIREX_TRACKER_POLL_INTERVAL_MS` and
    /// `TIREX_TRACKER_PROVIDERS` (comma-separated patterns) when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(POLL_INTERVAL_ENV) {
            match raw.parse() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => log::warn!("ignoring {POLL_INTERVAL_ENV}={raw}: not a number"),
            }
        }
        if let Ok(raw) = std::env::var(PROVIDERS_ENV) {
            self.providers = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The providers selected by the `providers` patterns.
    pub fn enabled_providers(&self) -> Result<Vec<ProviderId>, Error> {
        let filters = self
            .providers
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$")).map_err(|source| Error::ProviderFilter {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ProviderId::ALL
            .iter()
            .copied()
            .filter(|id| filters.is_empty() || filters.iter().any(|f| f.is_match(id.name())))
            .collect())
    }
}
