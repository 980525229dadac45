//! Harness configuration.
//!
//! Settings come from three layers, later layers winning: built-in
//! defaults, an optional TOML file, and `DCH_`-prefixed environment
//! variables. Env parsing collects every problem instead of failing on the
//! first one.

pub mod env;

pub use env::{EnvError, EnvOverrides};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading settings from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default)]
    pub topology: TopologySettings,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub scenario: ScenarioSettings,
}

/// Timeouts governing cluster bring-up and teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySettings {
    /// Bound for a topology to become reachable after launch.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    /// Bound for `await_stable_state` convergence.
    #[serde(default = "default_stable_timeout_secs")]
    pub stable_timeout_secs: u64,
    /// Grace period handed to each process stop during teardown.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            stable_timeout_secs: default_stable_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl TopologySettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn stable_timeout(&self) -> Duration {
        Duration::from_secs(self.stable_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Defaults for convergence polling when a call site does not override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PollSettings {
    pub fn opts(&self) -> crate::poll::PollOpts {
        crate::poll::PollOpts::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Scenario-runner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSettings {
    /// Bound for joining background operations during teardown.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl ScenarioSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

fn default_init_timeout_secs() -> u64 {
    60
}

fn default_stable_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_join_timeout_secs() -> u64 {
    30
}

impl HarnessSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default on-disk location: `<config dir>/dch/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dch").join("config.toml"))
    }

    /// Apply `DCH_`-prefixed environment overrides on top of these
    /// settings, returning any parse errors alongside the result.
    pub fn with_env_overrides(mut self) -> (Self, Vec<EnvError>) {
        let mut parser = EnvOverrides::new();
        if let Some(d) = parser.get_duration("INIT_TIMEOUT") {
            self.topology.init_timeout_secs = d.as_secs().max(1);
        }
        if let Some(d) = parser.get_duration("STABLE_TIMEOUT") {
            self.topology.stable_timeout_secs = d.as_secs().max(1);
        }
        if let Some(d) = parser.get_duration("STOP_GRACE") {
            self.topology.stop_grace_secs = d.as_secs();
        }
        if let Some(d) = parser.get_duration("POLL_INTERVAL") {
            self.poll.interval_ms = d.as_millis().max(1) as u64;
        }
        if let Some(d) = parser.get_duration("POLL_TIMEOUT") {
            self.poll.timeout_secs = d.as_secs().max(1);
        }
        if let Some(d) = parser.get_duration("JOIN_TIMEOUT") {
            self.scenario.join_timeout_secs = d.as_secs().max(1);
        }
        (self, parser.take_errors())
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = HarnessSettings::default();
        assert_eq!(settings.topology.init_timeout(), Duration::from_secs(60));
        assert_eq!(settings.poll.opts().interval, Duration::from_millis(200));
        assert_eq!(settings.scenario.join_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[topology]\ninit_timeout_secs = 5").unwrap();
        let settings = HarnessSettings::load(file.path()).unwrap();
        assert_eq!(settings.topology.init_timeout_secs, 5);
        assert_eq!(settings.topology.stable_timeout_secs, 30);
        assert_eq!(settings.poll.interval_ms, 200);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "topology = \"not a table\"").unwrap();
        match HarnessSettings::load(file.path()) {
            Err(ConfigError::Parse { .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let path = Path::new("/nonexistent/dch/config.toml");
        assert!(matches!(
            HarnessSettings::load(path),
            Err(ConfigError::Read { .. })
        ));
    }
}
