//! Environment variable overrides with error collection.
//!
//! All harness variables share the `DCH_` prefix. Parsing never fails
//! fast: bad values fall back to the built-in default and the error is
//! collected so every misconfiguration can be reported at once.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while parsing environment overrides.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: '{value}' ({reason})")]
    InvalidDuration {
        var: String,
        value: String,
        reason: String,
    },
}

/// Parser for `DCH_`-prefixed environment variables.
pub struct EnvOverrides {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self {
            prefix: "DCH_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// A string value, when the variable is set.
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        env::var(self.var_name(name)).ok()
    }

    /// A boolean value. Accepts 1/true/yes/on and 0/false/no/off.
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// A duration in humantime notation ("200ms", "30s", "5m").
    ///
    /// Bare integers are accepted as seconds, matching the corpus's
    /// convention of second-valued timeout knobs.
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        match humantime::parse_duration(&value) {
            Ok(duration) => Some(duration),
            Err(err) => {
                self.errors.push(EnvError::InvalidDuration {
                    var: var_name,
                    value,
                    reason: err.to_string(),
                });
                None
            }
        }
    }

    /// A u64 value.
    pub fn get_u64(&mut self, name: &str) -> Option<u64> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
        match value.parse::<u64>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                None
            }
        }
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::new()
    }
}
