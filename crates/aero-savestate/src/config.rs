use std::env;

use thiserror::Error;

const MIB: u64 = 1024 * 1024;
const DEFAULT_CAPACITY_MB: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be one of 1/true/on or 0/false/off, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} must be a whole number of megabytes, got {value:?}")]
    InvalidCapacity { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewindConfig {
    pub enabled: bool,
    /// Byte budget shared by all rewind states.
    pub capacity_bytes: u64,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity_bytes: DEFAULT_CAPACITY_MB * MIB,
        }
    }
}

impl RewindConfig {
    pub fn with_capacity_mb(mut self, megabytes: u64) -> Self {
        self.capacity_bytes = megabytes.saturating_mul(MIB);
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// Environment variables: `AERO_REWIND`, `AERO_REWIND_CAPACITY_MB`. Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("AERO_REWIND") {
            config.enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        var: "AERO_REWIND",
                        value,
                    })
                }
            };
        }

        if let Some(value) = lookup("AERO_REWIND_CAPACITY_MB") {
            let megabytes = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidCapacity {
                    var: "AERO_REWIND_CAPACITY_MB",
                    value: value.clone(),
                })?;
            config = config.with_capacity_mb(megabytes);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RewindConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RewindConfig::default());
        assert!(!config.enabled);
        assert_eq!(config.capacity_bytes, 100 * MIB);
    }

    #[test]
    fn parses_enabled_and_capacity() {
        let config = RewindConfig::from_lookup(lookup(&[
            ("AERO_REWIND", " On "),
            ("AERO_REWIND_CAPACITY_MB", "16"),
        ]))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.capacity_bytes, 16 * MIB);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = RewindConfig::from_lookup(lookup(&[("AERO_REWIND", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));

        let err =
            RewindConfig::from_lookup(lookup(&[("AERO_REWIND_CAPACITY_MB", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCapacity { .. }));
    }
}
