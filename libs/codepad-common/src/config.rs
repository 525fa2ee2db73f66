// Broker configuration shared by the API, the worker and the CLI.
// Read once at start-up from the environment.

use crate::error::ConfigError;
use std::str::FromStr;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RETENTION_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub redis_url: String,
    /// How long terminal jobs stay pollable
    pub retention_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests never touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let retention_secs = parse_or(&lookup, "JOB_RETENTION_SECS", defaults.retention_secs)?;
        if retention_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_RETENTION_SECS".to_string(),
                value: "0".to_string(),
                reason: "terminal jobs must stay pollable for at least one second".to_string(),
            });
        }

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            retention_secs,
        })
    }
}

/// Parse `key` with `FromStr`, falling back to `default` when unset or blank.
pub fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = BrokerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = BrokerConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://broker:6380"),
            ("JOB_RETENTION_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.redis_url, "redis://broker:6380");
        assert_eq!(config.retention_secs, 30);
    }

    #[test]
    fn test_rejects_bad_retention() {
        let err = BrokerConfig::from_lookup(lookup_from(&[("JOB_RETENTION_SECS", "soon")]));
        assert!(matches!(err, Err(ConfigError::Invalid { ref key, .. }) if key == "JOB_RETENTION_SECS"));

        let zero = BrokerConfig::from_lookup(lookup_from(&[("JOB_RETENTION_SECS", "0")]));
        assert!(zero.is_err());
    }

    #[test]
    fn test_blank_value_uses_default() {
        let lookup = lookup_from(&[("N", "  ")]);
        assert_eq!(parse_or(&lookup, "N", 7u32).unwrap(), 7);
    }
}
