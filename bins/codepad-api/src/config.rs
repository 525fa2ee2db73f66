use codepad_common::config::{parse_or, BrokerConfig};
use codepad_common::ConfigError;
use std::net::SocketAddr;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub addr: SocketAddr,
    pub broker: BrokerConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_addr = DEFAULT_API_ADDR
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "API_ADDR".to_string(),
                value: DEFAULT_API_ADDR.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            addr: parse_or(&lookup, "API_ADDR", default_addr)?,
            broker: BrokerConfig::from_lookup(&lookup)?,
        })
    }
}
