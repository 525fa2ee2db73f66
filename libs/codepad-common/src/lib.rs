pub mod config;
pub mod connection;
pub mod error;
pub mod queue;
pub mod types;

pub use error::{BrokerError, BrokerResult, ConfigError};
