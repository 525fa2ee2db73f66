use thiserror::Error;

/// Errors surfaced by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The submission was malformed and rejected before enqueueing
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The job never existed or its retention window has passed
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("broker unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

/// Errors raised while reading start-up configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
