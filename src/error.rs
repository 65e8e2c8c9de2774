use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NegotiationError>;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Reputation store conflict: {0}")]
    StoreConflict(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Reputation of {agent_id} is {score:.3}, below the required {required:.3}")]
    InsufficientReputation {
        agent_id: String,
        score: f64,
        required: f64,
    },
}

/// Why a settlement attempt ended as `FAILED`.
///
/// These are business outcomes carried inside `SettlementResult`, not errors
/// propagated through `Result`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VerificationFailure {
    #[error("challenge expired at {expired_at} (checked at {checked_at})")]
    ExpiredChallenge {
        expired_at: DateTime<Utc>,
        checked_at: DateTime<Utc>,
    },

    #[error("signed amount {signed} does not match challenge amount {expected}")]
    AmountMismatch { expected: f64, signed: f64 },

    #[error("invalid payment signature: {0}")]
    InvalidSignature(String),

    #[error("settlement timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl VerificationFailure {
    /// A fresh challenge can cure expiry and timeouts; a mismatch or bad
    /// signature will fail again with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerificationFailure::ExpiredChallenge { .. } | VerificationFailure::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for NegotiationError {
    fn from(err: std::io::Error) -> Self {
        NegotiationError::Io(err.to_string())
    }
}

impl From<::config::ConfigError> for NegotiationError {
    fn from(err: ::config::ConfigError) -> Self {
        NegotiationError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for NegotiationError {
    fn from(err: toml::de::Error) -> Self {
        NegotiationError::Config(format!("Failed to parse config file: {}", err))
    }
}
