//! Error types for the log trigger provider.

use std::io;

use thiserror::Error;

use crate::types::UpkeepId;

/// Errors that can occur while ingesting and recovering trigger logs.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to load or parse configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The log trigger config supplied for a filter is unusable.
    #[error("invalid log trigger config: {0}")]
    InvalidTriggerConfig(&'static str),

    /// A filter with a newer config is already registered.
    #[error("filter for upkeep with id {0} already registered with newer config")]
    StaleFilterConfig(UpkeepId),

    /// The latest block could not be fetched.
    #[error("latest block not available: {0}")]
    HeadNotAvailable(Box<Error>),

    /// The log poller rejected or failed a request.
    #[error("log poller error: {0}")]
    Poller(String),

    /// JSON-RPC error returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// One or more filters failed while reading logs.
    #[error("fetched logs with {} errors: {}", .0.len(), join_errors(.0))]
    ReadLogs(Vec<Error>),

    /// Reading logs for a single filter failed.
    #[error("failed to get logs for upkeep {upkeep_id}: {source}")]
    FilterRead {
        /// Upkeep whose filter failed.
        upkeep_id: UpkeepId,
        /// Underlying failure.
        source: Box<Error>,
    },

    /// Failed to pack a log into check data.
    #[error("failed to pack log data: {0}")]
    Pack(String),

    /// A recovery proposal failed re-validation.
    #[error("{0}")]
    Proposal(String),

    /// Recovering the logs of a filter failed.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// The pending queue of an upkeep is full.
    #[error("upkeep {0} has too many payloads in pending queue")]
    PendingQueueFull(UpkeepId),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to parse response.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

impl Error {
    pub(crate) fn proposal(message: impl Into<String>) -> Self {
        Self::Proposal(message.into())
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
