use std::time::Duration;

use thiserror::Error;

use crate::fetcher::FetchError;
use crate::workflow::Stage;

#[derive(Debug, Error)]
pub enum FeedSyncError {
    #[error("command failed with exit code {exit_code}: {command}")]
    ProcessFailed { command: String, exit_code: i32 },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled before '{command}' could run")]
    Cancelled { command: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("could not convert {0} to RFC3339/ISO8601 time string")]
    MalformedTimestamp(String),

    #[error("timed out waiting for {stage} after {} seconds", .after.as_secs())]
    TimedOut { stage: String, after: Duration },

    #[error("{stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("{stage} stage failed")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<FeedSyncError>,
    },

    #[error("container discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FeedSyncError>;
