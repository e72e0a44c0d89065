// rust/fedsim-core/src/error.rs

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("The given split: '{split}' is not present in the dataset's splits: {available:?}")]
    SplitNotFound {
        split: String,
        available: Vec<String>,
    },

    #[error("The given split: '{split}' does not have a partitioner; partitioners are present for the following splits: {available:?}")]
    NoPartitioner {
        split: String,
        available: Vec<String>,
    },

    #[error("Partition {index} out of range (total partitions: {count})")]
    PartitionOutOfRange {
        index: usize,
        count: usize,
    },

    #[error("Worker pool is closed")]
    Closed,

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;

// Convenience constructors
impl SimError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn partition_out_of_range(index: usize, count: usize) -> Self {
        Self::PartitionOutOfRange { index, count }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by bad arguments or setup rather than
    /// by work that was attempted. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::SplitNotFound { .. }
                | Self::NoPartitioner { .. }
                | Self::PartitionOutOfRange { .. }
        )
    }
}

/// Category of a per-client failure recorded in the round history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The client's compute step returned an error or panicked.
    Invocation,
    /// The round deadline elapsed before the invocation finished.
    Timeout,
    /// The requirement can never be satisfied by the pool.
    ResourceExhausted,
    /// Fetching or persisting the client's state failed.
    Store,
    /// The client already had an invocation in flight.
    Busy,
    /// The work item was cancelled before producing a result.
    Cancelled,
    /// The worker pool no longer accepts work.
    Closed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invocation => "invocation",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Store => "store",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A typed, non-fatal failure of one client invocation.
///
/// Failures are values: the coordinator records them next to successful
/// results instead of propagating them.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct ClientFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ClientFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Invocation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Store, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Busy, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    /// Maps a pool submission error onto the failure a caller should record.
    pub fn from_submit_error(err: &SimError) -> Self {
        match err {
            SimError::Closed => Self::new(FailureKind::Closed, err.to_string()),
            _ => Self::new(FailureKind::ResourceExhausted, err.to_string()),
        }
    }
}
