//! Error types for the spaudit core.

use std::time::Duration;

use spaudit_resilience::{GovernorError, RetryError, Retryable};
use thiserror::Error;

use crate::model::Table;

/// Errors returned by a remote capability call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote answered with a non-success status code.
    #[error("remote returned status {status}: {message}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Message from the remote.
        message: String,
    },

    /// The remote did not answer in time.
    #[error("remote call timed out")]
    Timeout,

    /// The connection failed before a status was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Convenience constructor for a 404.
    pub fn not_found(what: impl Into<String>) -> Self {
        RemoteError::Status {
            status: 404,
            message: what.into(),
        }
    }

    /// Convenience constructor for a 503.
    pub fn unavailable(what: impl Into<String>) -> Self {
        RemoteError::Status {
            status: 503,
            message: what.into(),
        }
    }

    /// Status code, if the remote answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Timeout | RemoteError::Transport(_) => true,
            RemoteError::Malformed(_) => false,
        }
    }
}

/// Error of a remote call made through the resilient gateway.
pub type GatewayError = RetryError<RemoteError>;

/// Errors from the inventory/checkpoint storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure on the journal file.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A row or checkpoint could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row was written to a table it does not belong to.
    #[error("row for table {found} written to table {expected}")]
    TableMismatch {
        /// Table named by the call.
        expected: Table,
        /// Table the row belongs to.
        found: Table,
    },

    /// A journal line could not be replayed.
    #[error("corrupt journal at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },
}

/// Errors from the cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A value could not be encoded.
    #[error("cache encode error: {0}")]
    Encode(String),

    /// A stored value could not be decoded as the requested type.
    #[error("cache decode error: {0}")]
    Decode(String),

    /// The backend itself failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Errors that abort a crawl as a whole. Per-site and per-folder failures are collected in
/// the crawl report instead.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The site enumeration failed, including its fallback.
    #[error("site listing failed: {0}")]
    SiteListing(#[source] GatewayError),

    /// Persisting inventory or checkpoints failed.
    #[error("storage error during crawl: {0}")]
    Store(#[from] StoreError),
}

/// Errors from resolving one object's permissions.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A required remote call failed.
    #[error("remote call for {object_id} failed: {source}")]
    Remote {
        /// Object being resolved.
        object_id: String,
        /// Underlying failure.
        #[source]
        source: GatewayError,
    },

    /// No batch slot could be acquired.
    #[error(transparent)]
    Governor(#[from] GovernorError),
}

/// Errors raised by a pipeline stage. Any of these is fatal to the run.
#[derive(Debug, Error)]
pub enum StageError {
    /// The crawl failed.
    #[error(transparent)]
    Crawl(#[from] CrawlError),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A governor was closed or saturated.
    #[error(transparent)]
    Governor(#[from] GovernorError),

    /// Any other stage failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage failed; the run is marked failed and can be resumed.
    #[error("stage {stage} failed: {source}")]
    StageFailed {
        /// Failing stage.
        stage: String,
        /// Stage error.
        #[source]
        source: StageError,
    },

    /// The global run timeout elapsed.
    #[error("run timed out after {0:?}")]
    TimedOut(Duration),

    /// The run already reached a terminal state.
    #[error("run {run_id} already finished with status {status}")]
    AlreadyFinished {
        /// Run id.
        run_id: String,
        /// Terminal status.
        status: String,
    },

    /// Storage failed outside a stage.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The file extension is neither `.toml` nor `.json`.
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
