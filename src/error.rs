//! Error kinds shared across the analytics pipeline.
//!
//! Leaf storage fetches fail immediately; aggregators of parallel fetches
//! fail atomically on the first sibling error. Calculators treat missing
//! data as null samples, never as errors.

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A backing store failed to respond. Fails the query.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),

    /// A storage operation exceeded its deadline. Fails the query.
    #[error("storage operation timed out after {0:?}")]
    StorageTimeout(Duration),

    /// The DAG crawl could not find a requested commit sha.
    #[error("commit {sha} not found in {repo}")]
    MissingCommit { repo: String, sha: String },

    /// Invalid regex, unknown match kind, or an empty required field in a
    /// release-matching rule. Detected at validation time.
    #[error("invalid release matching rule: {0}")]
    RuleConfig(String),

    /// Entity not visible to the caller (404-equivalent).
    #[error("{0} not found")]
    NotFound(String),

    /// The caller lacks access. Surfaced as 404 to not reveal existence.
    #[error("access to {0} denied")]
    PermissionDenied(String),

    /// Unique-constraint violation on insert (409-equivalent).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request schema violation: window order, bad enum, unknown metric id
    /// (400-equivalent).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Internal invariant broken. `debug_assert!` fires first in debug
    /// builds; release builds surface this as a 500-equivalent.
    #[error("internal invariant broken: {0}")]
    Internal(String),
}

impl Error {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Error::StorageUnavailable(err.into())
    }

    /// Whether the error should be reported to the caller as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::PermissionDenied(_))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::StorageUnavailable(err.into())
    }
}
