//! Core error types.

use thiserror::Error;

/// Errors surfaced by the resolution core.
///
/// Cache staleness, index invalidation, and generation mismatches are never
/// errors; they fall back transparently to re-resolution. The variants here
/// cover the database boundary and resource construction.
#[derive(Debug, Error)]
pub enum Error {
    /// The database executor failed to run a query.
    #[error("database error: {0}")]
    Database(String),

    /// The bounded filter worker pool could not be built.
    #[error("worker pool error: {0}")]
    WorkerPool(String),

    /// A predicate was constructed against the API contract.
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),
}
