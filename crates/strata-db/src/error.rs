//! Error types for the connection layer.

use thiserror::Error;

/// Errors raised by the pooled connection and its probes.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool configuration violates one of its invariants.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The pool could not be built (driver open failure).
    #[error("failed to open database connection pool for {target}: {source}")]
    Open {
        /// Masked connection target.
        target: String,
        /// The underlying pool error.
        source: r2d2::Error,
    },

    /// A liveness probe did not succeed within its time bound.
    #[error("database liveness probe failed: {0}")]
    Ping(String),

    /// No pooled connection became available.
    #[error("failed to acquire pooled connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// A statement failed in the driver.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection has been closed.
    #[error("database connection is closed")]
    Closed,
}
