//! Data-access infrastructure for Strata services.
//!
//! Owns the SQLite connection pool (via `r2d2`), a transaction boundary
//! with guaranteed rollback, and a versioned migration engine with
//! dirty-state detection. [`Manager`] ties the three together for the
//! process bootstrap.
//!
//! # Design decisions
//!
//! - **One shared `Connection`**: a cheap clone over the pool, handed to the
//!   executor and the migrator. Only the [`Manager`] closes it; after close
//!   every operation fails with [`DbError::Closed`] instead of blocking.
//! - **Scope-guarded transactions**: the guard rolls back on every exit path
//!   that did not commit, including a panic unwinding through the caller's
//!   closure.
//! - **Dirty-first migrations**: each step records `dirty = true` before it
//!   runs, so an interrupted step is visible and blocks further migration
//!   until an operator intervenes.
//! - **Explicit log context**: components log under a `tracing::Span` passed
//!   in at construction; the crate never installs or mutates a global
//!   subscriber.
//!
//! ```rust,ignore
//! use strata_db::{Manager, PoolConfig, TxOptions};
//!
//! let manager = Manager::new(&PoolConfig::new("app.db"), tracing::info_span!("db"))?;
//! manager.initialize("file://migrations")?;
//!
//! manager.executor().run_in_transaction(TxOptions::named("create_user"), |tx| {
//!     tx.execute("INSERT INTO users (name) VALUES (?1)", ["ada"])
//! })?;
//!
//! manager.close()?;
//! ```

mod error;
mod manager;
mod mask;
mod migrations;
mod pool;
mod tx;

pub use error::DbError;
pub use manager::{Manager, ManagerError};
pub use mask::{mask_dsn, MASK_SENTINEL, MASK_THRESHOLD};
pub use migrations::{
    Direction, EmbeddedScript, MigrationError, MigrationReport, MigrationScript, MigrationState,
    Migrator, ScriptSet, MIGRATIONS_TABLE,
};
pub use pool::{
    Connection, DbPool, PoolConfig, PoolStats, PooledConn, HEALTH_PING_TIMEOUT, OPEN_PING_TIMEOUT,
};
pub use tx::{TransactionError, Tx, TxBehavior, TxExecutor, TxOptions};
