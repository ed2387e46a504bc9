//! Transaction boundary over the shared connection.
//!
//! [`TxExecutor::run_in_transaction`] checks out a pooled connection, begins
//! a transaction, hands the caller a [`Tx`] handle and then commits or rolls
//! back. The begin/end pair is owned by a scope guard whose `Drop` rolls
//! back any transaction still open, so early returns and panics unwinding
//! through the caller's closure never leave a transaction open on a pooled
//! connection.

use std::fmt;
use std::ops::Deref;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::Span;

use crate::error::DbError;
use crate::pool::Connection;

/// Lock acquisition mode for `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxBehavior {
    /// Locks are taken on first read/write.
    #[default]
    Deferred,
    /// The write lock is taken at `BEGIN`.
    Immediate,
    /// Readers are excluded as well.
    Exclusive,
}

impl TxBehavior {
    fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Per-call transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Operation name used in logs and errors.
    pub name: &'static str,
    /// Lock acquisition mode.
    pub behavior: TxBehavior,
    /// Reject writes for the duration of the transaction.
    pub read_only: bool,
    /// Deadline measured from the call. Bounds the pool checkout and every
    /// lock wait inside the transaction.
    pub timeout: Option<Duration>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            name: "transaction",
            behavior: TxBehavior::Deferred,
            read_only: false,
            timeout: None,
        }
    }
}

impl TxOptions {
    /// Default options with an operation name.
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Takes the write lock at `BEGIN`.
    pub fn immediate(mut self) -> Self {
        self.behavior = TxBehavior::Immediate;
        self
    }

    /// Takes an exclusive lock at `BEGIN`.
    pub fn exclusive(mut self) -> Self {
        self.behavior = TxBehavior::Exclusive;
        self
    }

    /// Marks the transaction read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sets a deadline relative to the start of the call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Errors produced by [`TxExecutor::run_in_transaction`].
///
/// `E` is the caller's own error type. It is never replaced by a
/// transaction error: either it comes back alone in `Operation`, or
/// together with the rollback failure in `Rollback`.
#[derive(Debug, Error)]
pub enum TransactionError<E> {
    /// The transaction could not be started; the closure was not invoked.
    #[error("transaction '{name}': begin failed: {source}")]
    Begin {
        /// Operation name.
        name: &'static str,
        /// Checkout or `BEGIN` failure.
        source: DbError,
    },

    /// The closure failed and the transaction was rolled back.
    #[error(transparent)]
    Operation(E),

    /// The closure succeeded but `COMMIT` failed.
    #[error("transaction '{name}': commit failed: {source}")]
    Commit {
        /// Operation name.
        name: &'static str,
        /// The driver error.
        source: rusqlite::Error,
    },

    /// The closure failed and the rollback failed too.
    #[error("{source} (rollback also failed: {rollback})")]
    Rollback {
        /// The closure's error.
        source: E,
        /// The rollback failure.
        rollback: rusqlite::Error,
    },

    /// The deadline passed before the transaction could commit; it was
    /// rolled back instead.
    #[error("transaction '{name}': deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Operation name.
        name: &'static str,
        /// Time spent in the call.
        elapsed: Duration,
    },
}

impl<E> TransactionError<E> {
    /// The closure's error, if the closure failed.
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) | Self::Rollback { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Consumes the error, returning the closure's error if there is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) | Self::Rollback { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Handle to the active transaction, passed to the caller's closure.
///
/// Dereferences to the underlying connection for `execute`, `query_row`
/// and friends. Only valid for the duration of the closure.
pub struct Tx<'c> {
    conn: &'c rusqlite::Connection,
    name: &'static str,
}

impl Tx<'_> {
    /// The operation name this transaction runs under.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Deref for Tx<'_> {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx").field("name", &self.name).finish()
    }
}

/// Owns one open transaction and the connection settings changed for it.
struct TxScope<'c> {
    conn: &'c rusqlite::Connection,
    name: &'static str,
    active: bool,
    read_only: bool,
    restore_busy: Option<Duration>,
    span: Span,
}

impl<'c> TxScope<'c> {
    fn begin(
        conn: &'c rusqlite::Connection,
        opts: &TxOptions,
        busy_timeout: Duration,
        deadline: Option<Instant>,
        span: &Span,
    ) -> rusqlite::Result<Self> {
        let mut scope = Self {
            conn,
            name: opts.name,
            active: false,
            read_only: false,
            restore_busy: None,
            span: span.clone(),
        };

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            conn.busy_timeout(remaining.min(busy_timeout))?;
            scope.restore_busy = Some(busy_timeout);
        }
        if opts.read_only {
            conn.pragma_update(None, "query_only", true)?;
            scope.read_only = true;
        }

        conn.execute_batch(opts.behavior.begin_sql())?;
        scope.active = true;
        Ok(scope)
    }

    fn handle(&self) -> Tx<'c> {
        Tx {
            conn: self.conn,
            name: self.name,
        }
    }

    fn commit(&mut self) -> rusqlite::Result<()> {
        let result = self.conn.execute_batch("COMMIT");
        // A failed COMMIT can leave the transaction open (e.g. SQLITE_BUSY);
        // in that case Drop rolls it back before the connection is reused.
        self.active = !self.conn.is_autocommit();
        result
    }

    fn rollback(&mut self) -> rusqlite::Result<()> {
        self.active = false;
        let result = self.conn.execute_batch("ROLLBACK");
        if result.is_err() && !self.conn.is_autocommit() {
            self.active = true;
        }
        result
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.active {
            let unwinding = std::thread::panicking();
            match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => tracing::warn!(
                    parent: &self.span,
                    name = self.name,
                    unwinding,
                    "open transaction rolled back on scope exit"
                ),
                Err(e) => tracing::error!(
                    parent: &self.span,
                    name = self.name,
                    unwinding,
                    error = %e,
                    "rollback on scope exit failed"
                ),
            }
        }
        if self.read_only {
            if let Err(e) = self.conn.pragma_update(None, "query_only", false) {
                tracing::error!(parent: &self.span, name = self.name, error = %e, "failed to clear query_only");
            }
        }
        if let Some(busy) = self.restore_busy {
            if let Err(e) = self.conn.busy_timeout(busy) {
                tracing::error!(parent: &self.span, name = self.name, error = %e, "failed to restore busy_timeout");
            }
        }
    }
}

/// Runs units of work inside begin/commit-or-rollback boundaries.
///
/// Holds no lock across calls; concurrent calls are independent and rely
/// on the pool for physical connections.
#[derive(Debug, Clone)]
pub struct TxExecutor {
    conn: Connection,
    span: Span,
}

impl TxExecutor {
    /// Creates an executor over `conn`.
    pub fn new(conn: Connection) -> Self {
        let span = tracing::info_span!(parent: conn.span(), "tx_executor");
        Self { conn, span }
    }

    /// Runs `f` in a transaction with default options.
    ///
    /// # Errors
    ///
    /// See [`run_in_transaction`](Self::run_in_transaction).
    pub fn run<T, E, F>(&self, f: F) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: fmt::Display,
    {
        self.run_in_transaction(TxOptions::default(), f)
    }

    /// Runs `f` exactly once inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If
    /// `f` panics the transaction is rolled back while unwinding and the
    /// panic continues to the caller.
    ///
    /// # Errors
    ///
    /// - `Begin` if no connection could be checked out or `BEGIN` failed.
    /// - `Operation` with `f`'s error after a successful rollback.
    /// - `Rollback` with `f`'s error and the rollback failure.
    /// - `Commit` if `COMMIT` failed.
    /// - `DeadlineExceeded` if `opts.timeout` elapsed before commit.
    pub fn run_in_transaction<T, E, F>(
        &self,
        opts: TxOptions,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: fmt::Display,
    {
        let name = opts.name;
        let started = Instant::now();
        let deadline = opts.timeout.map(|timeout| started + timeout);
        let acquire = match opts.timeout {
            Some(timeout) => timeout.min(self.conn.acquire_timeout()),
            None => self.conn.acquire_timeout(),
        };

        let pooled = self.conn.get_timeout(acquire).map_err(|source| {
            tracing::error!(parent: &self.span, name, error = %source, "failed to acquire connection for transaction");
            TransactionError::Begin { name, source }
        })?;

        let mut scope = TxScope::begin(
            &pooled,
            &opts,
            self.conn.busy_timeout(),
            deadline,
            &self.span,
        )
        .map_err(|e| {
            tracing::error!(parent: &self.span, name, error = %e, "failed to begin transaction");
            TransactionError::Begin {
                name,
                source: DbError::Sqlite(e),
            }
        })?;

        let outcome = f(&scope.handle());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                if deadline.is_some_and(|d| Instant::now() > d) {
                    let elapsed = started.elapsed();
                    if let Err(e) = scope.rollback() {
                        tracing::error!(parent: &self.span, name, error = %e, "rollback after deadline failed");
                    }
                    tracing::warn!(parent: &self.span, name, elapsed_ms, "transaction deadline exceeded, rolled back");
                    return Err(TransactionError::DeadlineExceeded { name, elapsed });
                }

                match scope.commit() {
                    Ok(()) => {
                        tracing::debug!(parent: &self.span, name, elapsed_ms, "transaction committed");
                        Ok(value)
                    }
                    Err(source) => {
                        tracing::error!(parent: &self.span, name, elapsed_ms, error = %source, "transaction commit failed");
                        Err(TransactionError::Commit { name, source })
                    }
                }
            }
            Err(err) => match scope.rollback() {
                Ok(()) => {
                    tracing::warn!(parent: &self.span, name, elapsed_ms, error = %err, "transaction rolled back");
                    Err(TransactionError::Operation(err))
                }
                Err(rollback) => {
                    tracing::error!(
                        parent: &self.span,
                        name,
                        elapsed_ms,
                        error = %err,
                        rollback_error = %rollback,
                        "transaction rollback failed"
                    );
                    Err(TransactionError::Rollback {
                        source: err,
                        rollback,
                    })
                }
            },
        }
    }

    /// The connection this executor runs on.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
