//! Connection pool creation, probing and shutdown.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use r2d2::{HandleError, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use tracing::Span;

use crate::error::DbError;
use crate::mask::mask_dsn;

/// Upper bound for the liveness probe run while opening the pool.
pub const OPEN_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the liveness probe behind [`Connection::health`].
pub const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// The underlying SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of the pool.
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Pool limits and the connection target.
///
/// Built once at startup by the configuration layer and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// SQLite path or `file:` URI, optionally prefixed with `sqlite://`.
    pub url: String,

    /// Maximum number of open connections.
    pub max_open: u32,

    /// Number of idle connections the pool keeps warm. Must not exceed
    /// `max_open`.
    pub max_idle: u32,

    /// Connections older than this are closed when returned to the pool.
    pub max_lifetime: Duration,

    /// Idle connections above `max_idle` are closed after this long.
    pub max_idle_time: Duration,

    /// How long a checkout may wait for a free connection.
    pub acquire_timeout: Duration,

    /// SQLite busy timeout applied to every physical connection.
    pub busy_timeout: Duration,
}

impl PoolConfig {
    /// Creates a configuration for `url` with default limits.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_open: 10,
            max_idle: 5,
            max_lifetime: Duration::from_secs(30 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_millis(5_000),
        }
    }

    /// Checks the pool invariants.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidConfig` naming the first violated field.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.url.trim().is_empty() {
            return Err(DbError::InvalidConfig("url must not be empty".into()));
        }
        if self.max_open == 0 {
            return Err(DbError::InvalidConfig("max_open must be positive".into()));
        }
        if self.max_idle == 0 {
            return Err(DbError::InvalidConfig("max_idle must be positive".into()));
        }
        if self.max_idle > self.max_open {
            return Err(DbError::InvalidConfig(format!(
                "max_idle ({}) must not exceed max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        let durations = [
            ("max_lifetime", self.max_lifetime),
            ("max_idle_time", self.max_idle_time),
            ("acquire_timeout", self.acquire_timeout),
            ("busy_timeout", self.busy_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(DbError::InvalidConfig(format!("{field} must be positive")));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("url", &mask_dsn(&self.url))
            .field("max_open", &self.max_open)
            .field("max_idle", &self.max_idle)
            .field("max_lifetime", &self.max_lifetime)
            .field("max_idle_time", &self.max_idle_time)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

/// Point-in-time snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured ceiling.
    pub max_open: u32,
    /// Physical connections currently open.
    pub open: u32,
    /// Open connections sitting idle in the pool.
    pub idle: u32,
    /// Open connections checked out by callers.
    pub in_use: u32,
    /// Checkouts that found no idle connection and had to wait.
    pub wait_count: u64,
    /// Total time spent waiting in those checkouts.
    pub wait_duration: Duration,
}

/// Forwards connection errors raised inside the pool to `tracing`.
#[derive(Debug)]
struct TracingErrorHandler {
    target: String,
    span: Span,
}

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::error!(parent: &self.span, target_db = %self.target, error = %error, "pooled connection error");
    }
}

struct Inner {
    pool: RwLock<Option<DbPool>>,
    target: String,
    max_open: u32,
    acquire_timeout: Duration,
    busy_timeout: Duration,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    span: Span,
}

/// Shared, thread-safe handle to the connection pool.
///
/// Cloning is cheap; all clones observe the same pool and the same
/// closed state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.inner.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Opens the pool described by `config` and verifies it with a
    /// liveness probe.
    ///
    /// Log lines are emitted under `span`.
    ///
    /// # Errors
    ///
    /// - `DbError::InvalidConfig` if `config` breaks a pool invariant.
    /// - `DbError::Open` if the driver cannot establish connections.
    /// - `DbError::Ping` if the probe fails; the pool is closed first.
    pub fn open(config: &PoolConfig, span: Span) -> Result<Self, DbError> {
        config.validate()?;

        let target = mask_dsn(&config.url);
        let path = config
            .url
            .strip_prefix("sqlite://")
            .unwrap_or(&config.url)
            .to_string();

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(path)
            .with_flags(flags)
            .with_init(move |conn| {
                // In-memory databases report "memory", which is acceptable.
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" && journal_mode != "memory" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {}",
                            journal_mode
                        )),
                    ));
                }
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.busy_timeout(busy_timeout)
            });

        let pool = Pool::builder()
            .max_size(config.max_open)
            .min_idle(Some(config.max_idle))
            .max_lifetime(Some(config.max_lifetime))
            .idle_timeout(Some(config.max_idle_time))
            .connection_timeout(config.acquire_timeout)
            .error_handler(Box::new(TracingErrorHandler {
                target: target.clone(),
                span: span.clone(),
            }))
            .build(manager)
            .map_err(|source| {
                tracing::error!(parent: &span, target_db = %target, error = %source, "failed to open database pool");
                DbError::Open {
                    target: target.clone(),
                    source,
                }
            })?;

        let conn = Self {
            inner: Arc::new(Inner {
                pool: RwLock::new(Some(pool)),
                target: target.clone(),
                max_open: config.max_open,
                acquire_timeout: config.acquire_timeout,
                busy_timeout: config.busy_timeout,
                wait_count: AtomicU64::new(0),
                wait_nanos: AtomicU64::new(0),
                span,
            }),
        };

        conn.probe_or_release(OPEN_PING_TIMEOUT.min(config.acquire_timeout))?;

        tracing::info!(
            parent: &conn.inner.span,
            target_db = %target,
            max_open = config.max_open,
            max_idle = config.max_idle,
            max_lifetime_secs = config.max_lifetime.as_secs(),
            max_idle_time_secs = config.max_idle_time.as_secs(),
            "database connection pool opened"
        );

        Ok(conn)
    }

    /// Checks out a connection, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Closed` after [`close`](Self::close), or
    /// `DbError::Pool` if no connection became available in time.
    pub fn get(&self) -> Result<PooledConn, DbError> {
        self.get_timeout(self.inner.acquire_timeout)
    }

    /// Checks out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledConn, DbError> {
        let pool = self.pool()?;
        if let Some(conn) = pool.try_get() {
            return Ok(conn);
        }

        self.inner.wait_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = pool.get_timeout(timeout);
        let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.inner.wait_nanos.fetch_add(waited, Ordering::Relaxed);

        Ok(result?)
    }

    /// Runs a liveness probe bounded by [`HEALTH_PING_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::Closed` after close, otherwise `DbError::Ping`.
    pub fn health(&self) -> Result<(), DbError> {
        self.ping(HEALTH_PING_TIMEOUT)
    }

    /// Returns a snapshot of pool usage.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Closed` after close.
    pub fn stats(&self) -> Result<PoolStats, DbError> {
        let state = self.pool()?.state();
        Ok(PoolStats {
            max_open: self.inner.max_open,
            open: state.connections,
            idle: state.idle_connections,
            in_use: state.connections.saturating_sub(state.idle_connections),
            wait_count: self.inner.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(self.inner.wait_nanos.load(Ordering::Relaxed)),
        })
    }

    /// Closes the pool.
    ///
    /// Idle connections are closed immediately; connections still checked
    /// out are closed when their holders return them. Calling this again is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the shutdown path uniform
    /// with other resources.
    pub fn close(&self) -> Result<(), DbError> {
        if self.release() {
            tracing::info!(parent: &self.inner.span, target_db = %self.inner.target, "database connection pool closed");
        } else {
            tracing::debug!(parent: &self.inner.span, target_db = %self.inner.target, "database connection pool already closed");
        }
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// The masked connection target, safe to log.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// The span component log lines are emitted under.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    pub(crate) fn busy_timeout(&self) -> Duration {
        self.inner.busy_timeout
    }

    pub(crate) fn acquire_timeout(&self) -> Duration {
        self.inner.acquire_timeout
    }

    fn pool(&self) -> Result<DbPool, DbError> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DbError::Closed)
    }

    /// Drops the pool. Returns `false` if it was already gone.
    fn release(&self) -> bool {
        let taken = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        taken.is_some()
    }

    /// Probes the pool and closes it if the probe fails.
    fn probe_or_release(&self, timeout: Duration) -> Result<(), DbError> {
        if let Err(e) = self.ping(timeout) {
            tracing::error!(
                parent: &self.inner.span,
                target_db = %self.inner.target,
                error = %e,
                "database liveness probe failed during open"
            );
            self.release();
            return Err(e);
        }
        Ok(())
    }

    fn ping(&self, timeout: Duration) -> Result<(), DbError> {
        let started = Instant::now();
        let conn = self.get_timeout(timeout).map_err(|e| match e {
            DbError::Closed => DbError::Closed,
            other => DbError::Ping(other.to_string()),
        })?;

        let one: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(|e| DbError::Ping(e.to_string()))?;
        if one != 1 {
            return Err(DbError::Ping(format!("unexpected probe result {one}")));
        }
        if started.elapsed() > timeout {
            return Err(DbError::Ping(format!(
                "probe exceeded {}ms",
                timeout.as_millis()
            )));
        }
        Ok(())
    }
}
