//! Lifecycle owner for the connection, executor and migrator.

use thiserror::Error;
use tracing::Span;

use crate::error::DbError;
use crate::migrations::{MigrationError, MigrationReport, MigrationState, Migrator};
use crate::pool::{Connection, PoolConfig, PoolStats};
use crate::tx::TxExecutor;

/// Errors surfaced by [`Manager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Opening, probing or closing the connection failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Running migrations failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Composes the connection, transaction executor and migration engine
/// into the single object a process bootstrap holds.
///
/// The manager is the only component that closes the connection.
#[derive(Debug)]
pub struct Manager {
    conn: Connection,
    executor: TxExecutor,
    migrator: Migrator,
}

impl Manager {
    /// Opens the connection and binds the executor and migrator to it.
    ///
    /// # Errors
    ///
    /// Propagates the connection's open error unchanged.
    pub fn new(config: &PoolConfig, span: Span) -> Result<Self, ManagerError> {
        let conn = Connection::open(config, span)?;
        let executor = TxExecutor::new(conn.clone());
        let migrator = Migrator::new(conn.clone());
        Ok(Self {
            conn,
            executor,
            migrator,
        })
    }

    /// Runs pending migrations from `location`. Called once at startup,
    /// before the process accepts traffic.
    ///
    /// # Errors
    ///
    /// Propagates the migrator's error unchanged.
    pub fn initialize(&self, location: &str) -> Result<MigrationReport, ManagerError> {
        let report = self.migrator.run_migrations(location)?;
        tracing::info!(
            parent: self.conn.span(),
            version = report.current,
            applied = report.applied,
            "database initialized"
        );
        Ok(report)
    }

    /// Probes the connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::health`].
    pub fn health(&self) -> Result<(), ManagerError> {
        Ok(self.conn.health()?)
    }

    /// Pool usage snapshot.
    ///
    /// # Errors
    ///
    /// See [`Connection::stats`].
    pub fn stats(&self) -> Result<PoolStats, ManagerError> {
        Ok(self.conn.stats()?)
    }

    /// Current migration state, read without loading scripts.
    ///
    /// # Errors
    ///
    /// See [`Migrator::version`].
    pub fn migration_version(&self) -> Result<MigrationState, ManagerError> {
        Ok(self.migrator.version()?)
    }

    /// Closes the connection for every component.
    ///
    /// # Errors
    ///
    /// See [`Connection::close`].
    pub fn close(&self) -> Result<(), ManagerError> {
        Ok(self.conn.close()?)
    }

    /// The shared connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The transaction executor for request code.
    pub fn executor(&self) -> &TxExecutor {
        &self.executor
    }

    /// The migration engine, for operator tooling.
    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }
}
