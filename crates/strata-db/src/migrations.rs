//! Versioned SQL migration engine.
//!
//! Scripts are paired `{version}_{description}.up.sql` /
//! `{version}_{description}.down.sql` files, loaded either from a directory
//! or from strings embedded at compile time. Progress is tracked in a
//! single-row `schema_migrations` table holding the current version and a
//! dirty flag.
//!
//! Every step first records `dirty = true` for the version it is about to
//! touch, then runs the script and records the clean result in one
//! transaction. A script that fails therefore leaves the database dirty at
//! that version, and a dirty database is refused by every mutating call
//! until an operator repairs it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tracing::Span;

use crate::error::DbError;
use crate::pool::Connection;
use crate::tx::{TransactionError, Tx, TxExecutor, TxOptions};

/// Name of the version tracking table.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Script direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Forward (`.up.sql`).
    Up,
    /// Reverse (`.down.sql`).
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Errors that can occur while loading or running migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A previous step was interrupted. Requires manual repair.
    #[error("database is dirty at migration version {version}; repair it manually before migrating")]
    Dirty {
        /// The version that was being applied or reverted.
        version: u64,
    },

    /// A forward script failed. The database is left dirty at `version`.
    #[error("migration {version} failed: {source}")]
    Apply {
        /// The version whose up script failed.
        version: u64,
        /// The underlying failure.
        source: TransactionError<rusqlite::Error>,
    },

    /// A reverse script failed. The database is left dirty at `version`.
    #[error("rollback of migration {version} failed: {source}")]
    Rollback {
        /// The version whose down script failed.
        version: u64,
        /// The underlying failure.
        source: TransactionError<rusqlite::Error>,
    },

    /// The script needed for a step does not exist.
    #[error("no {direction} script for migration version {version}")]
    MissingScript {
        /// Requested version.
        version: u64,
        /// Requested direction.
        direction: Direction,
    },

    /// Two files claim the same version and direction.
    #[error("duplicate {direction} script for migration version {version}: {file}")]
    DuplicateVersion {
        /// The conflicting version.
        version: u64,
        /// The conflicting direction.
        direction: Direction,
        /// The second file seen.
        file: String,
    },

    /// A script file carries a version outside `1..=i64::MAX`.
    #[error("invalid migration version in {file}")]
    InvalidVersion {
        /// The offending file name.
        file: String,
    },

    /// The script location could not be read.
    #[error("failed to read migration scripts from {location}: {source}")]
    Source {
        /// The location as given.
        location: String,
        /// The I/O failure.
        source: std::io::Error,
    },

    /// The tracking table could not be queried.
    #[error("failed to read migration state: {0}")]
    StateRead(rusqlite::Error),

    /// The tracking table could not be written.
    #[error("failed to record migration state: {0}")]
    StateWrite(TransactionError<rusqlite::Error>),

    /// No connection was available.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Version and dirty flag read from the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationState {
    /// Last fully applied version; 0 when nothing has been applied.
    pub version: u64,
    /// Set while a step is in flight, and left set if it failed.
    pub dirty: bool,
}

impl MigrationState {
    fn clean(version: u64) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    fn dirty(version: u64) -> Self {
        Self {
            version,
            dirty: true,
        }
    }
}

/// Outcome of a migration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version before the call.
    pub previous: u64,
    /// Version after the call.
    pub current: u64,
    /// Number of scripts run.
    pub applied: usize,
}

impl MigrationReport {
    fn unchanged(version: u64) -> Self {
        Self {
            previous: version,
            current: version,
            applied: 0,
        }
    }
}

/// One migration version with its forward and reverse SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Version number, strictly positive.
    pub version: u64,
    /// Human-readable part of the file name.
    pub description: String,
    /// Forward SQL.
    pub up: Option<String>,
    /// Reverse SQL.
    pub down: Option<String>,
}

/// A script compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedScript {
    /// File name following the `{version}_{description}.{up|down}.sql` pattern.
    pub name: &'static str,
    /// Script contents, usually from `include_str!`.
    pub sql: &'static str,
}

/// Ordered set of migration scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptSet {
    scripts: BTreeMap<u64, MigrationScript>,
}

impl ScriptSet {
    /// Loads all scripts from a directory. A `file://` prefix is accepted.
    ///
    /// Files that do not match the naming pattern are skipped.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Source` if the directory cannot be read,
    /// `DuplicateVersion` or `InvalidVersion` for conflicting file names.
    pub fn load(location: &str) -> Result<Self, MigrationError> {
        let dir = location.strip_prefix("file://").unwrap_or(location);
        let source_err = |source| MigrationError::Source {
            location: location.to_string(),
            source,
        };

        let mut set = Self::default();
        for entry in std::fs::read_dir(Path::new(dir)).map_err(source_err)? {
            let entry = entry.map_err(source_err)?;
            if !entry.file_type().map_err(source_err)?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((version, description, direction)) = parse_script_name(&file_name)? else {
                tracing::debug!(file = %file_name, "skipping non-migration file");
                continue;
            };
            let sql = std::fs::read_to_string(entry.path()).map_err(source_err)?;
            set.insert(version, description, direction, sql, &file_name)?;
        }
        Ok(set)
    }

    /// Builds a set from scripts embedded in the binary.
    ///
    /// # Errors
    ///
    /// Same naming errors as [`load`](Self::load).
    pub fn embedded(scripts: &[EmbeddedScript]) -> Result<Self, MigrationError> {
        let mut set = Self::default();
        for script in scripts {
            match parse_script_name(script.name)? {
                Some((version, description, direction)) => {
                    set.insert(version, description, direction, script.sql.to_string(), script.name)?
                }
                None => tracing::debug!(file = script.name, "skipping non-migration script"),
            }
        }
        Ok(set)
    }

    /// Number of versions in the set.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    /// Returns `true` if the set holds no versions.
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// The script for `version`, if any.
    pub fn get(&self, version: u64) -> Option<&MigrationScript> {
        self.scripts.get(&version)
    }

    /// Highest version in the set, or 0.
    pub fn latest(&self) -> u64 {
        self.scripts.keys().next_back().copied().unwrap_or(0)
    }

    /// All versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.scripts.keys().copied()
    }

    fn pending(&self, after: u64) -> impl Iterator<Item = &MigrationScript> {
        self.scripts
            .range(after.saturating_add(1)..)
            .map(|(_, script)| script)
    }

    /// The version that precedes `version`, or 0.
    fn previous(&self, version: u64) -> u64 {
        self.scripts
            .range(..version)
            .next_back()
            .map(|(v, _)| *v)
            .unwrap_or(0)
    }

    fn insert(
        &mut self,
        version: u64,
        description: &str,
        direction: Direction,
        sql: String,
        file_name: &str,
    ) -> Result<(), MigrationError> {
        let script = self
            .scripts
            .entry(version)
            .or_insert_with(|| MigrationScript {
                version,
                description: description.to_string(),
                up: None,
                down: None,
            });
        let slot = match direction {
            Direction::Up => &mut script.up,
            Direction::Down => &mut script.down,
        };
        if slot.is_some() {
            return Err(MigrationError::DuplicateVersion {
                version,
                direction,
                file: file_name.to_string(),
            });
        }
        *slot = Some(sql);
        Ok(())
    }
}

/// Splits `{version}_{description}.{up|down}.sql`.
///
/// Returns `Ok(None)` for names that do not follow the pattern.
fn parse_script_name(name: &str) -> Result<Option<(u64, &str, Direction)>, MigrationError> {
    let (stem, direction) = if let Some(stem) = name.strip_suffix(".up.sql") {
        (stem, Direction::Up)
    } else if let Some(stem) = name.strip_suffix(".down.sql") {
        (stem, Direction::Down)
    } else {
        return Ok(None);
    };

    let Some((digits, description)) = stem.split_once('_') else {
        return Ok(None);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }

    let invalid = || MigrationError::InvalidVersion {
        file: name.to_string(),
    };
    let version: u64 = digits.parse().map_err(|_| invalid())?;
    if version == 0 || i64::try_from(version).is_err() {
        return Err(invalid());
    }
    Ok(Some((version, description, direction)))
}

fn read_state_from(conn: &rusqlite::Connection) -> rusqlite::Result<MigrationState> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [MIGRATIONS_TABLE],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(MigrationState::default());
    }

    let row: Option<(i64, bool)> = conn
        .query_row(
            "SELECT version, dirty FROM schema_migrations LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Ok(MigrationState::default()),
        Some((version, dirty)) => {
            let version = u64::try_from(version)
                .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, version))?;
            Ok(MigrationState { version, dirty })
        }
    }
}

fn write_state_in(tx: &Tx<'_>, state: MigrationState) -> rusqlite::Result<()> {
    // Versions are bounded by i64::MAX at load time.
    let version = state.version as i64;
    tx.execute("DELETE FROM schema_migrations", [])?;
    tx.execute(
        "INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)",
        params![version, state.dirty],
    )?;
    Ok(())
}

/// Applies and reverts migrations against the shared connection.
///
/// Calls are serialised within one `Migrator`; running migrators from
/// several processes against one database at the same time is not
/// supported.
#[derive(Debug)]
pub struct Migrator {
    exec: TxExecutor,
    lock: Mutex<()>,
    span: Span,
}

impl Migrator {
    /// Creates a migrator over `conn`.
    pub fn new(conn: Connection) -> Self {
        let span = tracing::info_span!(parent: conn.span(), "migrator");
        Self {
            exec: TxExecutor::new(conn),
            lock: Mutex::new(()),
            span,
        }
    }

    /// Applies every script at `location` newer than the current version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Dirty` before reading any script if the
    /// database is dirty, `Apply` if a script fails, or a loading error.
    pub fn run_migrations(&self, location: &str) -> Result<MigrationReport, MigrationError> {
        self.ensure_clean("migrate")?;
        let scripts = self.load(location)?;
        self.run_scripts(&scripts)
    }

    /// Reverts the current version using its down script at `location`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Dirty` if the database is dirty,
    /// `MissingScript` if there is no down script for the current version,
    /// or `Rollback` if the script fails.
    pub fn rollback_migration(&self, location: &str) -> Result<MigrationReport, MigrationError> {
        self.ensure_clean("roll back")?;
        let scripts = self.load(location)?;
        self.rollback_scripts(&scripts)
    }

    /// Reads the current state. Never writes.
    ///
    /// The script location is loaded so that a bad location is reported the
    /// same way as by the mutating calls.
    ///
    /// # Errors
    ///
    /// Returns a loading error or `StateRead`.
    pub fn get_migration_version(&self, location: &str) -> Result<MigrationState, MigrationError> {
        self.load(location)?;
        self.version()
    }

    /// Reads the current state without loading any scripts.
    ///
    /// # Errors
    ///
    /// Returns `Db` if no connection is available or `StateRead`.
    pub fn version(&self) -> Result<MigrationState, MigrationError> {
        let conn = self.exec.connection().get()?;
        read_state_from(&conn).map_err(MigrationError::StateRead)
    }

    /// Applies pending scripts from an already loaded set.
    ///
    /// # Errors
    ///
    /// See [`run_migrations`](Self::run_migrations).
    pub fn run_scripts(&self, scripts: &ScriptSet) -> Result<MigrationReport, MigrationError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self.ensure_clean("migrate")?;

        let pending: Vec<&MigrationScript> = scripts.pending(state.version).collect();
        if pending.is_empty() {
            tracing::debug!(parent: &self.span, version = state.version, "no pending migrations");
            return Ok(MigrationReport::unchanged(state.version));
        }
        if let Some(script) = pending.iter().find(|s| s.up.is_none()) {
            return Err(MigrationError::MissingScript {
                version: script.version,
                direction: Direction::Up,
            });
        }

        self.ensure_table()?;

        let mut current = state.version;
        let mut applied = 0;
        for script in pending {
            let version = script.version;
            let up = script.up.as_deref().unwrap_or_default();

            tracing::info!(parent: &self.span, version, description = %script.description, "applying migration");
            self.write_state(MigrationState::dirty(version))?;

            self.exec
                .run_in_transaction(TxOptions::named("migration_up").immediate(), |tx| {
                    tx.execute_batch(up)?;
                    write_state_in(tx, MigrationState::clean(version))
                })
                .map_err(|source| {
                    tracing::error!(parent: &self.span, version, error = %source, "migration failed, database left dirty");
                    MigrationError::Apply { version, source }
                })?;

            current = version;
            applied += 1;
        }

        let report = MigrationReport {
            previous: state.version,
            current,
            applied,
        };
        tracing::info!(parent: &self.span, from = report.previous, to = report.current, applied = report.applied, "migrations applied");
        Ok(report)
    }

    /// Reverts one version using an already loaded set.
    ///
    /// # Errors
    ///
    /// See [`rollback_migration`](Self::rollback_migration).
    pub fn rollback_scripts(&self, scripts: &ScriptSet) -> Result<MigrationReport, MigrationError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self.ensure_clean("roll back")?;
        if state.version == 0 {
            tracing::debug!(parent: &self.span, "nothing to roll back");
            return Ok(MigrationReport::unchanged(0));
        }

        let version = state.version;
        let down = scripts
            .get(version)
            .and_then(|s| s.down.as_deref())
            .ok_or(MigrationError::MissingScript {
                version,
                direction: Direction::Down,
            })?;
        let target = scripts.previous(version);

        tracing::info!(parent: &self.span, version, target, "rolling back migration");
        self.write_state(MigrationState::dirty(version))?;

        self.exec
            .run_in_transaction(TxOptions::named("migration_down").immediate(), |tx| {
                tx.execute_batch(down)?;
                write_state_in(tx, MigrationState::clean(target))
            })
            .map_err(|source| {
                tracing::error!(parent: &self.span, version, error = %source, "rollback failed, database left dirty");
                MigrationError::Rollback { version, source }
            })?;

        Ok(MigrationReport {
            previous: version,
            current: target,
            applied: 1,
        })
    }

    fn ensure_clean(&self, action: &'static str) -> Result<MigrationState, MigrationError> {
        let state = self.version()?;
        if state.dirty {
            tracing::error!(parent: &self.span, version = state.version, action, "refusing to change dirty database");
            return Err(MigrationError::Dirty {
                version: state.version,
            });
        }
        Ok(state)
    }

    fn load(&self, location: &str) -> Result<ScriptSet, MigrationError> {
        self.span.in_scope(|| ScriptSet::load(location))
    }

    fn ensure_table(&self) -> Result<(), MigrationError> {
        self.exec
            .run_in_transaction(TxOptions::named("migration_bootstrap").immediate(), |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS schema_migrations (
                        version INTEGER NOT NULL,
                        dirty INTEGER NOT NULL DEFAULT 0
                    );",
                )
            })
            .map_err(MigrationError::StateWrite)
    }

    fn write_state(&self, state: MigrationState) -> Result<(), MigrationError> {
        self.exec
            .run_in_transaction(TxOptions::named("migration_state").immediate(), |tx| {
                write_state_in(tx, state)
            })
            .map_err(MigrationError::StateWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _db_dir: TempDir,
        scripts: TempDir,
        conn: Connection,
        migrator: Migrator,
    }

    impl Fixture {
        fn new() -> Self {
            let db_dir = tempfile::tempdir().expect("should create db dir");
            let scripts = tempfile::tempdir().expect("should create scripts dir");
            let mut config =
                PoolConfig::new(db_dir.path().join("migrate.db").to_string_lossy().into_owned());
            config.max_open = 2;
            config.max_idle = 1;
            config.acquire_timeout = Duration::from_secs(2);
            let conn = Connection::open(&config, Span::none()).expect("pool should open");
            let migrator = Migrator::new(conn.clone());
            Self {
                _db_dir: db_dir,
                scripts,
                conn,
                migrator,
            }
        }

        fn write(&self, name: &str, sql: &str) {
            std::fs::write(self.scripts.path().join(name), sql).expect("should write script");
        }

        fn location(&self) -> String {
            self.scripts.path().to_string_lossy().into_owned()
        }

        fn table_exists(&self, table: &str) -> bool {
            self.conn
                .get()
                .expect("should get a connection")
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )
                .expect("should query sqlite_master")
        }

        fn write_users_and_posts(&self) {
            self.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
            self.write("1_users.down.sql", "DROP TABLE users;");
            self.write(
                "2_posts.up.sql",
                "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));",
            );
            self.write("2_posts.down.sql", "DROP TABLE posts;");
        }
    }

    #[test]
    fn empty_directory_is_a_no_op() {
        let fx = Fixture::new();

        let report = fx.migrator.run_migrations(&fx.location()).expect("run should succeed");
        assert_eq!(report, MigrationReport::unchanged(0));

        let state = fx.migrator.get_migration_version(&fx.location()).expect("read should succeed");
        assert_eq!(state, MigrationState::default());
    }

    #[test]
    fn apply_then_rollback_walks_versions() {
        let fx = Fixture::new();
        fx.write_users_and_posts();

        let report = fx.migrator.run_migrations(&fx.location()).expect("run should succeed");
        assert_eq!(report.previous, 0);
        assert_eq!(report.current, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(
            fx.migrator.get_migration_version(&fx.location()).expect("read should succeed"),
            MigrationState::clean(2)
        );
        assert!(fx.table_exists("users"));
        assert!(fx.table_exists("posts"));

        let report = fx.migrator.rollback_migration(&fx.location()).expect("rollback should succeed");
        assert_eq!(report.current, 1);
        assert_eq!(
            fx.migrator.get_migration_version(&fx.location()).expect("read should succeed"),
            MigrationState::clean(1)
        );
        assert!(!fx.table_exists("posts"));
        assert!(fx.table_exists("users"));
    }

    #[test]
    fn second_run_is_idempotent() {
        let fx = Fixture::new();
        fx.write_users_and_posts();

        fx.migrator.run_migrations(&fx.location()).expect("first run should succeed");
        let second = fx.migrator.run_migrations(&fx.location()).expect("second run should succeed");
        let third = fx.migrator.run_migrations(&fx.location()).expect("third run should succeed");

        assert_eq!(second, MigrationReport::unchanged(2));
        assert_eq!(third, MigrationReport::unchanged(2));
    }

    #[test]
    fn rollback_at_zero_is_a_no_op() {
        let fx = Fixture::new();
        fx.write_users_and_posts();

        let report = fx.migrator.rollback_migration(&fx.location()).expect("rollback should succeed");
        assert_eq!(report, MigrationReport::unchanged(0));
        assert!(!fx.table_exists(MIGRATIONS_TABLE), "no-op rollback should not write");
    }

    #[test]
    fn rollback_to_zero_then_reapply() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.write("1_users.down.sql", "DROP TABLE users;");

        fx.migrator.run_migrations(&fx.location()).expect("run should succeed");
        fx.migrator.rollback_migration(&fx.location()).expect("rollback should succeed");
        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::clean(0));
        assert!(!fx.table_exists("users"));

        let report = fx.migrator.run_migrations(&fx.location()).expect("reapply should succeed");
        assert_eq!(report.applied, 1);
        assert!(fx.table_exists("users"));
    }

    #[test]
    fn failing_script_leaves_database_dirty() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.write("1_users.down.sql", "DROP TABLE users;");
        fx.write(
            "2_broken.up.sql",
            "CREATE TABLE half_done (id INTEGER); THIS IS NOT SQL;",
        );
        fx.write("2_broken.down.sql", "DROP TABLE half_done;");

        let err = fx
            .migrator
            .run_migrations(&fx.location())
            .expect_err("broken script should fail");
        match &err {
            MigrationError::Apply { version, source } => {
                assert_eq!(*version, 2);
                assert!(matches!(source, TransactionError::Operation(_)), "got {source:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::dirty(2));
        assert!(!fx.table_exists("half_done"), "partial schema change should be rolled back");
        assert!(fx.table_exists("users"));
    }

    #[test]
    fn failing_down_script_leaves_database_dirty() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.write("1_users.down.sql", "DROP TABLE nope;");
        fx.migrator.run_migrations(&fx.location()).expect("run should succeed");

        let err = fx
            .migrator
            .rollback_migration(&fx.location())
            .expect_err("broken down script should fail");
        assert!(matches!(err, MigrationError::Rollback { version: 1, .. }), "got {err:?}");
        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::dirty(1));
        assert!(fx.table_exists("users"), "failed rollback should keep the schema");

        let err = fx
            .migrator
            .rollback_migration(&fx.location())
            .expect_err("second rollback should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 1 }), "got {err:?}");
    }

    #[test]
    fn dirty_state_is_reported_before_loading_scripts() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.write("1_users.down.sql", "DROP TABLE users;");
        fx.migrator.run_migrations(&fx.location()).expect("run should succeed");

        fx.conn
            .get()
            .expect("should get a connection")
            .execute("UPDATE schema_migrations SET dirty = 1", [])
            .expect("should mark dirty");
        fx.write("1_again.up.sql", "SELECT 1;");

        let err = fx.migrator.run_migrations(&fx.location()).expect_err("run should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 1 }), "got {err:?}");

        let err = fx.migrator.rollback_migration(&fx.location()).expect_err("rollback should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 1 }), "got {err:?}");

        let absent = fx.scripts.path().join("absent").to_string_lossy().into_owned();
        let err = fx.migrator.run_migrations(&absent).expect_err("run should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 1 }), "got {err:?}");
    }

    #[test]
    fn dirty_database_refuses_every_mutation() {
        let fx = Fixture::new();
        fx.write_users_and_posts();
        fx.migrator.run_migrations(&fx.location()).expect("run should succeed");
        fx.write("3_comments.up.sql", "CREATE TABLE comments (id INTEGER PRIMARY KEY);");
        fx.write("3_comments.down.sql", "DROP TABLE comments;");

        fx.conn
            .get()
            .expect("should get a connection")
            .execute("UPDATE schema_migrations SET dirty = 1", [])
            .expect("should mark dirty");

        let err = fx.migrator.run_migrations(&fx.location()).expect_err("run should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 2 }), "got {err:?}");
        assert!(err.to_string().contains("dirty at migration version 2"));

        let err = fx.migrator.rollback_migration(&fx.location()).expect_err("rollback should refuse");
        assert!(matches!(err, MigrationError::Dirty { version: 2 }), "got {err:?}");

        assert!(!fx.table_exists("comments"), "no up script should run");
        assert!(fx.table_exists("posts"), "no down script should run");
        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::dirty(2));
    }

    #[test]
    fn version_read_does_not_create_tracking_table() {
        let fx = Fixture::new();
        let state = fx.migrator.get_migration_version(&fx.location()).expect("read should succeed");
        assert_eq!(state, MigrationState::default());
        assert!(!fx.table_exists(MIGRATIONS_TABLE));
    }

    #[test]
    fn missing_down_script_is_reported() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.migrator.run_migrations(&fx.location()).expect("run should succeed");

        let err = fx.migrator.rollback_migration(&fx.location()).expect_err("rollback should fail");
        assert!(
            matches!(err, MigrationError::MissingScript { version: 1, direction: Direction::Down }),
            "got {err:?}"
        );
        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::clean(1));
    }

    #[test]
    fn missing_up_script_fails_before_any_change() {
        let fx = Fixture::new();
        fx.write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        fx.write("2_posts.down.sql", "DROP TABLE posts;");

        let err = fx.migrator.run_migrations(&fx.location()).expect_err("run should fail");
        assert!(
            matches!(err, MigrationError::MissingScript { version: 2, direction: Direction::Up }),
            "got {err:?}"
        );
        assert!(!fx.table_exists("users"));
    }

    #[test]
    fn file_scheme_prefix_is_accepted() {
        let fx = Fixture::new();
        fx.write_users_and_posts();
        let location = format!("file://{}", fx.location());

        fx.migrator.run_migrations(&location).expect("run should succeed");
        assert_eq!(fx.migrator.version().expect("read should succeed"), MigrationState::clean(2));
    }

    #[test]
    fn missing_location_is_a_source_error() {
        let fx = Fixture::new();
        let location = fx.scripts.path().join("absent").to_string_lossy().into_owned();

        let err = fx.migrator.run_migrations(&location).expect_err("run should fail");
        assert!(matches!(err, MigrationError::Source { .. }), "got {err:?}");
    }

    #[test]
    fn operations_after_close_surface_closed() {
        let fx = Fixture::new();
        fx.write_users_and_posts();
        fx.conn.close().expect("close should succeed");

        let err = fx.migrator.run_migrations(&fx.location()).expect_err("run should fail");
        assert!(matches!(err, MigrationError::Db(DbError::Closed)), "got {err:?}");
    }

    #[test]
    fn loader_skips_unrelated_files_and_rejects_conflicts() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let write = |name: &str| std::fs::write(dir.path().join(name), "SELECT 1;").expect("should write");
        let location = dir.path().to_string_lossy().into_owned();

        write("README.md");
        write("notes.up.sql");
        write("10_late.up.sql");
        write("2_early.up.sql");
        write("2_early.down.sql");
        let set = ScriptSet::load(&location).expect("load should succeed");
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
        assert_eq!(set.versions().collect::<Vec<_>>(), vec![2, 10]);
        assert_eq!(set.latest(), 10);
        assert_eq!(set.get(2).map(|s| s.description.as_str()), Some("early"));
        assert!(set.get(10).and_then(|s| s.down.as_ref()).is_none());

        write("2_again.up.sql");
        let err = ScriptSet::load(&location).expect_err("duplicate should be rejected");
        assert!(
            matches!(err, MigrationError::DuplicateVersion { version: 2, direction: Direction::Up, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn version_zero_is_rejected() {
        let err = ScriptSet::embedded(&[EmbeddedScript {
            name: "0_bootstrap.up.sql",
            sql: "SELECT 1;",
        }])
        .expect_err("version 0 should be rejected");
        assert!(matches!(err, MigrationError::InvalidVersion { .. }), "got {err:?}");

        let empty = ScriptSet::embedded(&[]).expect("empty set should build");
        assert!(empty.is_empty());
    }

    #[test]
    fn embedded_scripts_run_like_directory_scripts() {
        let fx = Fixture::new();
        let set = ScriptSet::embedded(&[
            EmbeddedScript {
                name: "1_settings.up.sql",
                sql: "CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
            },
            EmbeddedScript {
                name: "1_settings.down.sql",
                sql: "DROP TABLE settings;",
            },
        ])
        .expect("embedded set should build");

        let report = fx.migrator.run_scripts(&set).expect("run should succeed");
        assert_eq!(report.applied, 1);
        assert!(fx.table_exists("settings"));

        fx.migrator.rollback_scripts(&set).expect("rollback should succeed");
        assert!(!fx.table_exists("settings"));
    }

    #[test]
    fn previous_skips_gaps() {
        let set = ScriptSet::embedded(&[
            EmbeddedScript { name: "3_a.up.sql", sql: "" },
            EmbeddedScript { name: "7_b.up.sql", sql: "" },
        ])
        .expect("embedded set should build");
        assert_eq!(set.previous(7), 3);
        assert_eq!(set.previous(3), 0);
        assert_eq!(set.pending(3).map(|s| s.version).collect::<Vec<_>>(), vec![7]);
    }
}
