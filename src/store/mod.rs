//! Tracking stores.
//!
//! A [`MigrationStore`] owns the connection pool and everything that
//! touches the database: the tracking table, the per-file transaction and
//! the run lock. The engine in [`crate::migrations`] only sees this trait,
//! so it runs unchanged against PostgreSQL or an in-memory SQLite database.

mod postgres;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, redact_url};
use crate::error::{Error, Result};
use crate::source::MigrationFile;
use crate::tracking::{LegacyColumns, MigrationRecord, TrackingShape, TrackingTable};

/// Everything a store needs to apply and record one migration.
#[derive(Debug, Clone)]
pub struct Application<'a> {
    pub filename: &'a str,
    pub sql: &'a str,
    pub checksum: &'a str,
    pub rollback_sql: Option<&'a str>,
    /// Only written to legacy-shaped tables.
    pub version: String,
    /// Only written to legacy-shaped tables.
    pub description: String,
}

impl<'a> Application<'a> {
    pub fn new(file: &'a MigrationFile, checksum: &'a str) -> Self {
        Self {
            filename: &file.filename,
            sql: &file.content,
            checksum,
            rollback_sql: file.rollback.as_deref(),
            version: file.legacy_version(),
            description: file.legacy_description(),
        }
    }
}

/// Bookkeeping store for applied migrations.
///
/// Futures are not `Send`: sqlx transaction executors borrowed across an
/// `.await` do not satisfy the higher-ranked bounds a `Send` future needs.
#[async_trait(?Send)]
pub trait MigrationStore: Send {
    /// Short backend name for log output.
    fn backend(&self) -> &'static str;

    fn tracking_table(&self) -> &TrackingTable;

    /// Create the namespace, tracking table and indexes if absent.
    ///
    /// Idempotent. Returns the layout of the table now in place; an
    /// outdated table is left untouched.
    async fn ensure_tracking_table(&mut self) -> Result<TrackingShape>;

    /// All records, oldest first.
    async fn records(&mut self) -> Result<Vec<MigrationRecord>>;

    /// Run a migration and insert its record in one transaction.
    ///
    /// Returns the time spent executing the migration's SQL. On failure the
    /// transaction is rolled back and nothing is recorded.
    async fn apply(&mut self, application: &Application<'_>) -> Result<Duration>;

    /// Run `rollback_sql` and delete the record for `filename` in one
    /// transaction. On failure both are rolled back.
    async fn unapply(&mut self, filename: &str, rollback_sql: &str) -> Result<()>;

    /// Delete every record. Returns the number of rows removed.
    async fn clear(&mut self) -> Result<u64>;

    /// Take the lock that keeps concurrent runs apart. Blocks until held.
    async fn lock(&mut self) -> Result<()>;

    async fn unlock(&mut self) -> Result<()>;

    /// Close the pool. Open transactions are rolled back by the server.
    async fn close(&mut self);
}

/// Open the store matching the configured database URL.
pub async fn connect(config: &Config) -> Result<Box<dyn MigrationStore>> {
    let url = config.database_url.as_str();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let require_tls = config.environment.is_production();
        let store = PgStore::connect(url, config.tracking.clone(), require_tls).await?;
        Ok(Box::new(store))
    } else if url.starts_with("sqlite:") {
        let store = SqliteStore::connect(url, config.tracking.clone()).await?;
        Ok(Box::new(store))
    } else {
        Err(Error::Config(format!(
            "unsupported database URL {}: expected postgres:// or sqlite:",
            redact_url(url)
        )))
    }
}

/// Insert columns for a legacy-shaped table, in bind order.
pub(crate) fn legacy_insert_columns(columns: LegacyColumns) -> Vec<&'static str> {
    let mut names = vec!["version", "description", "filename", "checksum"];
    if columns.rollback_sql {
        names.push("rollback_sql");
    }
    if columns.execution_time {
        names.push("execution_time");
    }
    names
}

/// Execution time as stored in a legacy `execution_time INTEGER` column.
pub(crate) fn elapsed_millis(elapsed: Duration) -> i32 {
    i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX)
}

pub(crate) fn uninitialised(table: &TrackingTable) -> Error {
    Error::Uninitialised {
        table: table.qualified(),
    }
}

pub(crate) fn outdated(table: &TrackingTable) -> Error {
    Error::OutdatedTrackingTable {
        table: table.qualified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_insert_columns_follow_table() {
        assert_eq!(
            legacy_insert_columns(LegacyColumns::default()),
            vec!["version", "description", "filename", "checksum"]
        );
        let full = LegacyColumns {
            rollback_sql: true,
            execution_time: true,
        };
        assert_eq!(
            legacy_insert_columns(full),
            vec!["version", "description", "filename", "checksum", "rollback_sql", "execution_time"]
        );
    }

    #[test]
    fn test_elapsed_millis_saturates() {
        assert_eq!(elapsed_millis(Duration::from_millis(42)), 42);
        assert_eq!(elapsed_millis(Duration::from_secs(u64::MAX / 2)), i32::MAX);
    }
}
