//! SQLite tracking store, for local databases and tests.
//!
//! SQLite has no schemas, so the tracking table is named `<schema>_<table>`.
//! There is a single connection, which also makes a run lock unnecessary.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use super::{
    Application, MigrationStore, elapsed_millis, legacy_insert_columns, outdated, uninitialised,
};
use crate::config::redact_url;
use crate::error::{Error, Result};
use crate::tracking::{MigrationRecord, TrackingShape, TrackingTable};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Tracking store backed by a single-connection SQLite pool.
pub struct SqliteStore {
    pool: SqlitePool,
    tracking: TrackingTable,
    shape: Option<TrackingShape>,
}

impl SqliteStore {
    /// Wrap an existing pool. For `sqlite::memory:` the pool must hold
    /// exactly one connection that is never recycled.
    pub fn new(pool: SqlitePool, tracking: TrackingTable) -> Self {
        Self {
            pool,
            tracking,
            shape: None,
        }
    }

    pub async fn connect(url: &str, tracking: TrackingTable) -> Result<Self> {
        let connect_err = |source| Error::Connect {
            url: redact_url(url),
            source,
        };

        let options = SqliteConnectOptions::from_str(url)
            .map_err(connect_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(connect_err)?;

        debug!(url, "opened SQLite database");
        Ok(Self::new(pool, tracking))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn current_ddl(&self) -> String {
        let table = self.tracking.flattened();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                checksum TEXT,
                rollback_sql TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_filename ON {table} (filename);
            CREATE INDEX IF NOT EXISTS idx_{table}_applied_at ON {table} (applied_at);"
        )
    }

    async fn prepare(&self) -> std::result::Result<TrackingShape, sqlx::Error> {
        let table = self.tracking.flattened();
        let meta = format!("{table}_meta");
        let mut tx = self.pool.begin().await?;

        sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {meta} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                shape TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );"
        ))
        .execute(&mut *tx)
        .await?;

        let marker: Option<String> =
            sqlx::query_scalar(&format!("SELECT shape FROM {meta} WHERE id = 1"))
                .fetch_optional(&mut *tx)
                .await?;

        let shape = match marker.as_deref().and_then(TrackingShape::from_marker) {
            Some(TrackingShape::Current) => {
                sqlx::raw_sql(&self.current_ddl()).execute(&mut *tx).await?;
                TrackingShape::Current
            }
            Some(shape) => shape,
            None => {
                let columns: Vec<String> =
                    sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{table}')"))
                        .fetch_all(&mut *tx)
                        .await?;

                let shape = match TrackingShape::detect(&columns) {
                    None => {
                        info!(table = %table, "creating tracking table");
                        sqlx::raw_sql(&self.current_ddl()).execute(&mut *tx).await?;
                        TrackingShape::Current
                    }
                    Some(TrackingShape::Current) => {
                        sqlx::raw_sql(&self.current_ddl()).execute(&mut *tx).await?;
                        TrackingShape::Current
                    }
                    Some(shape) => shape,
                };

                if shape != TrackingShape::Outdated {
                    sqlx::query(&format!(
                        "INSERT INTO {meta} (id, shape) VALUES (1, ?1)
                         ON CONFLICT (id) DO UPDATE
                         SET shape = excluded.shape, updated_at = CURRENT_TIMESTAMP"
                    ))
                    .bind(shape.marker())
                    .execute(&mut *tx)
                    .await?;
                }
                shape
            }
        };

        tx.commit().await?;
        Ok(shape)
    }

    fn ready_shape(&self) -> Result<TrackingShape> {
        match self.shape {
            None => Err(uninitialised(&self.tracking)),
            Some(TrackingShape::Outdated) => Err(outdated(&self.tracking)),
            Some(shape) => Ok(shape),
        }
    }
}

fn record_from_row(row: &SqliteRow) -> std::result::Result<MigrationRecord, sqlx::Error> {
    let applied_at: Option<String> = row.try_get("applied_at")?;
    let applied_at = applied_at
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: "applied_at".to_string(),
                    source: Box::new(e),
                })
        })
        .transpose()?;

    Ok(MigrationRecord {
        filename: row.try_get("filename")?,
        applied_at,
        checksum: row.try_get("checksum")?,
        rollback_sql: row.try_get("rollback_sql")?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
    })
}

async fn rollback(tx: Transaction<'_, Sqlite>, filename: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(filename, error = %e, "explicit rollback failed");
    }
}

#[async_trait(?Send)]
impl MigrationStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn tracking_table(&self) -> &TrackingTable {
        &self.tracking
    }

    async fn ensure_tracking_table(&mut self) -> Result<TrackingShape> {
        let shape = self.prepare().await.map_err(|source| Error::Bookkeeping {
            table: self.tracking.flattened(),
            source,
        })?;

        if shape == TrackingShape::Outdated {
            warn!(
                table = %self.tracking.flattened(),
                "tracking table has an old layout without a filename column; leaving it for the upgrade migration"
            );
        }
        self.shape = Some(shape);
        Ok(shape)
    }

    async fn records(&mut self) -> Result<Vec<MigrationRecord>> {
        let table = self.tracking.flattened();
        let sql = match self.ready_shape()? {
            TrackingShape::Legacy(columns) => {
                let rollback = if columns.rollback_sql {
                    "rollback_sql"
                } else {
                    "NULL"
                };
                format!(
                    "SELECT filename, strftime('{TIMESTAMP_FORMAT}', applied_at) AS applied_at,
                            checksum, {rollback} AS rollback_sql, version, description
                     FROM {table} ORDER BY applied_at, id"
                )
            }
            _ => format!(
                "SELECT filename, strftime('{TIMESTAMP_FORMAT}', applied_at) AS applied_at,
                        checksum, rollback_sql, NULL AS version, NULL AS description
                 FROM {table} ORDER BY applied_at, id"
            ),
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn apply(&mut self, app: &Application<'_>) -> Result<Duration> {
        let shape = self.ready_shape()?;
        let table = self.tracking.flattened();
        let mut tx = self.pool.begin().await?;

        let started = Instant::now();
        if let Err(source) = sqlx::raw_sql(app.sql).execute(&mut *tx).await {
            rollback(tx, app.filename).await;
            return Err(Error::Execution {
                filename: app.filename.to_string(),
                source,
            });
        }
        let elapsed = started.elapsed();

        let insert_sql = match shape {
            TrackingShape::Legacy(columns) => {
                let names = legacy_insert_columns(columns);
                let placeholders: Vec<String> =
                    (1..=names.len()).map(|i| format!("?{i}")).collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders.join(", ")
                )
            }
            _ => format!(
                "INSERT INTO {table} (filename, checksum, rollback_sql) VALUES (?1, ?2, ?3)"
            ),
        };
        let insert = match shape {
            TrackingShape::Legacy(columns) => {
                let mut insert = sqlx::query(&insert_sql)
                    .bind(&app.version)
                    .bind(&app.description)
                    .bind(app.filename)
                    .bind(app.checksum);
                if columns.rollback_sql {
                    insert = insert.bind(app.rollback_sql);
                }
                if columns.execution_time {
                    insert = insert.bind(elapsed_millis(elapsed));
                }
                insert
            }
            _ => sqlx::query(&insert_sql)
                .bind(app.filename)
                .bind(app.checksum)
                .bind(app.rollback_sql),
        };

        if let Err(source) = insert.execute(&mut *tx).await {
            rollback(tx, app.filename).await;
            return Err(Error::Record {
                filename: app.filename.to_string(),
                source,
            });
        }

        tx.commit().await.map_err(|source| Error::Execution {
            filename: app.filename.to_string(),
            source,
        })?;
        Ok(elapsed)
    }

    async fn unapply(&mut self, filename: &str, rollback_sql: &str) -> Result<()> {
        self.ready_shape()?;
        let table = self.tracking.flattened();
        let mut tx = self.pool.begin().await?;

        if let Err(source) = sqlx::raw_sql(rollback_sql).execute(&mut *tx).await {
            rollback(tx, filename).await;
            return Err(Error::Execution {
                filename: filename.to_string(),
                source,
            });
        }

        let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE filename = ?1"))
            .bind(filename)
            .execute(&mut *tx)
            .await;
        if let Err(source) = deleted {
            rollback(tx, filename).await;
            return Err(Error::Record {
                filename: filename.to_string(),
                source,
            });
        }

        tx.commit().await.map_err(|source| Error::Execution {
            filename: filename.to_string(),
            source,
        })?;
        info!(filename, "rolled back");
        Ok(())
    }

    async fn clear(&mut self) -> Result<u64> {
        if self.shape.is_none() {
            return Err(uninitialised(&self.tracking));
        }
        let result = sqlx::query(&format!("DELETE FROM {}", self.tracking.flattened()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn lock(&mut self) -> Result<()> {
        debug!("sqlite store runs on one connection; no lock taken");
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}
