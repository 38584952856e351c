//! PostgreSQL tracking store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use super::{
    Application, MigrationStore, elapsed_millis, legacy_insert_columns, outdated, uninitialised,
};
use crate::config::redact_url;
use crate::error::{Error, Result};
use crate::tracking::{MigrationRecord, TrackingShape, TrackingTable};

/// Tracking store backed by a PostgreSQL pool.
///
/// The pool needs two connections: one pinned for the advisory lock and
/// one for each migration's transaction.
pub struct PgStore {
    pool: PgPool,
    tracking: TrackingTable,
    shape: Option<TrackingShape>,
    lock_conn: Option<PoolConnection<Postgres>>,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, tracking: TrackingTable) -> Self {
        Self {
            pool,
            tracking,
            shape: None,
            lock_conn: None,
        }
    }

    /// Connect to `url`. With `require_tls` and no explicit `sslmode` in the
    /// URL, TLS is required but the certificate is not verified.
    pub async fn connect(url: &str, tracking: TrackingTable, require_tls: bool) -> Result<Self> {
        let connect_err = |source| Error::Connect {
            url: redact_url(url),
            source,
        };

        let mut options: PgConnectOptions = url.parse().map_err(connect_err)?;
        if require_tls && !url.contains("sslmode=") {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(connect_err)?;

        debug!(url = %redact_url(url), "connected to PostgreSQL");
        Ok(Self::new(pool, tracking))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn current_ddl(&self) -> String {
        let table = self.tracking.qualified();
        let name = self.tracking.table();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id SERIAL PRIMARY KEY,
                filename TEXT NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                checksum TEXT,
                rollback_sql TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{name}_filename ON {table} (filename);
            CREATE INDEX IF NOT EXISTS idx_{name}_applied_at ON {table} (applied_at);"
        )
    }

    async fn prepare(&self) -> std::result::Result<TrackingShape, sqlx::Error> {
        let meta = self.tracking.qualified_meta();
        let mut tx = self.pool.begin().await?;

        sqlx::raw_sql(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
            CREATE TABLE IF NOT EXISTS {meta} (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                shape TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
            schema = self.tracking.schema(),
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
                let columns: Vec<String> = sqlx::query_scalar(
                    "SELECT column_name::text FROM information_schema.columns
                     WHERE table_schema = $1 AND table_name = $2",
                )
                .bind(self.tracking.schema())
                .bind(self.tracking.table())
                .fetch_all(&mut *tx)
                .await?;

                let shape = match TrackingShape::detect(&columns) {
                    None => {
                        info!(table = %self.tracking.qualified(), "creating tracking table");
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
                        "INSERT INTO {meta} (id, shape) VALUES (1, $1)
                         ON CONFLICT (id) DO UPDATE
                         SET shape = EXCLUDED.shape, updated_at = CURRENT_TIMESTAMP"
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

fn record_from_row(row: &PgRow) -> std::result::Result<MigrationRecord, sqlx::Error> {
    Ok(MigrationRecord {
        filename: row.try_get("filename")?,
        applied_at: row.try_get("applied_at")?,
        checksum: row.try_get("checksum")?,
        rollback_sql: row.try_get("rollback_sql")?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
    })
}

async fn rollback(tx: Transaction<'_, Postgres>, filename: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(
            filename,
            error = %e,
            "explicit rollback failed; the open transaction is discarded with its connection"
        );
    }
}

#[async_trait(?Send)]
impl MigrationStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn tracking_table(&self) -> &TrackingTable {
        &self.tracking
    }

    async fn ensure_tracking_table(&mut self) -> Result<TrackingShape> {
        let shape = self.prepare().await.map_err(|source| Error::Bookkeeping {
            table: self.tracking.qualified(),
            source,
        })?;

        if shape == TrackingShape::Outdated {
            warn!(
                table = %self.tracking.qualified(),
                "tracking table has an old layout without a filename column; leaving it for the upgrade migration"
            );
        }
        self.shape = Some(shape);
        Ok(shape)
    }

    async fn records(&mut self) -> Result<Vec<MigrationRecord>> {
        let table = self.tracking.qualified();
        let sql = match self.ready_shape()? {
            TrackingShape::Legacy(columns) => {
                let rollback = if columns.rollback_sql {
                    "rollback_sql::text"
                } else {
                    "NULL::text"
                };
                format!(
                    "SELECT filename::text AS filename, applied_at::timestamptz AS applied_at,
                            checksum::text AS checksum, {rollback} AS rollback_sql,
                            version::text AS version, description::text AS description
                     FROM {table} ORDER BY applied_at, id"
                )
            }
            _ => format!(
                "SELECT filename, applied_at::timestamptz AS applied_at, checksum,
                        rollback_sql, NULL::text AS version, NULL::text AS description
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
        let table = self.tracking.qualified();
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
                    (1..=names.len()).map(|i| format!("${i}")).collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders.join(", ")
                )
            }
            _ => format!(
                "INSERT INTO {table} (filename, checksum, rollback_sql) VALUES ($1, $2, $3)"
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
        let table = self.tracking.qualified();
        let mut tx = self.pool.begin().await?;

        if let Err(source) = sqlx::raw_sql(rollback_sql).execute(&mut *tx).await {
            rollback(tx, filename).await;
            return Err(Error::Execution {
                filename: filename.to_string(),
                source,
            });
        }

        let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE filename = $1"))
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
        let result = sqlx::query(&format!("DELETE FROM {}", self.tracking.qualified()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn lock(&mut self) -> Result<()> {
        if self.lock_conn.is_some() {
            return Ok(());
        }

        let key = self.tracking.lock_key();
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            info!(key, "another migration run holds the advisory lock; waiting");
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }

        debug!(key, "advisory lock held");
        self.lock_conn = Some(conn);
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        let Some(mut conn) = self.lock_conn.take() else {
            return Ok(());
        };

        let key = self.tracking.lock_key();
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !released {
            warn!(key, "advisory lock was not held at release");
        }
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the pinned connection before closing the pool ends the
        // session, which releases a still-held advisory lock.
        self.lock_conn.take();
        self.pool.close().await;
    }
}
