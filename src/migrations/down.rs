//! Migration DOWN
//!
//! `migrate_down` only finds the rollback SQL for the latest migration.
//! `migrate_rollback` executes it and removes the record, outside
//! production only.

use serde::Serialize;
use tracing::warn;

use crate::config::Environment;
use crate::error::{Error, Result};
use crate::source::{MigrationSource, RollbackOrigin};
use crate::store::MigrationStore;
use crate::tracking::MigrationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackSource {
    /// Stored in the tracking table when the migration was applied.
    Recorded,
    /// Read from the migration's files on disk.
    File(RollbackOrigin),
}

/// The most recent migration and how to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackPlan {
    pub record: MigrationRecord,
    pub rollback_sql: Option<String>,
    pub source: Option<RollbackSource>,
}

/// Find the last applied migration and its rollback SQL.
///
/// Returns `Ok(None)` when nothing has been applied.
pub async fn migrate_down(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
) -> Result<Option<RollbackPlan>> {
    store.ensure_tracking_table().await?;
    let Some(record) = store.records().await?.pop() else {
        return Ok(None);
    };

    if let Some(sql) = record.rollback_sql.as_deref().filter(|s| !s.trim().is_empty()) {
        let rollback_sql = Some(sql.to_string());
        return Ok(Some(RollbackPlan {
            record,
            rollback_sql,
            source: Some(RollbackSource::Recorded),
        }));
    }

    // Legacy records carry no rollback SQL; fall back to the file if it is
    // still on disk.
    let (rollback_sql, origin) = if source.dir().join(&record.filename).is_file() {
        let file = source.load(&record.filename)?;
        (file.rollback, file.rollback_origin.map(RollbackSource::File))
    } else {
        (None, None)
    };

    Ok(Some(RollbackPlan {
        record,
        rollback_sql,
        source: origin,
    }))
}

/// Execute a rollback plan from [`migrate_down`]: run its SQL and delete the
/// record in one transaction, holding the run lock when `lock` is set.
///
/// Refused in production, and for a migration with no rollback SQL.
pub async fn migrate_rollback(
    store: &mut dyn MigrationStore,
    plan: &RollbackPlan,
    environment: &Environment,
    lock: bool,
) -> Result<()> {
    if environment.is_production() {
        return Err(Error::ProductionGuard {
            action: "execute rollback SQL",
        });
    }
    let filename = plan.record.filename.as_str();
    let Some(sql) = plan.rollback_sql.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(Error::NoRollback {
            filename: filename.to_string(),
        });
    };

    store.ensure_tracking_table().await?;
    if lock {
        store.lock().await?;
    }
    let result = store.unapply(filename, sql).await;
    if lock && let Err(e) = store.unlock().await {
        warn!(error = %e, "failed to release the migration lock");
    }
    result?;

    warn!(
        filename,
        environment = environment.name(),
        "migration rolled back"
    );
    Ok(())
}

/// The `limit` most recent records, newest first.
pub async fn migrate_history(
    store: &mut dyn MigrationStore,
    limit: usize,
) -> Result<Vec<MigrationRecord>> {
    store.ensure_tracking_table().await?;
    let records = store.records().await?;
    Ok(records.into_iter().rev().take(limit).collect())
}
