//! Tracking table reset

use tracing::warn;

use crate::config::Environment;
use crate::error::{Error, Result};
use crate::store::MigrationStore;

/// Delete every tracking record so all files are pending again.
///
/// Schema objects created by the migrations are left as they are. Refused
/// in production.
pub async fn migrate_reset(
    store: &mut dyn MigrationStore,
    environment: &Environment,
) -> Result<u64> {
    if environment.is_production() {
        return Err(Error::ProductionGuard {
            action: "reset migrations",
        });
    }

    store.ensure_tracking_table().await?;
    let removed = store.clear().await?;
    warn!(
        table = %store.tracking_table().qualified(),
        removed,
        environment = environment.name(),
        "tracking table reset"
    );
    Ok(removed)
}
