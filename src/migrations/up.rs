//! Migration UP operations

use std::time::Duration;

use tracing::{error, info, warn};

use super::plan::{PlanStep, migrate_plan};
use crate::checksum::checksum;
use crate::error::Result;
use crate::source::MigrationSource;
use crate::store::{Application, MigrationStore};

/// Progress notifications emitted while `up` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    Applying {
        filename: &'a str,
    },
    Applied {
        filename: &'a str,
        elapsed: Duration,
    },
    AlreadyApplied {
        filename: &'a str,
    },
    Drifted {
        filename: &'a str,
        recorded: &'a str,
        current: &'a str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpOptions {
    /// Hold the store's run lock for the whole run.
    pub lock: bool,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self { lock: true }
    }
}

/// Filenames grouped by what happened to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpReport {
    pub applied: Vec<String>,
    pub already_applied: Vec<String>,
    pub drifted: Vec<String>,
}

impl UpReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Apply every pending migration in filename order.
///
/// Each file runs in its own transaction together with its tracking row.
/// Drifted files are skipped with a warning and the run continues. The
/// first failing file rolls back and ends the run; later files are not
/// attempted, since they may depend on it.
pub async fn migrate_up<F>(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
    options: UpOptions,
    mut on_event: F,
) -> Result<UpReport>
where
    F: FnMut(&Event<'_>) + Send,
{
    if options.lock {
        store.lock().await?;
    }

    let result = run(store, source, &mut on_event).await;

    if options.lock
        && let Err(e) = store.unlock().await
    {
        warn!(error = %e, "failed to release the migration lock");
    }
    result
}

async fn run<F>(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
    on_event: &mut F,
) -> Result<UpReport>
where
    F: FnMut(&Event<'_>) + Send,
{
    // Planned under the lock so a concurrent run cannot record a file
    // between reading the records and applying it.
    let plan = migrate_plan(store, source).await?;
    let mut report = UpReport::default();

    for step in &plan.steps {
        match step {
            PlanStep::AlreadyApplied { filename } => {
                info!(filename = %filename, "already applied");
                on_event(&Event::AlreadyApplied { filename });
                report.already_applied.push(filename.clone());
            }
            PlanStep::Drifted {
                filename,
                recorded,
                current,
            } => {
                warn!(
                    filename = %filename,
                    recorded = %recorded,
                    current = %current,
                    "migration was changed after it was applied; skipping"
                );
                on_event(&Event::Drifted {
                    filename,
                    recorded,
                    current,
                });
                report.drifted.push(filename.clone());
            }
            PlanStep::Apply(file) => {
                on_event(&Event::Applying {
                    filename: &file.filename,
                });

                let digest = checksum(&file.content);
                match store.apply(&Application::new(file, &digest)).await {
                    Ok(elapsed) => {
                        info!(
                            filename = %file.filename,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "applied"
                        );
                        on_event(&Event::Applied {
                            filename: &file.filename,
                            elapsed,
                        });
                        report.applied.push(file.filename.clone());
                    }
                    Err(e) => {
                        error!(
                            filename = %file.filename,
                            error = %e,
                            "migration failed; stopping run"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    Ok(report)
}
