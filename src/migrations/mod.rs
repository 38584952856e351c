//! Migration operations.
//!
//! Submodules:
//! - `plan`: reconcile files with records (dry-run)
//! - `up`: apply pending migrations
//! - `status`: applied / pending / drifted report
//! - `create`: scaffold new migration files
//! - `down`: find, and optionally execute, the latest migration's rollback
//! - `reset`: clear the tracking table outside production

mod create;
mod down;
mod plan;
mod reset;
mod status;
mod up;

pub use create::{CreatedMigration, Template, migrate_create, migration_filename, slugify};
pub use down::{RollbackPlan, RollbackSource, migrate_down, migrate_history, migrate_rollback};
pub use plan::{Plan, PlanStep, migrate_plan};
pub use reset::migrate_reset;
pub use status::{FileState, StatusEntry, StatusReport, migrate_status};
pub use up::{Event, UpOptions, UpReport, migrate_up};
