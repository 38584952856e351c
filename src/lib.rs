//! # mdh-migrate
//!
//! Applies forward-only SQL migration files to a database exactly once,
//! recording each applied file with a content checksum in a tracking table.
//!
//! ```text
//! migrations/
//!   20241220143022_create_users.sql
//!   20241220143022_create_users.down.sql
//!   20241221090000_add_phone_to_users.sql
//! ```
//!
//! Files run in filename order, each in its own transaction together with
//! its tracking row. A file whose content changed after it was applied is
//! reported as drifted and never reapplied.
//!
//! ```ignore
//! use mdh_migrate::{config::Config, migrations, source::MigrationSource, store};
//!
//! let config = Config::resolve(&Default::default(), None)?;
//! let mut store = store::connect(&config).await?;
//! let source = MigrationSource::new(&config.migrations_dir);
//! let report = migrations::migrate_up(store.as_mut(), &source, Default::default(), |_| {}).await?;
//! ```

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod migrations;
pub mod source;
pub mod store;
pub mod tracking;

pub use error::{Error, Result};
