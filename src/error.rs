//! Error types for the migration engine.

use std::path::{Path, PathBuf};

/// Errors that can occur while tracking or applying migrations.
///
/// Drift is not an error: a checksum mismatch is reported as a
/// skipped migration, never as an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database could not be reached.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    /// The tracking namespace or table could not be created or inspected.
    #[error("failed to prepare tracking table {table}: {source}")]
    Bookkeeping {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// The tracking table predates the `filename` column.
    #[error(
        "tracking table {table} has no `filename` column; apply the table upgrade migration manually before running migrations"
    )]
    OutdatedTrackingTable { table: String },

    /// A store operation ran before `ensure_tracking_table`.
    #[error("tracking table {table} has not been initialised")]
    Uninitialised { table: String },

    /// A migration's SQL failed; its transaction was rolled back.
    #[error("migration {filename} failed: {source}")]
    Execution {
        filename: String,
        #[source]
        source: sqlx::Error,
    },

    /// The bookkeeping row for a migration could not be written.
    #[error("failed to record migration {filename}: {source}")]
    Record {
        filename: String,
        #[source]
        source: sqlx::Error,
    },

    /// The migration to roll back has no rollback SQL anywhere.
    #[error("migration {filename} has no rollback SQL and cannot be rolled back safely")]
    NoRollback { filename: String },

    /// A destructive operation was attempted in production.
    #[error("refusing to {action} while the environment is production")]
    ProductionGuard { action: &'static str },

    /// `create` would overwrite an existing file.
    #[error("migration file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A schema or table name is not a plain SQL identifier.
    #[error("invalid identifier `{0}`: expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether the failure happened inside a migration's own SQL.
    pub fn is_execution(&self) -> bool {
        matches!(self, Error::Execution { .. })
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_guard_display() {
        let err = Error::ProductionGuard {
            action: "reset migrations",
        };
        assert!(err.to_string().contains("reset migrations"));
        assert!(err.to_string().contains("production"));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = Error::io(
            "migrations/001_init.sql",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("migrations/001_init.sql"));
        assert!(!err.is_execution());
    }
}
