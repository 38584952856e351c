//! Tracking table naming, layout and records.
//!
//! The tracking table lives in its own namespace (`system` by default),
//! away from application tables. A companion `<table>_meta` table holds a
//! single marker row naming the table's layout, so the column inspection
//! that tells the current layout from the legacy one runs only once.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

pub const DEFAULT_SCHEMA: &str = "system";
pub const DEFAULT_TABLE: &str = "schema_migrations";

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 63 {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// Location of the tracking table.
///
/// Both parts are validated identifiers, so they can be spliced into DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingTable {
    schema: String,
    table: String,
}

impl Default for TrackingTable {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl TrackingTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let table = table.into();
        validate_identifier(&schema)?;
        validate_identifier(&table)?;
        // `<table>_meta` must stay within the 63-byte identifier limit.
        validate_identifier(&format!("{}_meta", table))?;
        Ok(Self { schema, table })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// `schema.table`, as used in PostgreSQL.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// `schema.table_meta`, as used in PostgreSQL.
    pub fn qualified_meta(&self) -> String {
        format!("{}.{}_meta", self.schema, self.table)
    }

    /// `schema_table`, for backends without namespaces.
    pub fn flattened(&self) -> String {
        format!("{}_{}", self.schema, self.table)
    }

    /// Key for the session advisory lock that serialises migration runs.
    pub fn lock_key(&self) -> i64 {
        let digest = md5::compute(self.qualified().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.0[..8]);
        i64::from_be_bytes(bytes)
    }
}

/// Optional columns found on a legacy-shaped table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyColumns {
    pub rollback_sql: bool,
    /// Milliseconds spent executing the migration.
    pub execution_time: bool,
}

/// Layout of an existing tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingShape {
    /// `filename, applied_at, checksum, rollback_sql`.
    Current,
    /// Older layout that also requires `version` and `description`.
    Legacy(LegacyColumns),
    /// No `filename` column; awaiting an upgrade migration.
    Outdated,
}

impl TrackingShape {
    /// Marker value stored in the meta table, e.g. `legacy+rollback_sql`.
    /// Outdated is never persisted.
    pub fn marker(&self) -> String {
        match self {
            TrackingShape::Current => "current".to_string(),
            TrackingShape::Outdated => "outdated".to_string(),
            TrackingShape::Legacy(columns) => {
                let mut marker = "legacy".to_string();
                if columns.rollback_sql {
                    marker.push_str("+rollback_sql");
                }
                if columns.execution_time {
                    marker.push_str("+execution_time");
                }
                marker
            }
        }
    }

    /// Parse a stored marker. Unknown values yield `None`, which sends the
    /// caller back to column inspection.
    pub fn from_marker(marker: &str) -> Option<Self> {
        let mut parts = marker.trim().split('+');
        match parts.next()? {
            "current" => Some(TrackingShape::Current),
            "legacy" => {
                let mut columns = LegacyColumns::default();
                for part in parts {
                    match part {
                        "rollback_sql" => columns.rollback_sql = true,
                        "execution_time" => columns.execution_time = true,
                        _ => return None,
                    }
                }
                Some(TrackingShape::Legacy(columns))
            }
            _ => None,
        }
    }

    /// Classify an existing table from its column names.
    ///
    /// Returns `None` for a table with no columns, i.e. one that does not
    /// exist yet.
    pub fn detect<S: AsRef<str>>(columns: &[S]) -> Option<Self> {
        if columns.is_empty() {
            return None;
        }
        let has = |name: &str| columns.iter().any(|c| c.as_ref().eq_ignore_ascii_case(name));
        Some(if !has("filename") {
            TrackingShape::Outdated
        } else if has("version") {
            TrackingShape::Legacy(LegacyColumns {
                rollback_sql: has("rollback_sql"),
                execution_time: has("execution_time"),
            })
        } else {
            TrackingShape::Current
        })
    }
}

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub filename: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub rollback_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
