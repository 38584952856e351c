//! Migration status operations

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checksum::{Verification, verify};
use crate::error::Result;
use crate::source::{MigrationFile, MigrationSource};
use crate::store::MigrationStore;
use crate::tracking::{MigrationRecord, TrackingShape};

/// State of one migration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Applied {
        applied_at: Option<DateTime<Utc>>,
    },
    Pending,
    Drifted {
        applied_at: Option<DateTime<Utc>>,
        recorded: String,
        current: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub filename: String,
    #[serde(flatten)]
    pub state: FileState,
    /// Description parsed from a conventional filename.
    pub description: Option<String>,
    /// Whether the filename follows `YYYYMMDDHHMMSS_slug.sql`.
    pub conventional: bool,
    pub has_rollback: bool,
}

/// Files on disk reconciled with the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub tracking_shape: TrackingShape,
    pub entries: Vec<StatusEntry>,
    /// Records whose file is no longer on disk.
    pub missing: Vec<MigrationRecord>,
}

impl StatusReport {
    pub fn reconcile(
        shape: TrackingShape,
        files: &[MigrationFile],
        records: &[MigrationRecord],
    ) -> Self {
        let entries = files
            .iter()
            .map(|file| {
                let state = match records.iter().find(|r| r.filename == file.filename) {
                    None => FileState::Pending,
                    Some(record) => match verify(record.checksum.as_deref(), &file.content) {
                        Verification::Drift { recorded, current } => FileState::Drifted {
                            applied_at: record.applied_at,
                            recorded,
                            current,
                        },
                        _ => FileState::Applied {
                            applied_at: record.applied_at,
                        },
                    },
                };
                StatusEntry {
                    filename: file.filename.clone(),
                    state,
                    description: file.meta.as_ref().map(|m| m.description.clone()),
                    conventional: file.meta.is_some(),
                    has_rollback: file.rollback.is_some(),
                }
            })
            .collect();

        let missing = records
            .iter()
            .filter(|r| !files.iter().any(|f| f.filename == r.filename))
            .cloned()
            .collect();

        Self {
            tracking_shape: shape,
            entries,
            missing,
        }
    }

    fn count(&self, pred: impl Fn(&FileState) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.state)).count()
    }

    pub fn applied_count(&self) -> usize {
        self.count(|s| matches!(s, FileState::Applied { .. }))
    }

    pub fn pending_count(&self) -> usize {
        self.count(|s| matches!(s, FileState::Pending))
    }

    pub fn drifted_count(&self) -> usize {
        self.count(|s| matches!(s, FileState::Drifted { .. }))
    }

    pub fn pending(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, FileState::Pending))
    }
}

/// Show migration status. Read-only apart from creating the tracking table.
pub async fn migrate_status(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
) -> Result<StatusReport> {
    let shape = store.ensure_tracking_table().await?;
    let records = store.records().await?;
    let files = source.load_all()?;
    Ok(StatusReport::reconcile(shape, &files, &records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use crate::source::parse_filename;
    use std::path::PathBuf;

    fn file(name: &str, content: &str) -> MigrationFile {
        MigrationFile {
            filename: name.to_string(),
            path: PathBuf::from(name),
            content: content.to_string(),
            rollback: None,
            rollback_origin: None,
            meta: parse_filename(name),
        }
    }

    fn record(name: &str, checksum: &str) -> MigrationRecord {
        MigrationRecord {
            filename: name.to_string(),
            applied_at: Some(Utc::now()),
            checksum: Some(checksum.to_string()),
            rollback_sql: None,
            version: None,
            description: None,
        }
    }

    #[test]
    fn test_reconcile_counts() {
        let files = vec![
            file("20240101000000_init.sql", "CREATE TABLE a (id int);"),
            file("20240102000000_add_b.sql", "ALTER TABLE a ADD b int;"),
            file("notes_fix.sql", "SELECT 1;"),
        ];
        let records = vec![
            record("20240101000000_init.sql", &checksum("CREATE TABLE a (id int);")),
            record("20240102000000_add_b.sql", "abc123"),
            record("20231231000000_removed.sql", "ffff"),
        ];

        let report = StatusReport::reconcile(TrackingShape::Current, &files, &records);
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.drifted_count(), 1);
        assert_eq!(report.pending_count(), 1);
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].filename, "20231231000000_removed.sql");

        let pending: Vec<&str> = report.pending().map(|e| e.filename.as_str()).collect();
        assert_eq!(pending, vec!["notes_fix.sql"]);
        assert!(!report.entries[2].conventional);
        assert_eq!(report.entries[0].description.as_deref(), Some("init"));
    }

    #[test]
    fn test_status_serializes_state_tag() {
        let report = StatusReport::reconcile(
            TrackingShape::Current,
            &[file("001_init.sql", "SELECT 1;")],
            &[],
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tracking_shape"], "current");
        assert_eq!(json["entries"][0]["state"], "pending");
        assert_eq!(json["entries"][0]["filename"], "001_init.sql");
    }
}
