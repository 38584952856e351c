//! Migration plan (dry-run)

use tracing::debug;

use crate::checksum::{Verification, verify};
use crate::error::Result;
use crate::source::{MigrationFile, MigrationSource};
use crate::store::MigrationStore;
use crate::tracking::MigrationRecord;

/// What `up` will do with one file.
#[derive(Debug, Clone)]
pub enum PlanStep {
    Apply(MigrationFile),
    AlreadyApplied {
        filename: String,
    },
    /// Recorded with a different checksum; never reapplied.
    Drifted {
        filename: String,
        recorded: String,
        current: String,
    },
}

impl PlanStep {
    pub fn filename(&self) -> &str {
        match self {
            PlanStep::Apply(file) => &file.filename,
            PlanStep::AlreadyApplied { filename } | PlanStep::Drifted { filename, .. } => filename,
        }
    }
}

/// Ordered steps for every migration on disk.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Match files (already in application order) against records.
    pub fn build(files: Vec<MigrationFile>, records: &[MigrationRecord]) -> Self {
        let steps = files
            .into_iter()
            .map(|file| {
                let Some(record) = records.iter().find(|r| r.filename == file.filename) else {
                    return PlanStep::Apply(file);
                };
                match verify(record.checksum.as_deref(), &file.content) {
                    Verification::Match => PlanStep::AlreadyApplied {
                        filename: file.filename,
                    },
                    Verification::Unverifiable => {
                        debug!(
                            filename = %file.filename,
                            "record has no checksum; treating as applied"
                        );
                        PlanStep::AlreadyApplied {
                            filename: file.filename,
                        }
                    }
                    Verification::Drift { recorded, current } => PlanStep::Drifted {
                        filename: file.filename,
                        recorded,
                        current,
                    },
                }
            })
            .collect();
        Self { steps }
    }

    pub fn pending(&self) -> impl Iterator<Item = &MigrationFile> {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Apply(file) => Some(file),
            _ => None,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn drifted_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Drifted { .. }))
            .count()
    }
}

/// Build the plan against the current tracking table without executing
/// anything.
pub async fn migrate_plan(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
) -> Result<Plan> {
    store.ensure_tracking_table().await?;
    let records = store.records().await?;
    let files = source.load_all()?;
    Ok(Plan::build(files, &records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use std::path::PathBuf;

    fn file(name: &str, content: &str) -> MigrationFile {
        MigrationFile {
            filename: name.to_string(),
            path: PathBuf::from(name),
            content: content.to_string(),
            rollback: None,
            rollback_origin: None,
            meta: None,
        }
    }

    fn record(name: &str, checksum: Option<&str>) -> MigrationRecord {
        MigrationRecord {
            filename: name.to_string(),
            applied_at: None,
            checksum: checksum.map(str::to_string),
            rollback_sql: None,
            version: None,
            description: None,
        }
    }

    #[test]
    fn test_build_classifies_each_file() {
        let files = vec![
            file("001_init.sql", "CREATE TABLE a (id int);"),
            file("002_add_col.sql", "ALTER TABLE a ADD b int;"),
            file("003_index.sql", "CREATE INDEX i ON a (b);"),
            file("004_legacy.sql", "SELECT 1;"),
        ];
        let records = vec![
            record("001_init.sql", Some(&checksum("CREATE TABLE a (id int);"))),
            record("002_add_col.sql", Some("abc123")),
            record("004_legacy.sql", None),
        ];

        let plan = Plan::build(files, &records);
        let kinds: Vec<&str> = plan
            .steps
            .iter()
            .map(|s| match s {
                PlanStep::Apply(_) => "apply",
                PlanStep::AlreadyApplied { .. } => "applied",
                PlanStep::Drifted { .. } => "drifted",
            })
            .collect();

        assert_eq!(kinds, vec!["applied", "drifted", "apply", "applied"]);
        assert_eq!(plan.pending_count(), 1);
        assert_eq!(plan.drifted_count(), 1);
        assert_eq!(plan.steps[1].filename(), "002_add_col.sql");
    }

    #[test]
    fn test_build_preserves_file_order() {
        let files = vec![file("100_a.sql", "SELECT 1;"), file("200_b.sql", "SELECT 2;")];
        let plan = Plan::build(files, &[]);
        let names: Vec<&str> = plan.pending().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["100_a.sql", "200_b.sql"]);
    }
}
