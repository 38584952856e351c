//! Migration creation

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::source::down_filename;

const SLUG_MAX_LEN: usize = 50;

/// Starter SQL for a new migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Generic,
    Table {
        table: String,
    },
    Column {
        table: String,
        column: String,
        column_type: Option<String>,
    },
    Index {
        table: String,
        index: String,
        columns: Option<String>,
    },
    Data,
    Constraint {
        table: String,
        name: String,
        definition: Option<String>,
    },
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Template::Generic => "generic",
            Template::Table { .. } => "table",
            Template::Column { .. } => "column",
            Template::Index { .. } => "index",
            Template::Data => "data",
            Template::Constraint { .. } => "constraint",
        }
    }

    /// Render the up and down file contents.
    pub fn render(&self, description: &str, created: DateTime<Utc>) -> (String, String) {
        let (body, inverse) = match self {
            Template::Generic => (
                "-- Add your migration SQL here\n\
                 -- Example:\n\
                 -- CREATE TABLE example_table (\n\
                 --   id SERIAL PRIMARY KEY,\n\
                 --   name VARCHAR(255) NOT NULL,\n\
                 --   created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP\n\
                 -- );\n"
                    .to_string(),
                "-- DROP TABLE IF EXISTS example_table;\n".to_string(),
            ),
            Template::Table { table } => (
                format!(
                    "-- Create {table} table\n\
                     CREATE TABLE {table} (\n\
                     \x20 id SERIAL PRIMARY KEY,\n\
                     \x20 created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,\n\
                     \x20 updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP\n\
                     );\n\n\
                     -- CREATE INDEX idx_{table}_created_at ON {table}(created_at);\n"
                ),
                format!("DROP TABLE IF EXISTS {table};\n"),
            ),
            Template::Column {
                table,
                column,
                column_type,
            } => {
                let column_type = column_type.as_deref().unwrap_or("VARCHAR(255)");
                (
                    format!(
                        "-- Add {column} column to {table}\n\
                         ALTER TABLE {table}\n\
                         ADD COLUMN {column} {column_type};\n\n\
                         -- CREATE INDEX idx_{table}_{column} ON {table}({column});\n"
                    ),
                    format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {column};\n"),
                )
            }
            Template::Index {
                table,
                index,
                columns,
            } => {
                let columns = columns.as_deref().unwrap_or("id");
                (
                    format!(
                        "-- Create index on {table}\n\
                         CREATE INDEX {index} ON {table}({columns});\n"
                    ),
                    format!("DROP INDEX IF EXISTS {index};\n"),
                )
            }
            Template::Data => (
                "-- Data migration\n\
                 -- Example: UPDATE table_name SET column_name = 'new_value' WHERE condition;\n"
                    .to_string(),
                "-- UPDATE table_name SET column_name = 'old_value' WHERE condition;\n".to_string(),
            ),
            Template::Constraint {
                table,
                name,
                definition,
            } => {
                let definition = definition.as_deref().unwrap_or("CHECK (id > 0)");
                (
                    format!(
                        "-- Add constraint to {table}\n\
                         ALTER TABLE {table}\n\
                         ADD CONSTRAINT {name} {definition};\n"
                    ),
                    format!("ALTER TABLE {table} DROP CONSTRAINT IF EXISTS {name};\n"),
                )
            }
        };

        let created = created.to_rfc3339_opts(SecondsFormat::Millis, true);
        let up = format!("-- Migration: {description}\n-- Created: {created}\n\n{body}");
        let down = format!("-- Rollback: {description}\n-- Created: {created}\n\n{inverse}");
        (up, down)
    }
}

/// Lowercase, keep `[a-z0-9 ]`, join whitespace runs with `_`, cap at 50.
pub fn slugify(description: &str) -> Result<String> {
    let kept: String = description
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    let joined = kept.split_whitespace().collect::<Vec<_>>().join("_");
    let slug: String = joined.chars().take(SLUG_MAX_LEN).collect();
    let slug = slug.trim_end_matches('_').to_string();

    if slug.is_empty() {
        return Err(Error::Config(format!(
            "description {:?} has no characters usable in a filename",
            description
        )));
    }
    Ok(slug)
}

/// `<YYYYMMDDHHMMSS>_<slug>.sql` for the given instant.
pub fn migration_filename(description: &str, now: DateTime<Utc>) -> Result<String> {
    Ok(format!("{}_{}.sql", now.format("%Y%m%d%H%M%S"), slugify(description)?))
}

/// Files written by [`migrate_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMigration {
    pub filename: String,
    pub path: PathBuf,
    pub down_path: PathBuf,
}

/// Write a new migration and its `.down.sql` into `dir`.
///
/// Existing files are never overwritten.
pub fn migrate_create(
    dir: &Path,
    description: &str,
    template: &Template,
    now: DateTime<Utc>,
) -> Result<CreatedMigration> {
    let filename = migration_filename(description, now)?;
    let path = dir.join(&filename);
    let down_path = dir.join(down_filename(&filename));

    for target in [&path, &down_path] {
        if target.exists() {
            return Err(Error::AlreadyExists(target.clone()));
        }
    }

    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }

    let (up, down) = template.render(description, now);
    fs::write(&path, up).map_err(|e| Error::io(&path, e))?;
    fs::write(&down_path, down).map_err(|e| Error::io(&down_path, e))?;

    Ok(CreatedMigration {
        filename,
        path,
        down_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MigrationSource, RollbackOrigin};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 20, 14, 30, 22).unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add User Authentication").unwrap(), "add_user_authentication");
        assert_eq!(slugify("  fix:  orders (v2)!  ").unwrap(), "fix_orders_v2");
        assert_eq!(slugify("a".repeat(80).as_str()).unwrap().len(), 50);
        assert!(slugify("!!!").is_err());
    }

    #[test]
    fn test_slugify_trims_trailing_separator_after_cut() {
        let description = format!("{} tail", "x".repeat(49));
        assert_eq!(slugify(&description).unwrap(), "x".repeat(49));
    }

    #[test]
    fn test_migration_filename() {
        assert_eq!(
            migration_filename("Add phone to users", at()).unwrap(),
            "20241220143022_add_phone_to_users.sql"
        );
    }

    #[test]
    fn test_render_column_defaults() {
        let template = Template::Column {
            table: "users".to_string(),
            column: "phone".to_string(),
            column_type: None,
        };
        let (up, down) = template.render("add phone", at());
        assert!(
            up.starts_with("-- Migration: add phone\n-- Created: 2024-12-20T14:30:22.000Z\n\n")
        );
        assert!(up.contains("ADD COLUMN phone VARCHAR(255);"));
        assert!(down.contains("ALTER TABLE users DROP COLUMN IF EXISTS phone;"));
    }

    #[test]
    fn test_render_index_and_constraint_defaults() {
        let (up, _) = Template::Index {
            table: "users".to_string(),
            index: "idx_users_id".to_string(),
            columns: None,
        }
        .render("index", at());
        assert!(up.contains("CREATE INDEX idx_users_id ON users(id);"));

        let (up, down) = Template::Constraint {
            table: "orders".to_string(),
            name: "ck_orders_id".to_string(),
            definition: None,
        }
        .render("constraint", at());
        assert!(up.contains("ADD CONSTRAINT ck_orders_id CHECK (id > 0);"));
        assert!(down.contains("DROP CONSTRAINT IF EXISTS ck_orders_id;"));
    }

    #[test]
    fn test_create_writes_pair_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        let template = Template::Table {
            table: "widgets".to_string(),
        };

        let created = migrate_create(&migrations, "create widgets", &template, at()).unwrap();
        assert_eq!(created.filename, "20241220143022_create_widgets.sql");
        assert!(created.path.is_file());
        assert_eq!(
            created.down_path,
            migrations.join("20241220143022_create_widgets.down.sql")
        );

        let loaded = MigrationSource::new(&migrations).load(&created.filename).unwrap();
        assert_eq!(loaded.rollback_origin, Some(RollbackOrigin::DownFile));
        assert!(loaded.rollback.unwrap().ends_with("DROP TABLE IF EXISTS widgets;"));

        let err = migrate_create(&migrations, "create widgets", &template, at()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }
}
