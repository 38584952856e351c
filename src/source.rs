//! Migration file discovery.
//!
//! A migration is any `*.sql` file in the migrations directory that is not
//! itself a `*.down.sql` file. `X.sql` and `X.up.sql` pair with an optional
//! `X.down.sql` holding the inverse SQL. Older files carry the inverse in a
//! trailing `-- ROLLBACK:` comment block instead; that block is used only
//! when no down file exists.
//!
//! Files are applied in byte-wise filename order. Nothing checks that this
//! order matches the real dependencies between migrations; the
//! `YYYYMMDDHHMMSS_` prefix is what keeps them causal.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DOWN_SUFFIX: &str = ".down.sql";
const UP_SUFFIX: &str = ".up.sql";
const SQL_SUFFIX: &str = ".sql";

/// Where a migration's rollback SQL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOrigin {
    DownFile,
    CommentBlock,
}

/// Version and description parsed from `<14 digits>_<slug>.sql`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub version: String,
    pub description: String,
}

/// A migration loaded from disk.
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub filename: String,
    pub path: PathBuf,
    pub content: String,
    pub rollback: Option<String>,
    pub rollback_origin: Option<RollbackOrigin>,
    /// `None` when the filename does not follow the timestamp convention.
    pub meta: Option<FileMeta>,
}

impl MigrationFile {
    /// Version value for the legacy tracking table, whose column holds at
    /// most 50 characters.
    pub fn legacy_version(&self) -> String {
        match &self.meta {
            Some(meta) => meta.version.clone(),
            None => stem(&self.filename).replace('_', "-").chars().take(50).collect(),
        }
    }

    /// Description value for the legacy tracking table.
    pub fn legacy_description(&self) -> String {
        match &self.meta {
            Some(meta) => meta.description.clone(),
            None => format!("Migration: {}", self.filename),
        }
    }
}

/// Whether a directory entry is an applicable migration.
pub fn is_migration(filename: &str) -> bool {
    filename.ends_with(SQL_SUFFIX) && !filename.ends_with(DOWN_SUFFIX)
}

fn stem(filename: &str) -> &str {
    filename
        .strip_suffix(UP_SUFFIX)
        .or_else(|| filename.strip_suffix(SQL_SUFFIX))
        .unwrap_or(filename)
}

/// Name of the down file paired with a migration.
pub fn down_filename(filename: &str) -> String {
    format!("{}{}", stem(filename), DOWN_SUFFIX)
}

/// Parse `YYYYMMDDHHMMSS_descriptive_name.sql` (or `.up.sql`).
pub fn parse_filename(filename: &str) -> Option<FileMeta> {
    let stem = stem(filename);
    if stem.len() == filename.len() {
        return None;
    }
    let (version, rest) = stem.split_at_checked(14)?;
    if !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let slug = rest.strip_prefix('_')?;
    if slug.is_empty() {
        return None;
    }
    Some(FileMeta {
        version: version.to_string(),
        description: slug.replace('_', " "),
    })
}

/// Extract the inverse SQL from a trailing `-- ROLLBACK:` comment block.
///
/// The block is the text after the marker on its own line plus every
/// following line that is still a `--` comment, with the comment prefix
/// removed. A blank or non-comment line ends it.
pub fn extract_rollback_block(content: &str) -> Option<String> {
    let mut lines = content.lines();
    let mut block: Vec<&str> = Vec::new();

    loop {
        let line = lines.next()?;
        let Some(comment) = line.trim_start().strip_prefix("--") else {
            continue;
        };
        let comment = comment.trim_start();
        if comment
            .get(..9)
            .is_some_and(|marker| marker.eq_ignore_ascii_case("ROLLBACK:"))
        {
            let inline = comment[9..].trim();
            if !inline.is_empty() {
                block.push(inline);
            }
            break;
        }
    }

    for line in lines {
        match line.trim_start().strip_prefix("--") {
            Some(rest) if !rest.trim().is_empty() => block.push(rest.trim()),
            _ => break,
        }
    }

    if block.is_empty() {
        None
    } else {
        Some(block.join("\n"))
    }
}

/// A directory of migration files.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
}

impl MigrationSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sorted migration filenames. A missing directory has no migrations.
    pub fn filenames(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| Error::io(entry.path(), e))?
                .is_file();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && is_migration(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load one migration and its rollback SQL.
    pub fn load(&self, filename: &str) -> Result<MigrationFile> {
        let path = self.dir.join(filename);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

        let down_path = self.dir.join(down_filename(filename));
        let (rollback, rollback_origin) = if down_path.is_file() {
            let down = fs::read_to_string(&down_path).map_err(|e| Error::io(&down_path, e))?;
            let down = down.trim();
            if down.is_empty() {
                (None, None)
            } else {
                (Some(down.to_string()), Some(RollbackOrigin::DownFile))
            }
        } else {
            match extract_rollback_block(&content) {
                Some(block) => (Some(block), Some(RollbackOrigin::CommentBlock)),
                None => (None, None),
            }
        };

        Ok(MigrationFile {
            filename: filename.to_string(),
            path,
            content,
            rollback,
            rollback_origin,
            meta: parse_filename(filename),
        })
    }

    /// Load every migration in application order.
    pub fn load_all(&self) -> Result<Vec<MigrationFile>> {
        self.filenames()?
            .iter()
            .map(|name| self.load(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_is_migration() {
        assert!(is_migration("001_init.sql"));
        assert!(is_migration("20241220143022_add_users.up.sql"));
        assert!(!is_migration("20241220143022_add_users.down.sql"));
        assert!(!is_migration("README.md"));
    }

    #[test]
    fn test_down_filename() {
        assert_eq!(down_filename("001_init.sql"), "001_init.down.sql");
        assert_eq!(down_filename("002_users.up.sql"), "002_users.down.sql");
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("20241220143022_add_user_authentication.sql"),
            Some(FileMeta {
                version: "20241220143022".to_string(),
                description: "add user authentication".to_string(),
            })
        );
        assert_eq!(
            parse_filename("20241220143022_add_users.up.sql").map(|m| m.description),
            Some("add users".to_string())
        );
        assert_eq!(parse_filename("001_init.sql"), None);
        assert_eq!(parse_filename("20241220143022_.sql"), None);
        assert_eq!(parse_filename("2024122014302x_bad.sql"), None);
        assert_eq!(parse_filename("20241220143022_notes.txt"), None);
    }

    #[test]
    fn test_legacy_fields_for_unconventional_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_add_phone.sql", "SELECT 1;");
        let file = MigrationSource::new(dir.path()).load("001_add_phone.sql").unwrap();
        assert_eq!(file.legacy_version(), "001-add-phone");
        assert_eq!(file.legacy_description(), "Migration: 001_add_phone.sql");
    }

    #[test]
    fn test_extract_rollback_block_template_style() {
        let sql = "CREATE TABLE t (id int);\n\n-- ROLLBACK:\n-- DROP TABLE IF EXISTS t;\n";
        assert_eq!(
            extract_rollback_block(sql),
            Some("DROP TABLE IF EXISTS t;".to_string())
        );
    }

    #[test]
    fn test_extract_rollback_block_inline_and_multiline() {
        let sql = "ALTER TABLE t ADD c int;\n--rollback: ALTER TABLE t DROP c;\n-- DROP INDEX idx_c;\n\n-- unrelated\n";
        assert_eq!(
            extract_rollback_block(sql),
            Some("ALTER TABLE t DROP c;\nDROP INDEX idx_c;".to_string())
        );
    }

    #[test]
    fn test_extract_rollback_block_absent() {
        assert_eq!(extract_rollback_block("SELECT 1;\n-- just a note\n"), None);
        assert_eq!(extract_rollback_block("-- ROLLBACK:\nSELECT 1;"), None);
    }

    #[test]
    fn test_filenames_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "003_index.sql", "");
        write(dir.path(), "001_init.sql", "");
        write(dir.path(), "002_add_col.up.sql", "");
        write(dir.path(), "002_add_col.down.sql", "");
        write(dir.path(), "notes.txt", "");
        fs::create_dir(dir.path().join("archive.sql")).unwrap();

        let names = MigrationSource::new(dir.path()).filenames().unwrap();
        assert_eq!(names, vec!["001_init.sql", "002_add_col.up.sql", "003_index.sql"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = MigrationSource::new(dir.path().join("nope"));
        assert!(source.filenames().unwrap().is_empty());
    }

    #[test]
    fn test_down_file_wins_over_comment_block() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "001_init.sql",
            "CREATE TABLE a (id int);\n-- ROLLBACK:\n-- DROP TABLE b;\n",
        );
        write(dir.path(), "001_init.down.sql", "DROP TABLE a;\n");

        let file = MigrationSource::new(dir.path()).load("001_init.sql").unwrap();
        assert_eq!(file.rollback.as_deref(), Some("DROP TABLE a;"));
        assert_eq!(file.rollback_origin, Some(RollbackOrigin::DownFile));
    }

    #[test]
    fn test_comment_block_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "001_init.sql",
            "CREATE TABLE a (id int);\n-- ROLLBACK:\n-- DROP TABLE a;\n",
        );

        let file = MigrationSource::new(dir.path()).load("001_init.sql").unwrap();
        assert_eq!(file.rollback.as_deref(), Some("DROP TABLE a;"));
        assert_eq!(file.rollback_origin, Some(RollbackOrigin::CommentBlock));
        assert!(file.meta.is_none());
    }
}
