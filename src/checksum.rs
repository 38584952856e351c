//! Content checksums for drift detection.
//!
//! New records always carry an MD5 digest. Rows written by the older
//! `schema_migrations` tooling hold SHA-256 digests, so verification picks
//! the algorithm from the recorded digest's length. Neither is used for
//! security; they only detect edits to an applied file.

use sha2::{Digest, Sha256};

/// Lowercase hex MD5 of a migration's contents.
pub fn checksum(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

fn sha256_hex(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Result of comparing a recorded checksum with the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Recorded and current contents agree.
    Match,
    /// The record has no checksum, so nothing can be compared.
    Unverifiable,
    /// The file changed after it was applied.
    Drift { recorded: String, current: String },
}

impl Verification {
    pub fn is_drift(&self) -> bool {
        matches!(self, Verification::Drift { .. })
    }
}

/// Compare a recorded checksum against the current file contents.
///
/// A drift result reports `current` in the recorded digest's algorithm so
/// both values in the warning are comparable.
pub fn verify(recorded: Option<&str>, content: &str) -> Verification {
    let recorded = match recorded.map(str::trim) {
        Some(r) if !r.is_empty() => r.to_ascii_lowercase(),
        _ => return Verification::Unverifiable,
    };

    let current = if recorded.len() == 64 {
        sha256_hex(content)
    } else {
        checksum(content)
    };

    if recorded == current {
        Verification::Match
    } else {
        Verification::Drift { recorded, current }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_lowercase_md5_hex() {
        assert_eq!(checksum(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            checksum("CREATE TABLE users (id serial);"),
            checksum("CREATE TABLE users (id serial);")
        );
        assert_ne!(checksum("a"), checksum("a "));
    }

    #[test]
    fn test_verify_match() {
        let sql = "ALTER TABLE users ADD COLUMN phone text;";
        assert_eq!(verify(Some(&checksum(sql)), sql), Verification::Match);
    }

    #[test]
    fn test_verify_uppercase_record_matches() {
        let sql = "SELECT 1;";
        let upper = checksum(sql).to_uppercase();
        assert_eq!(verify(Some(&upper), sql), Verification::Match);
    }

    #[test]
    fn test_verify_drift_names_both_checksums() {
        let result = verify(Some("abc123"), "SELECT 2;");
        assert_eq!(
            result,
            Verification::Drift {
                recorded: "abc123".to_string(),
                current: checksum("SELECT 2;"),
            }
        );
        assert!(result.is_drift());
    }

    #[test]
    fn test_verify_legacy_sha256_record() {
        let empty_sha256 = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(verify(Some(empty_sha256), ""), Verification::Match);
        assert!(verify(Some(empty_sha256), "changed").is_drift());
    }

    #[test]
    fn test_verify_missing_checksum() {
        assert_eq!(verify(None, "SELECT 1;"), Verification::Unverifiable);
        assert_eq!(verify(Some("  "), "SELECT 1;"), Verification::Unverifiable);
    }
}
