//! Fingerprint-based authorization backed by a newline-delimited file.

use std::path::PathBuf;

/// Decides whether a set of client fingerprints contains an authorized one.
///
/// Fingerprints are normalized to lowercase hex by the signaling broker
/// before they reach this trait, so comparison is exact.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, fingerprints: &[String]) -> bool;
}

/// Reads the authorized set from a file on every call, so edits to the file
/// take effect on the next connection without a restart. An unreadable or
/// empty file authorizes nobody.
pub struct FileAuthorizer {
    path: PathBuf,
}

impl FileAuthorizer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_tokens(&self) -> Vec<String> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read authorized tokens file"
                );
                return Vec::new();
            }
        };
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Authorizer for FileAuthorizer {
    fn is_authorized(&self, fingerprints: &[String]) -> bool {
        let tokens = self.read_tokens();
        if tokens.is_empty() {
            return false;
        }
        fingerprints.iter().any(|fp| tokens.contains(fp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tokens_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp tokens file");
        file.write_all(contents.as_bytes()).expect("write tokens");
        file
    }

    #[test]
    fn matches_any_listed_fingerprint() {
        let file = tokens_file("goodtoken\nanothergoodtoken\n");
        let auth = FileAuthorizer::new(file.path());
        assert!(auth.is_authorized(&["goodtoken".into()]));
        assert!(auth.is_authorized(&["bad".into(), "anothergoodtoken".into()]));
        assert!(!auth.is_authorized(&["badtoken".into()]));
    }

    #[test]
    fn lines_are_trimmed_and_blanks_skipped() {
        let file = tokens_file("  spaced  \n\n\ntail\n");
        let auth = FileAuthorizer::new(file.path());
        assert!(auth.is_authorized(&["spaced".into()]));
        assert!(auth.is_authorized(&["tail".into()]));
        assert!(!auth.is_authorized(&["".into()]));
    }

    #[test]
    fn empty_set_rejects_everyone() {
        let file = tokens_file("");
        let auth = FileAuthorizer::new(file.path());
        assert!(!auth.is_authorized(&["anything".into()]));
        assert!(!auth.is_authorized(&[]));
    }

    #[test]
    fn missing_file_rejects_everyone() {
        let auth = FileAuthorizer::new("/nonexistent/authorized_tokens");
        assert!(!auth.is_authorized(&["anything".into()]));
    }

    #[test]
    fn comparison_is_case_exact() {
        let file = tokens_file("abcdef012345\n");
        let auth = FileAuthorizer::new(file.path());
        assert!(auth.is_authorized(&["abcdef012345".into()]));
        assert!(!auth.is_authorized(&["ABCDEF012345".into()]));
    }
}
