//! API credential lookup.
//!
//! Precedence: `PUSH_API_KEY` in the process environment, then the
//! `~/.config/push/config` file parsed line-by-line for shell-style
//! `export PUSH_API_KEY="..."` entries (quotes optional). The credential is
//! re-read on every API call so a re-auth takes effect without a daemon
//! restart.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("PUSH_API_KEY is not configured — set the environment variable or add it to ~/.config/push/config")]
    NotConfigured,
}

const API_KEY_VAR: &str = "PUSH_API_KEY";
const EMAIL_VAR: &str = "PUSH_EMAIL";

/// Resolve the API key: environment first, then the credential file.
pub fn api_key(credential_file: &Path) -> Result<String, CredentialError> {
    if let Ok(key) = std::env::var(API_KEY_VAR) {
        if !key.is_empty() {
            return Ok(key);
        }
    }
    read_entry(credential_file, API_KEY_VAR).ok_or(CredentialError::NotConfigured)
}

/// The account email recorded at connect time, if any. Display-only.
pub fn email(credential_file: &Path) -> Option<String> {
    if let Ok(value) = std::env::var(EMAIL_VAR) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    read_entry(credential_file, EMAIL_VAR)
}

/// Scan the config file for an `export KEY="value"` line.
fn read_entry(path: &Path, key: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let line = line.trim();
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim() != key {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (tmp, path)
    }

    #[test]
    fn parses_export_lines_with_quotes() {
        let (_tmp, path) = write_config("export PUSH_API_KEY=\"sk-abc123\"\nexport PUSH_EMAIL=\"me@example.com\"\n");
        assert_eq!(read_entry(&path, "PUSH_API_KEY").as_deref(), Some("sk-abc123"));
        assert_eq!(email(&path).as_deref(), Some("me@example.com"));
    }

    #[test]
    fn quotes_are_optional() {
        let (_tmp, path) = write_config("PUSH_API_KEY=sk-plain\n");
        assert_eq!(read_entry(&path, "PUSH_API_KEY").as_deref(), Some("sk-plain"));
    }

    #[test]
    fn missing_file_is_not_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let err = api_key(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, CredentialError::NotConfigured));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let (_tmp, path) = write_config("# comment\nPATH=/usr/bin\nexport PUSH_API_KEY='sk-q'\n");
        assert_eq!(read_entry(&path, "PUSH_API_KEY").as_deref(), Some("sk-q"));
    }
}
