//! Remote-URL normalization.
//!
//! Every URL that participates in task routing is reduced to the canonical
//! `host/owner/repo` form so that `git@github.com:user/repo.git`,
//! `https://github.com/user/repo`, and `ssh://git@github.com/user/repo.git`
//! all key the same project registry entry.

use std::path::Path;

/// Protocol prefixes stripped during normalization, longest first so
/// `ssh://git@` wins over `git@`.
const PREFIXES: [&str; 4] = ["ssh://git@", "https://", "http://", "git@"];

/// Normalize a git remote URL to `host/owner/repo`.
///
/// Idempotent: normalizing an already-normalized string returns it unchanged.
pub fn normalize_remote(url: &str) -> String {
    let mut s = url.trim().to_string();

    for prefix in PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }

    // scp-style `host:owner/repo` — replace the first ':' with '/'
    if s.contains(':') && !s.contains("://") {
        s = s.replacen(':', "/", 1);
    }

    if let Some(stripped) = s.strip_suffix(".git") {
        s = stripped.to_string();
    }

    s
}

/// Normalized `origin` remote of the repository at `dir`, if any.
///
/// Returns `None` when `dir` is not inside a git checkout or the checkout
/// has no `origin` remote.
pub fn repo_remote(dir: &Path) -> Option<String> {
    let repo = git2::Repository::discover(dir).ok()?;
    let remote = repo.find_remote("origin").ok()?;
    remote.url().map(normalize_remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_https_and_git_suffix() {
        assert_eq!(
            normalize_remote("https://github.com/user/repo.git"),
            "github.com/user/repo"
        );
    }

    #[test]
    fn converts_scp_style() {
        assert_eq!(
            normalize_remote("git@github.com:user/repo.git"),
            "github.com/user/repo"
        );
    }

    #[test]
    fn strips_ssh_prefix() {
        assert_eq!(
            normalize_remote("ssh://git@github.com/user/repo.git"),
            "github.com/user/repo"
        );
    }

    #[test]
    fn plain_http() {
        assert_eq!(
            normalize_remote("http://gitlab.example.com/team/proj"),
            "gitlab.example.com/team/proj"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_remote("git@github.com:user/repo.git");
        assert_eq!(normalize_remote(&once), once);
    }

    #[test]
    fn only_first_colon_is_replaced() {
        assert_eq!(
            normalize_remote("git@host.com:user/repo:odd"),
            "host.com/user/repo:odd"
        );
    }
}
