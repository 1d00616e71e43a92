//! Project registry — maps normalized git remotes to local checkouts.
//!
//! The routed daemon resolves each task's `git_remote` through this registry
//! to find the directory it should work in. Backed by a single versioned
//! JSON file (`~/.config/push/projects.json`). The file is written only by
//! short-lived foreground commands, never by the daemon loop, so plain
//! last-write-wins is good enough — no lock file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const REGISTRY_VERSION: u32 = 1;

// ─── On-disk format ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub local_path: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryData {
    version: u32,
    projects: BTreeMap<String, ProjectEntry>,
    default_project: Option<String>,
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            projects: BTreeMap::new(),
            default_project: None,
        }
    }
}

/// Why a registered path failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    PathNotFound,
    NotADirectory,
    NotAGitRepo,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidEntry {
    pub remote: String,
    pub local_path: PathBuf,
    pub reason: InvalidReason,
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct ProjectRegistry {
    path: PathBuf,
    data: RegistryData,
}

impl ProjectRegistry {
    /// Load the registry from `path`. A missing or unreadable file yields an
    /// empty registry — corruption is logged, never fatal.
    pub fn open(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RegistryData>(&contents) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "unparseable project registry — starting empty");
                    RegistryData::default()
                }
            },
            Err(_) => RegistryData::default(),
        };
        Self {
            path: path.to_path_buf(),
            data,
        }
    }

    /// Register a project, creating or updating its entry.
    ///
    /// The first project ever registered becomes the default. Returns `true`
    /// if the remote was newly registered, `false` if an existing entry was
    /// updated.
    pub fn register(&mut self, remote: &str, local_path: &Path) -> Result<bool> {
        let now = Utc::now();
        let is_new = !self.data.projects.contains_key(remote);

        match self.data.projects.get_mut(remote) {
            Some(entry) => {
                entry.local_path = local_path.to_path_buf();
                entry.last_used = now;
            }
            None => {
                self.data.projects.insert(
                    remote.to_string(),
                    ProjectEntry {
                        local_path: local_path.to_path_buf(),
                        registered_at: now,
                        last_used: now,
                    },
                );
            }
        }

        if self.data.default_project.is_none() {
            self.data.default_project = Some(remote.to_string());
        }

        self.save()?;
        Ok(is_new)
    }

    /// Look up the local path for a remote and bump its `last_used` stamp.
    pub fn resolve(&mut self, remote: &str) -> Option<PathBuf> {
        let path = {
            let entry = self.data.projects.get_mut(remote)?;
            entry.last_used = Utc::now();
            entry.local_path.clone()
        };
        if let Err(e) = self.save() {
            warn!(err = %e, "failed to persist last_used update");
        }
        Some(path)
    }

    /// Look up the local path without touching `last_used`.
    pub fn peek(&self, remote: &str) -> Option<PathBuf> {
        self.data.projects.get(remote).map(|e| e.local_path.clone())
    }

    pub fn list(&self) -> impl Iterator<Item = (&str, &ProjectEntry)> {
        self.data.projects.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn count(&self) -> usize {
        self.data.projects.len()
    }

    pub fn is_registered(&self, remote: &str) -> bool {
        self.data.projects.contains_key(remote)
    }

    /// Remove a project. If it was the default, any remaining entry becomes
    /// the new default. Returns `true` if the remote was registered.
    pub fn unregister(&mut self, remote: &str) -> Result<bool> {
        if self.data.projects.remove(remote).is_none() {
            return Ok(false);
        }
        if self.data.default_project.as_deref() == Some(remote) {
            self.data.default_project = self.data.projects.keys().next().cloned();
        }
        self.save()?;
        Ok(true)
    }

    pub fn get_default(&self) -> Option<&str> {
        self.data.default_project.as_deref()
    }

    /// Mark a registered project as the default. Returns `false` for an
    /// unknown remote.
    pub fn set_default(&mut self, remote: &str) -> Result<bool> {
        if !self.data.projects.contains_key(remote) {
            return Ok(false);
        }
        self.data.default_project = Some(remote.to_string());
        self.save()?;
        Ok(true)
    }

    /// Report entries whose path is missing, not a directory, or not a git
    /// checkout. Invalid entries are reported, never removed — the checkout
    /// may live on an unmounted volume.
    pub fn validate(&self) -> Vec<InvalidEntry> {
        let mut invalid = Vec::new();
        for (remote, entry) in &self.data.projects {
            let path = &entry.local_path;
            let reason = if !path.exists() {
                Some(InvalidReason::PathNotFound)
            } else if !path.is_dir() {
                Some(InvalidReason::NotADirectory)
            } else if !path.join(".git").exists() {
                Some(InvalidReason::NotAGitRepo)
            } else {
                None
            };
            if let Some(reason) = reason {
                invalid.push(InvalidEntry {
                    remote: remote.clone(),
                    local_path: path.clone(),
                    reason,
                });
            }
        }
        invalid
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.data).context("serialize registry")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("projects.json");
        (tmp, path)
    }

    #[test]
    fn first_registration_becomes_default() {
        let (_tmp, path) = scratch();
        let mut reg = ProjectRegistry::open(&path);

        assert!(reg.register("github.com/u/a", Path::new("/tmp/a")).unwrap());
        assert!(reg.register("github.com/u/b", Path::new("/tmp/b")).unwrap());
        assert_eq!(reg.get_default(), Some("github.com/u/a"));
    }

    #[test]
    fn register_twice_updates_in_place() {
        let (_tmp, path) = scratch();
        let mut reg = ProjectRegistry::open(&path);

        assert!(reg.register("github.com/u/a", Path::new("/tmp/a")).unwrap());
        assert!(!reg.register("github.com/u/a", Path::new("/tmp/a2")).unwrap());
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.peek("github.com/u/a"), Some(PathBuf::from("/tmp/a2")));
    }

    #[test]
    fn resolve_bumps_last_used_but_peek_does_not() {
        let (_tmp, path) = scratch();
        let mut reg = ProjectRegistry::open(&path);
        reg.register("github.com/u/a", Path::new("/tmp/a")).unwrap();

        let before = reg.data.projects["github.com/u/a"].last_used;
        let _ = reg.peek("github.com/u/a");
        assert_eq!(reg.data.projects["github.com/u/a"].last_used, before);

        let resolved = reg.resolve("github.com/u/a");
        assert_eq!(resolved, Some(PathBuf::from("/tmp/a")));
        assert!(reg.data.projects["github.com/u/a"].last_used >= before);
    }

    #[test]
    fn unregister_reelects_default() {
        let (_tmp, path) = scratch();
        let mut reg = ProjectRegistry::open(&path);
        reg.register("github.com/u/a", Path::new("/tmp/a")).unwrap();
        reg.register("github.com/u/b", Path::new("/tmp/b")).unwrap();

        assert!(reg.unregister("github.com/u/a").unwrap());
        assert_eq!(reg.get_default(), Some("github.com/u/b"));

        assert!(reg.unregister("github.com/u/b").unwrap());
        assert_eq!(reg.get_default(), None);
        assert!(!reg.unregister("github.com/u/b").unwrap());
    }

    #[test]
    fn state_survives_reload() {
        let (_tmp, path) = scratch();
        {
            let mut reg = ProjectRegistry::open(&path);
            reg.register("github.com/u/a", Path::new("/tmp/a")).unwrap();
            reg.set_default("github.com/u/a").unwrap();
        }
        let reg = ProjectRegistry::open(&path);
        assert!(reg.is_registered("github.com/u/a"));
        assert_eq!(reg.get_default(), Some("github.com/u/a"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let (_tmp, path) = scratch();
        std::fs::write(&path, "{not json").unwrap();
        let reg = ProjectRegistry::open(&path);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn validate_reports_but_keeps_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("projects.json");
        let real_dir = tmp.path().join("real");
        std::fs::create_dir_all(real_dir.join(".git")).unwrap();

        let mut reg = ProjectRegistry::open(&path);
        reg.register("github.com/u/good", &real_dir).unwrap();
        reg.register("github.com/u/gone", &tmp.path().join("missing")).unwrap();
        let no_git = tmp.path().join("plain");
        std::fs::create_dir_all(&no_git).unwrap();
        reg.register("github.com/u/plain", &no_git).unwrap();

        let invalid = reg.validate();
        assert_eq!(invalid.len(), 2);
        assert!(invalid
            .iter()
            .any(|e| e.remote == "github.com/u/gone" && e.reason == InvalidReason::PathNotFound));
        assert!(invalid
            .iter()
            .any(|e| e.remote == "github.com/u/plain" && e.reason == InvalidReason::NotAGitRepo));
        // Nothing was deleted.
        assert_eq!(reg.count(), 3);
    }
}
