// SPDX-License-Identifier: MIT
//! Atomic status-file snapshots for external observers.
//!
//! The daemon serializes its full in-memory view to
//! `~/.push/daemon_status.json` after every state transition. Writes go to
//! a temp sibling first and are renamed over the real file, so a concurrent
//! reader (the live monitor) always sees a complete snapshot — possibly a
//! stale one, never a torn one. Observers must order snapshots by
//! `last_updated` only, and must tolerate the file briefly not existing
//! during the rename.
//!
//! Write failures are swallowed: monitoring must never take the daemon down.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::supervisor::Phase;

// ─── Schema ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub machine_name: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveStatus {
    Running,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTask {
    pub display_number: u64,
    pub task_id: String,
    pub summary: String,
    pub status: ActiveStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub display_number: u64,
    pub summary: String,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub status: CompletionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub running: usize,
    pub max_concurrent: usize,
    pub completed_today: usize,
}

/// The full on-disk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub daemon: DaemonInfo,
    /// Running tasks first, then queued.
    pub active_tasks: Vec<ActiveTask>,
    /// Most recent completions, newest last, capped at 10.
    pub completed_today: Vec<CompletedTask>,
    pub stats: Stats,
    pub last_updated: DateTime<Utc>,
}

// ─── Writer ──────────────────────────────────────────────────────────────────

pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write a snapshot atomically (temp sibling + rename). Errors are
    /// logged at debug and otherwise ignored.
    pub fn write(&self, status: &DaemonStatus) {
        if let Err(e) = self.try_write(status) {
            debug!(path = %self.path.display(), err = %e, "status write failed");
        }
    }

    fn try_write(&self, status: &DaemonStatus) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(status)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove the status file (clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the latest snapshot, if the daemon has written one.
pub fn read_status(path: &Path) -> Option<DaemonStatus> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Human-readable duration: `45s`, `3m 2s`, `2h 15m`.
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let m = secs / 60;
        let s = secs % 60;
        if s == 0 {
            format!("{m}m")
        } else {
            format!("{m}m {s}s")
        }
    } else {
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        if m == 0 {
            format!("{h}h")
        } else {
            format!("{h}h {m}m")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DaemonStatus {
        DaemonStatus {
            daemon: DaemonInfo {
                pid: 4242,
                version: "2.1.0".to_string(),
                started_at: Utc::now(),
                machine_name: "test-host".to_string(),
                machine_id: "test-host-a1b2c3d4".to_string(),
            },
            active_tasks: vec![ActiveTask {
                display_number: 427,
                task_id: "uuid-427".to_string(),
                summary: "Add tests".to_string(),
                status: ActiveStatus::Running,
                phase: Some(Phase::Executing),
                detail: None,
                started_at: Some(Utc::now()),
                elapsed_seconds: Some(12),
                queued_at: None,
            }],
            completed_today: vec![],
            stats: Stats {
                running: 1,
                max_concurrent: 5,
                completed_today: 0,
            },
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon_status.json");
        let writer = StatusWriter::new(path.clone());

        writer.write(&sample());
        let loaded = read_status(&path).expect("snapshot readable");
        assert_eq!(loaded.active_tasks.len(), 1);
        assert_eq!(loaded.active_tasks[0].display_number, 427);
        assert_eq!(loaded.stats.max_concurrent, 5);
    }

    #[test]
    fn rewrites_leave_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon_status.json");
        let writer = StatusWriter::new(path.clone());

        writer.write(&sample());
        writer.write(&sample());
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let mut status = sample();
        status.active_tasks[0].phase = None;
        status.active_tasks[0].elapsed_seconds = None;

        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("\"phase\""));
        assert!(!json.contains("elapsed_seconds"));
        assert!(json.contains("\"display_number\": 427") || json.contains("\"display_number\":427"));
    }

    #[test]
    fn write_failure_is_swallowed() {
        // Point at an unwritable location; write must not panic.
        let writer = StatusWriter::new(PathBuf::from("/proc/definitely/not/writable/status.json"));
        writer.write(&sample());
    }

    #[test]
    fn durations_format_like_the_monitor() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(60), "1m");
        assert_eq!(format_duration(182), "3m 2s");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(8100), "2h 15m");
    }

    #[test]
    fn missing_file_reads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_status(&tmp.path().join("nope.json")).is_none());
    }
}
