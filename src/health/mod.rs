// SPDX-License-Identifier: MIT
//! Self-heal supervision of the daemon process.
//!
//! Every user-facing subcommand calls [`SelfHeal::ensure_running`] so the
//! daemon comes up (or comes back up, or upgrades in place) without anyone
//! managing it by hand:
//!
//!   - not running            → start it
//!   - running, wrong version → stop it, start the current binary
//!   - running, current       → do nothing
//!
//! Liveness is a pid file plus a signal-0 probe. The version handshake is a
//! plain string comparison between `~/.push/daemon.version` (written at
//! start) and this binary's `CARGO_PKG_VERSION` — a downgrade restarts too.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Daemon alive and current — nothing to do.
    AlreadyRunning { pid: u32 },
    Started { pid: u32 },
    /// An outdated daemon was stopped and the current binary started.
    Restarted { pid: u32 },
    /// The daemon binary could not be located; nothing was started.
    NotInstalled,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub version: Option<String>,
    pub expected_version: String,
    pub outdated: bool,
    pub log_file: PathBuf,
}

pub struct SelfHeal {
    pid_file: PathBuf,
    version_file: PathBuf,
    log_file: PathBuf,
}

impl SelfHeal {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            pid_file: state_dir.join("daemon.pid"),
            version_file: state_dir.join("daemon.version"),
            log_file: state_dir.join("daemon.log"),
        }
    }

    /// The daemon's pid, if its process is alive.
    pub fn is_running(&self) -> Option<u32> {
        let pid: u32 = std::fs::read_to_string(&self.pid_file)
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    pub fn recorded_version(&self) -> Option<String> {
        std::fs::read_to_string(&self.version_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Start the daemon detached in a new process group.
    ///
    /// Routed daemons run from the home directory (the registry routes task
    /// → project); single-project daemons stay in the caller's directory.
    pub fn start(&self, expected_version: &str, routed: bool) -> Result<u32> {
        let exe = std::env::current_exe().context("cannot determine pushd executable path")?;

        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent).context("create state dir")?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .context("open daemon log")?;
        let log_err = log.try_clone().context("clone log handle")?;

        let cwd = if routed {
            paths::home_dir()
        } else {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        };

        let mut cmd = std::process::Command::new(exe);
        cmd.arg("serve")
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        // The daemon must not re-derive its mode from whatever the registry
        // looks like by the time it boots — pin it.
        cmd.arg(if routed { "--routed" } else { "--single-project" });
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let child = cmd.spawn().context("failed to spawn daemon")?;
        let pid = child.id();

        std::fs::write(&self.pid_file, pid.to_string()).context("write pid file")?;
        if let Err(e) = std::fs::write(&self.version_file, expected_version) {
            warn!(err = %e, "failed to record daemon version");
        }

        info!(pid, "daemon started");
        Ok(pid)
    }

    /// Terminate the recorded daemon. Returns `true` if a signal was sent.
    /// The pid file is removed either way — a dead daemon leaves one behind.
    pub fn stop(&self) -> Result<bool> {
        let Some(pid) = self.is_running() else {
            let _ = std::fs::remove_file(&self.pid_file);
            return Ok(false);
        };
        send_terminate(pid);
        let _ = std::fs::remove_file(&self.pid_file);
        info!(pid, "daemon stopped");
        Ok(true)
    }

    /// Make sure a daemon of the expected version is running.
    pub fn ensure_running(&self, expected_version: &str, routed: bool) -> Result<EnsureOutcome> {
        if std::env::current_exe().is_err() {
            // Nothing we could exec — behave like "plugin not installed yet".
            return Ok(EnsureOutcome::NotInstalled);
        }

        if let Some(pid) = self.is_running() {
            let recorded = self.recorded_version();
            if recorded.as_deref() == Some(expected_version) {
                return Ok(EnsureOutcome::AlreadyRunning { pid });
            }
            info!(
                running = recorded.as_deref().unwrap_or("unknown"),
                expected = expected_version,
                "daemon version mismatch — restarting"
            );
            self.stop()?;
            let pid = self.start(expected_version, routed)?;
            return Ok(EnsureOutcome::Restarted { pid });
        }

        let pid = self.start(expected_version, routed)?;
        Ok(EnsureOutcome::Started { pid })
    }

    pub fn report(&self, expected_version: &str) -> HealthReport {
        let pid = self.is_running();
        let version = self.recorded_version();
        let outdated = pid.is_some()
            && version.as_deref().map(|v| v != expected_version).unwrap_or(true);
        let uptime_secs = pid.and_then(|_| {
            let mtime = std::fs::metadata(&self.pid_file).ok()?.modified().ok()?;
            mtime.elapsed().ok().map(|d| d.as_secs())
        });
        HealthReport {
            running: pid.is_some(),
            pid,
            uptime_secs,
            version,
            expected_version: expected_version.to_string(),
            outdated,
            log_file: self.log_file.clone(),
        }
    }

    /// Called by the serving daemon itself so a foreground `pushd serve`
    /// is visible to `is_running` and survives the version handshake.
    pub fn record_self(&self) {
        if let Some(parent) = self.pid_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.pid_file, std::process::id().to_string()) {
            warn!(err = %e, "failed to write pid file");
        }
        if let Err(e) = std::fs::write(&self.version_file, crate::config::DaemonConfig::version()) {
            warn!(err = %e, "failed to write version file");
        }
    }

    /// Clean-shutdown bookkeeping: drop the pid and version files.
    pub fn clear_runtime_files(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
        let _ = std::fs::remove_file(&self.version_file);
    }
}

// ─── Process probes ──────────────────────────────────────────────────────────

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // POSIX: kill(pid, 0) succeeds if the process exists and is signalable.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe — trust the pid file.
    true
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}
