//! Well-known file locations.
//!
//! Two directories matter:
//!   `~/.config/push/`  — durable configuration (credential file, machine id,
//!                        project registry, optional daemon tuning)
//!   `~/.push/`         — runtime state (pid, version, status snapshot, log)

use std::path::PathBuf;

/// Durable configuration directory (`~/.config/push`).
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("push")
}

/// Runtime state directory (`~/.push`).
pub fn state_dir() -> PathBuf {
    home_dir().join(".push")
}

/// Credential file: `export PUSH_API_KEY="..."` lines, mode 0600.
pub fn credential_file() -> PathBuf {
    config_dir().join("config")
}

/// Raw machine-id string, written once.
pub fn machine_id_file() -> PathBuf {
    config_dir().join("machine_id")
}

/// Project registry (`projects.json`).
pub fn registry_file() -> PathBuf {
    config_dir().join("projects.json")
}

/// Optional daemon tuning overrides.
pub fn daemon_toml() -> PathBuf {
    config_dir().join("daemon.toml")
}

pub fn pid_file() -> PathBuf {
    state_dir().join("daemon.pid")
}

pub fn version_file() -> PathBuf {
    state_dir().join("daemon.version")
}

pub fn status_file() -> PathBuf {
    state_dir().join("daemon_status.json")
}

pub fn log_file() -> PathBuf {
    state_dir().join("daemon.log")
}

/// The user's home directory.
///
/// `HOME` on Unix, `USERPROFILE` on Windows. Falls back to the current
/// directory so the daemon can still limp along in stripped-down
/// environments (CI containers without a passwd entry).
pub fn home_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                return PathBuf::from(home);
            }
        }
    }
    #[cfg(windows)]
    {
        if let Ok(profile) = std::env::var("USERPROFILE") {
            if !profile.is_empty() {
                return PathBuf::from(profile);
            }
        }
    }
    PathBuf::from(".")
}
