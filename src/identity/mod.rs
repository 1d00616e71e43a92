//! Stable machine identity for cross-machine task claiming.
//!
//! Generates `{hostname}-{8 random hex chars}` on first use, persists it to
//! `~/.config/push/machine_id`, and returns the same value on every
//! subsequent call. The id attributes claimed tasks to a machine and makes
//! branch names unique when two machines work the same queue.

use std::path::Path;

use tracing::warn;

/// Get or create the unique machine identifier.
///
/// Format: `{hostname}-{random_hex}`, e.g. `studio-mbp-a1b2c3d4`.
/// A persist failure is logged but never prevents returning an id for the
/// current run.
pub fn machine_id(id_file: &Path) -> String {
    if let Ok(stored) = std::fs::read_to_string(id_file) {
        let stored = stored.trim();
        if !stored.is_empty() {
            return stored.to_string();
        }
    }

    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let id = format!("{}-{}", machine_name(), suffix);

    if let Some(parent) = id_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(id_file, &id) {
        warn!(path = %id_file.display(), err = %e, "failed to persist machine id — using it for this run only");
    }

    id
}

/// Human-readable machine name: the current hostname, re-read each call.
pub fn machine_name() -> String {
    hostname().unwrap_or_else(|| "unknown-host".to_string())
}

/// The suffix used in branch and worktree names: the last 8 characters
/// after the final hyphen of the machine id, or the first 8 if there is
/// no hyphen.
pub fn machine_suffix(machine_id: &str) -> String {
    match machine_id.rsplit_once('-') {
        Some((_, tail)) => tail.chars().take(8).collect(),
        None => machine_id.chars().take(8).collect(),
    }
}

/// Delete the stored machine id. The next `machine_id` call generates a
/// fresh one. Used only by tests.
pub fn reset(id_file: &Path) {
    let _ = std::fs::remove_file(id_file);
}

// ─── Hostname ────────────────────────────────────────────────────────────────

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(windows)]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|s| !s.is_empty())
}

#[cfg(not(any(unix, windows)))]
fn hostname() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_persisted_and_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("machine_id");

        let first = machine_id(&file);
        let second = machine_id(&file);
        assert_eq!(first, second);
        assert!(file.exists());

        let suffix = machine_suffix(&first);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reset_forces_regeneration() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("machine_id");

        let first = machine_id(&file);
        reset(&file);
        let second = machine_id(&file);
        // Random suffix makes a collision a 1-in-4-billion event.
        assert_ne!(first, second);
    }

    #[test]
    fn suffix_without_hyphen_takes_prefix() {
        assert_eq!(machine_suffix("deadbeefcafe"), "deadbeef");
        assert_eq!(machine_suffix("host-a1b2c3d4"), "a1b2c3d4");
        assert_eq!(machine_suffix("my-host-a1b2c3d4"), "a1b2c3d4");
    }
}
