use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::paths;
use crate::remote;

const DEFAULT_API_BASE_URL: &str = "https://api.pushtodo.app/functions/v1";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT: usize = 5;
const TASK_TIMEOUT_SECS: u64 = 3600;
const IDLE_WARN_SECS: u64 = 300;
const IDLE_PHASE_SECS: u64 = 600;

// ─── Mode ────────────────────────────────────────────────────────────────────

/// How tasks are routed to directories. Decided once at startup — behavior
/// branches on this value, never on the presence of optional files at call
/// sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Service every registered project; resolve task → directory through
    /// the project registry and claim tasks atomically.
    Routed,
    /// Service only the project in the daemon's working directory; no
    /// registry lookups, no atomic claim.
    SingleProject {
        /// Normalized `origin` remote of the working directory, used as the
        /// server-side fetch filter.
        git_remote: Option<String>,
        project_path: PathBuf,
    },
}

impl Mode {
    pub fn is_routed(&self) -> bool {
        matches!(self, Mode::Routed)
    }
}

// ─── TOML tuning file ────────────────────────────────────────────────────────

/// `~/.config/push/daemon.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Seconds between queue polls (default: 30).
    poll_interval_secs: Option<u64>,
    /// Maximum concurrently supervised assistant processes (default: 5).
    max_concurrent: Option<usize>,
    /// Override the queue API base URL.
    api_base_url: Option<String>,
    /// Log level filter string, e.g. "debug", "info,pushd=trace" (default: "info").
    log: Option<String>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse daemon.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub mode: Mode,
    pub api_base_url: String,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    /// Hard per-task ceiling; the child is killed past this.
    pub task_timeout: Duration,
    /// Output silence that triggers a log warning.
    pub idle_warn: Duration,
    /// Output silence that flips the task phase to `idle`.
    pub idle_phase: Duration,
    pub log: String,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl DaemonConfig {
    /// Build config from CLI/env args + the optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML at `~/.config/push/daemon.toml`
    ///   3. Built-in defaults
    pub fn new(
        poll_interval_secs: Option<u64>,
        max_concurrent: Option<usize>,
        log: Option<String>,
        routed: bool,
        single_project: bool,
    ) -> Self {
        let config_dir = paths::config_dir();
        let state_dir = paths::state_dir();
        let toml = load_toml(&paths::daemon_toml()).unwrap_or_default();

        let api_base_url = std::env::var("PUSH_API_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.api_base_url)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let poll_interval = Duration::from_secs(
            poll_interval_secs
                .or(toml.poll_interval_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );
        let max_concurrent = max_concurrent
            .or(toml.max_concurrent)
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let mode = Self::pick_mode(routed, single_project, &paths::registry_file());

        Self {
            mode,
            api_base_url,
            poll_interval,
            max_concurrent,
            task_timeout: Duration::from_secs(TASK_TIMEOUT_SECS),
            idle_warn: Duration::from_secs(IDLE_WARN_SECS),
            idle_phase: Duration::from_secs(IDLE_PHASE_SECS),
            log,
            config_dir,
            state_dir,
        }
    }

    /// Routed when `--routed` is passed or a project registry exists;
    /// otherwise single-project, pinned to the working directory and its
    /// `origin` remote (which becomes the fetch filter). `--single-project`
    /// forces the latter even when a registry is present.
    fn pick_mode(routed: bool, single_project: bool, registry_file: &Path) -> Mode {
        if !single_project && (routed || registry_file.exists()) {
            return Mode::Routed;
        }
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Mode::SingleProject {
            git_remote: remote::repo_remote(&cwd),
            project_path: cwd,
        }
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
