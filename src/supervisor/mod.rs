// SPDX-License-Identifier: MIT
//! Supervision of spawned coding-assistant processes.
//!
//! Each dispatched task runs `claude` as a detached child with its working
//! directory set to the task worktree. A reader task per stream forwards
//! output lines into a bounded channel; the dispatcher drains it at
//! iteration boundaries, so all bookkeeping (ring buffer, stuck detection,
//! idle tracking) happens on the single control loop.
//!
//! Policy knobs live in [`crate::config::DaemonConfig`]: a hard 1-hour
//! timeout kills the child; output silence first warns (5 min) and then
//! flips the phase to `idle` (10 min) without killing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines of recent stdout kept per task for the status file.
const RING_CAPACITY: usize = 20;
/// Buffered output lines before the reader task blocks.
const CHANNEL_CAPACITY: usize = 256;
/// Bytes of stderr reported with a failed task.
const STDERR_TAIL_BYTES: usize = 200;
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Tools the assistant may use without prompting. Everything else would
/// stall the session waiting for a user who is not there.
const ALLOWED_TOOLS: &str = "Edit,Write,Read,Glob,Grep,Bash";

/// Substrings (matched case-insensitively) that mean the assistant stopped
/// to wait for input it will never get.
const STUCK_PATTERNS: [&str; 10] = [
    "waiting for permission",
    "approve this action",
    "permission required",
    "plan ready for approval",
    "waiting for user",
    "enter plan mode",
    "press enter to continue",
    "y/n",
    "[y/n]",
    "confirm:",
];

// ─── Task state ──────────────────────────────────────────────────────────────

/// Where a supervised task currently is, as shown in the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyzing,
    Executing,
    Planning,
    Idle,
    Stuck,
}

#[derive(Debug)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Terminal result of an inspection.
#[derive(Debug)]
pub enum Outcome {
    /// Exit code 0. The assistant's session-end hook is expected to have
    /// reported the result already.
    Completed,
    Failed {
        code: i32,
        stderr_tail: String,
    },
    /// Hard timeout; the child has already been terminated.
    TimedOut {
        elapsed_secs: u64,
    },
}

/// What one inspection pass observed.
#[derive(Debug, Default)]
pub struct Inspection {
    pub outcome: Option<Outcome>,
    /// First stuck-pattern match for this task — send one needs-input
    /// notification.
    pub newly_stuck: bool,
    /// Output silence crossed the idle threshold this pass.
    pub newly_idle: bool,
}

impl Inspection {
    fn none() -> Self {
        Self::default()
    }
}

/// A dispatched task with a live child process. Owned exclusively by the
/// dispatcher; everything else refers to it by `display_number`.
pub struct RunningTask {
    pub display_number: u64,
    pub remote_id: String,
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub phase: Phase,
    pub detail: String,
    pub project_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,

    child: Child,
    output: mpsc::Receiver<OutputLine>,
    started: Instant,
    last_output: Instant,
    stdout_ring: VecDeque<String>,
    stderr_ring: VecDeque<String>,
    stuck_notified: bool,
    idle_warned: bool,
}

impl RunningTask {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn recent_output(&self) -> impl Iterator<Item = &str> {
        self.stdout_ring.iter().map(String::as_str)
    }

    /// Drain pending output, then check for exit, timeout, and idleness.
    ///
    /// Called once per poll cycle from the dispatcher. On timeout the child
    /// is terminated before `Outcome::TimedOut` is returned.
    pub async fn inspect(
        &mut self,
        task_timeout: Duration,
        idle_warn: Duration,
        idle_phase: Duration,
    ) -> Inspection {
        let mut inspection = Inspection::none();

        while let Ok(line) = self.output.try_recv() {
            self.ingest(line, &mut inspection);
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                // Exit closes the pipes, which ends the reader tasks; wait
                // briefly for them to forward the final lines so the stderr
                // tail is complete.
                loop {
                    match tokio::time::timeout(Duration::from_millis(200), self.output.recv()).await
                    {
                        Ok(Some(line)) => self.ingest(line, &mut inspection),
                        Ok(None) | Err(_) => break,
                    }
                }
                let code = status.code().unwrap_or(-1);
                inspection.outcome = Some(if code == 0 {
                    Outcome::Completed
                } else {
                    Outcome::Failed {
                        code,
                        stderr_tail: self.stderr_tail(),
                    }
                });
                return inspection;
            }
            Ok(None) => {}
            Err(e) => warn!(display_number = self.display_number, err = %e, "could not poll child"),
        }

        if self.started.elapsed() > task_timeout {
            let elapsed_secs = self.started.elapsed().as_secs();
            warn!(
                display_number = self.display_number,
                elapsed_secs, "task exceeded hard timeout — terminating child"
            );
            self.terminate().await;
            inspection.outcome = Some(Outcome::TimedOut { elapsed_secs });
            return inspection;
        }

        // Idleness only matters while the child is otherwise healthy;
        // a stuck task already has a more specific phase.
        if self.phase != Phase::Stuck {
            let silent = self.last_output.elapsed();
            if silent > idle_phase && self.phase != Phase::Idle {
                self.phase = Phase::Idle;
                self.detail = format!("no output for {}s", silent.as_secs());
                inspection.newly_idle = true;
            } else if silent > idle_warn && !self.idle_warned {
                warn!(
                    display_number = self.display_number,
                    silent_secs = silent.as_secs(),
                    "assistant has gone quiet"
                );
                self.idle_warned = true;
            }
        }

        inspection
    }

    fn ingest(&mut self, line: OutputLine, inspection: &mut Inspection) {
        match line {
            OutputLine::Stdout(line) => {
                self.last_output = Instant::now();
                if self.stdout_ring.len() == RING_CAPACITY {
                    self.stdout_ring.pop_front();
                }
                self.stdout_ring.push_back(line.clone());

                if !self.stuck_notified {
                    if let Some(pattern) = match_stuck_pattern(&line) {
                        debug!(
                            display_number = self.display_number,
                            pattern, "assistant is waiting for input"
                        );
                        self.phase = Phase::Stuck;
                        self.detail = line.trim().chars().take(120).collect();
                        self.stuck_notified = true;
                        inspection.newly_stuck = true;
                    }
                }
            }
            OutputLine::Stderr(line) => {
                if self.stderr_ring.len() == RING_CAPACITY {
                    self.stderr_ring.pop_front();
                }
                self.stderr_ring.push_back(line);
            }
        }
    }

    /// SIGTERM, a short grace period, then SIGKILL.
    pub async fn terminate(&mut self) {
        terminate_child(&mut self.child).await;
    }

    fn stderr_tail(&self) -> String {
        let joined = self
            .stderr_ring
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        tail_bytes(&joined, STDERR_TAIL_BYTES)
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

pub struct SpawnSpec<'a> {
    pub display_number: u64,
    pub remote_id: &'a str,
    pub summary: &'a str,
    pub prompt: &'a str,
    pub project_path: &'a Path,
    pub worktree_path: &'a Path,
    pub branch: &'a str,
    /// Start the assistant in planning mode (medium-certainty tasks).
    pub planning: bool,
}

/// Spawn the coding assistant for a task and wire up its output readers.
pub fn spawn_assistant(spec: &SpawnSpec<'_>) -> Result<RunningTask> {
    let mut cmd = Command::new("claude");
    cmd.arg("-p")
        .arg(spec.prompt)
        .args(["--allowedTools", ALLOWED_TOOLS])
        .args(["--output-format", "stream-json"]);
    if spec.planning {
        cmd.args(["--permission-mode", "plan"]);
    }

    let phase = if spec.planning {
        Phase::Planning
    } else {
        Phase::Executing
    };
    spawn_supervised(cmd, spec, phase)
}

/// Spawn an arbitrary command under supervision. Split out from
/// [`spawn_assistant`] so tests can supervise something cheaper than a real
/// assistant session.
pub(crate) fn spawn_supervised(
    mut cmd: Command,
    spec: &SpawnSpec<'_>,
    phase: Phase,
) -> Result<RunningTask> {
    cmd.current_dir(spec.worktree_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .context("failed to spawn `claude` — is it installed and on PATH?")?;

    let stdout = child.stdout.take().context("no stdout pipe")?;
    let stderr = child.stderr.take().context("no stderr pipe")?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let stdout_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdout_tx.send(OutputLine::Stdout(line)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine::Stderr(line)).await.is_err() {
                break;
            }
        }
    });

    let now = Instant::now();
    Ok(RunningTask {
        display_number: spec.display_number,
        remote_id: spec.remote_id.to_string(),
        summary: spec.summary.to_string(),
        started_at: Utc::now(),
        phase,
        detail: String::new(),
        project_path: spec.project_path.to_path_buf(),
        worktree_path: spec.worktree_path.to_path_buf(),
        branch: spec.branch.to_string(),
        child,
        output: rx,
        started: now,
        last_output: now,
        stdout_ring: VecDeque::with_capacity(RING_CAPACITY),
        stderr_ring: VecDeque::with_capacity(RING_CAPACITY),
        stuck_notified: false,
        idle_warned: false,
    })
}

// ─── Termination ─────────────────────────────────────────────────────────────

async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
            debug!(pid, "child ignored SIGTERM — killing");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(err = %e, "failed to kill child");
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// The stuck pattern matched by `line`, if any. Case-insensitive.
pub fn match_stuck_pattern(line: &str) -> Option<&'static str> {
    let lower = line.to_lowercase();
    STUCK_PATTERNS.iter().copied().find(|p| lower.contains(p))
}

/// Last `max` bytes of `s`, trimmed to a char boundary.
fn tail_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec<'a>(worktree: &'a Path) -> SpawnSpec<'a> {
        SpawnSpec {
            display_number: 7,
            remote_id: "task-7",
            summary: "test task",
            prompt: "do nothing",
            project_path: worktree,
            worktree_path: worktree,
            branch: "push-7-testsuffix",
            planning: false,
        }
    }

    #[test]
    fn stuck_patterns_match_case_insensitively() {
        assert_eq!(
            match_stuck_pattern("Waiting for permission to edit foo.txt"),
            Some("waiting for permission")
        );
        assert_eq!(match_stuck_pattern("Continue? [Y/n]"), Some("y/n"));
        assert_eq!(match_stuck_pattern("confirm: delete branch"), Some("confirm:"));
        assert_eq!(match_stuck_pattern("compiling 34 crates"), None);
    }

    #[test]
    fn tail_bytes_keeps_the_end() {
        assert_eq!(tail_bytes("short", 200), "short");
        let long = "x".repeat(500);
        let tail = tail_bytes(&long, 200);
        assert_eq!(tail.len(), 200);
    }

    #[tokio::test]
    async fn completed_child_yields_completed_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo world"]);
        let mut task = spawn_supervised(cmd, &test_spec(tmp.path()), Phase::Executing).unwrap();

        // Give the child a moment to run and the readers to drain. Exit can
        // be observed before the last lines arrive, so wait for both.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut completed = false;
        loop {
            let inspection = task
                .inspect(
                    Duration::from_secs(3600),
                    Duration::from_secs(300),
                    Duration::from_secs(600),
                )
                .await;
            match inspection.outcome {
                Some(Outcome::Completed) => completed = true,
                Some(other) => panic!("unexpected outcome: {other:?}"),
                None => {}
            }
            if completed && task.recent_output().any(|l| l == "hello") {
                break;
            }
            assert!(Instant::now() < deadline, "child never completed with output");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn failing_child_reports_code_and_stderr_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let mut task = spawn_supervised(cmd, &test_spec(tmp.path()), Phase::Executing).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let inspection = task
                .inspect(
                    Duration::from_secs(3600),
                    Duration::from_secs(300),
                    Duration::from_secs(600),
                )
                .await;
            match inspection.outcome {
                Some(Outcome::Failed { code, stderr_tail }) => {
                    assert_eq!(code, 3);
                    assert!(stderr_tail.contains("boom"));
                    break;
                }
                Some(other) => panic!("unexpected outcome: {other:?}"),
                None => {
                    assert!(Instant::now() < deadline, "child never exited");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn stuck_line_flips_phase_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'Waiting for permission to edit foo.txt'; sleep 30"]);
        let mut task = spawn_supervised(cmd, &test_spec(tmp.path()), Phase::Executing).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stuck_events = 0;
        while Instant::now() < deadline {
            let inspection = task
                .inspect(
                    Duration::from_secs(3600),
                    Duration::from_secs(300),
                    Duration::from_secs(600),
                )
                .await;
            assert!(inspection.outcome.is_none(), "child should still be running");
            if inspection.newly_stuck {
                stuck_events += 1;
            }
            if stuck_events > 0 && task.phase == Phase::Stuck {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stuck_events, 1, "needs-input should fire exactly once");
        assert_eq!(task.phase, Phase::Stuck);

        // The child is NOT killed by stuck detection.
        let inspection = task
            .inspect(
                Duration::from_secs(3600),
                Duration::from_secs(300),
                Duration::from_secs(600),
            )
            .await;
        assert!(inspection.outcome.is_none());

        task.terminate().await;
    }

    #[tokio::test]
    async fn timeout_terminates_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 60"]);
        let mut task = spawn_supervised(cmd, &test_spec(tmp.path()), Phase::Executing).unwrap();

        // Zero timeout: the very first inspection pass should kill it.
        let inspection = task
            .inspect(
                Duration::from_secs(0),
                Duration::from_secs(300),
                Duration::from_secs(600),
            )
            .await;
        match inspection.outcome {
            Some(Outcome::TimedOut { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
