//! The task dispatcher — a single control loop over the whole daemon.
//!
//! Per iteration, in order: reap supervised children, fetch queued tasks,
//! dispatch each in server order, publish the status snapshot, sleep. All
//! mutable state (the running-task arena, the completed ring, the pending
//! snapshot) lives on this one loop, so none of it needs locking.
//!
//! The loop body treats every failure as survivable: errors are logged and
//! the next iteration proceeds. Only a termination signal exits — at which
//! point every child is terminated and the pid/status files are removed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::{
    ApiClient, DaemonNotification, ExecutionStatus, ExecutionUpdate, NotificationKind, Task,
    TaskFilters,
};
use crate::certainty;
use crate::config::{DaemonConfig, Mode};
use crate::health::SelfHeal;
use crate::paths;
use crate::registry::ProjectRegistry;
use crate::status::{
    ActiveStatus, ActiveTask, CompletedTask, CompletionStatus, DaemonInfo, DaemonStatus, Stats,
    StatusWriter,
};
use crate::supervisor::{self, Outcome, RunningTask, SpawnSpec};
use crate::worktree::WorktreeManager;

/// Completed-task entries kept for the status file.
const COMPLETED_RING: usize = 10;

// ─── Execution mode ──────────────────────────────────────────────────────────

/// What the certainty score says to do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run the assistant right away.
    Immediate,
    /// Run the assistant, but start it in planning mode.
    Planning,
    /// Don't execute — send clarification questions back.
    Clarify,
}

impl ExecutionMode {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Self::Immediate
        } else if score >= 0.4 {
            Self::Planning
        } else {
            Self::Clarify
        }
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// A queued task we saw but did not dispatch this iteration (capacity).
struct PendingTask {
    display_number: u64,
    task_id: String,
    summary: String,
    queued_at: DateTime<Utc>,
}

pub struct Dispatcher {
    config: DaemonConfig,
    api: ApiClient,
    worktrees: WorktreeManager,
    self_heal: SelfHeal,
    status: StatusWriter,
    machine_id: String,
    machine_name: String,
    started_at: DateTime<Utc>,

    /// Arena of live tasks, keyed by display number. A task is present here
    /// iff a child process was spawned for it and its exit has not yet been
    /// observed.
    running: HashMap<u64, RunningTask>,
    completed_today: VecDeque<CompletedTask>,
    completed_today_count: usize,
    pending: Vec<PendingTask>,
}

impl Dispatcher {
    pub fn new(config: DaemonConfig) -> Self {
        let machine_id = crate::identity::machine_id(&paths::machine_id_file());
        let machine_name = crate::identity::machine_name();
        let suffix = crate::identity::machine_suffix(&machine_id);

        let api = ApiClient::new(&config.api_base_url, paths::credential_file());
        let worktrees = WorktreeManager::new(suffix);
        let self_heal = SelfHeal::new(&config.state_dir);
        let status = StatusWriter::new(paths::status_file());

        Self {
            config,
            api,
            worktrees,
            self_heal,
            status,
            machine_id,
            machine_name,
            started_at: Utc::now(),
            running: HashMap::new(),
            completed_today: VecDeque::with_capacity(COMPLETED_RING),
            completed_today_count: 0,
            pending: Vec::new(),
        }
    }

    /// Run the poll loop until a termination signal arrives.
    pub async fn run(mut self) -> Result<()> {
        self.self_heal.record_self();
        info!(
            version = DaemonConfig::version(),
            machine = %self.machine_id,
            routed = self.config.mode.is_routed(),
            poll_secs = self.config.poll_interval.as_secs(),
            "daemon started"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            // The loop body must survive anything the iteration throws.
            if let Err(e) = self.iteration().await {
                error!(err = %format!("{e:#}"), "iteration failed — continuing");
            }
            self.publish_status();

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn iteration(&mut self) -> Result<()> {
        self.reap_pass().await;

        let tasks = match self.fetch().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(err = %e, "fetch failed — will retry next poll");
                return Ok(());
            }
        };

        self.pending.clear();
        for task in tasks {
            self.try_execute(task).await;
        }
        Ok(())
    }

    // ─── Reaping ────────────────────────────────────────────────────────────

    /// Inspect every supervised child and apply transitions.
    async fn reap_pass(&mut self) {
        let numbers: Vec<u64> = self.running.keys().copied().collect();
        for n in numbers {
            let inspection = {
                let Some(task) = self.running.get_mut(&n) else {
                    continue;
                };
                task.inspect(
                    self.config.task_timeout,
                    self.config.idle_warn,
                    self.config.idle_phase,
                )
                .await
            };

            if inspection.newly_stuck {
                if let Some((remote_id, detail)) = self
                    .running
                    .get(&n)
                    .map(|t| (t.remote_id.clone(), t.detail.clone()))
                {
                    let note = DaemonNotification::new(
                        NotificationKind::NeedsInput,
                        format!("Task #{n} is waiting for input: {detail}"),
                    )
                    .for_task(&remote_id, n)
                    .priority("high");
                    self.api.notify(&note).await;
                }
                self.publish_status();
            }

            if inspection.newly_idle {
                self.publish_status();
            }

            if let Some(outcome) = inspection.outcome {
                if let Some(task) = self.running.remove(&n) {
                    self.finish_task(task, outcome).await;
                }
                self.publish_status();
            }
        }
    }

    /// Apply a terminal transition: report, notify, release the worktree,
    /// record in the completed ring. Exactly one terminal status report goes
    /// to the queue per reaped task (completions are reported by the
    /// assistant's session-end hook, not by us).
    async fn finish_task(&mut self, task: RunningTask, outcome: Outcome) {
        let n = task.display_number;
        let duration_secs = task.elapsed().as_secs();

        let (completion, pr_url) = match outcome {
            Outcome::Completed => {
                info!(display_number = n, duration_secs, "task completed");
                let pr_url = self
                    .worktrees
                    .create_review_request(n, &task.summary, &task.project_path)
                    .await;
                let mut message = format!("Task #{n} completed: {}", task.summary);
                if let Some(ref url) = pr_url {
                    message.push_str(&format!(" ({url})"));
                }
                let note = DaemonNotification::new(NotificationKind::TaskCompleted, message)
                    .for_task(&task.remote_id, n);
                self.api.notify(&note).await;
                (CompletionStatus::Completed, pr_url)
            }
            Outcome::Failed { code, stderr_tail } => {
                warn!(display_number = n, code, "task failed");
                let error = if stderr_tail.is_empty() {
                    format!("assistant exited with code {code}")
                } else {
                    format!("assistant exited with code {code}: {stderr_tail}")
                };
                self.report_failed(n, &error).await;
                let note = DaemonNotification::new(
                    NotificationKind::TaskFailed,
                    format!("Task #{n} failed: {}", task.summary),
                )
                .for_task(&task.remote_id, n)
                .priority("high");
                self.api.notify(&note).await;
                (CompletionStatus::Failed, None)
            }
            Outcome::TimedOut { elapsed_secs } => {
                warn!(display_number = n, elapsed_secs, "task timed out");
                let error = format!("task timed out after {elapsed_secs}s");
                self.report_failed(n, &error).await;
                let note = DaemonNotification::new(
                    NotificationKind::TaskFailed,
                    format!("Task #{n} timed out: {}", task.summary),
                )
                .for_task(&task.remote_id, n)
                .priority("high");
                self.api.notify(&note).await;
                (CompletionStatus::Timeout, None)
            }
        };

        // Worktree goes away; the branch stays for review.
        self.worktrees.remove(n, &task.project_path).await;

        if self.completed_today.len() == COMPLETED_RING {
            self.completed_today.pop_front();
        }
        self.completed_today.push_back(CompletedTask {
            display_number: n,
            summary: task.summary,
            completed_at: Utc::now(),
            duration_seconds: duration_secs,
            status: completion,
            pr_url,
        });
        self.completed_today_count += 1;
    }

    async fn report_failed(&self, display_number: u64, error: &str) {
        let update = ExecutionUpdate::failed(display_number, error);
        if let Err(e) = self.api.update_task_execution(&update).await {
            warn!(display_number, err = %e, "failed to report task failure");
        }
    }

    // ─── Fetching & dispatch ────────────────────────────────────────────────

    async fn fetch(&self) -> Result<Vec<Task>, crate::api::ApiError> {
        let git_remote = match &self.config.mode {
            Mode::Routed => None,
            Mode::SingleProject { git_remote, .. } => git_remote.clone(),
        };
        self.api.list_tasks(&TaskFilters::queued(git_remote)).await
    }

    /// Decide what to do with one fetched task.
    async fn try_execute(&mut self, task: Task) {
        let Some(n) = task.display_number else {
            warn!(task_id = %task.id, "task has no display number — skipping");
            return;
        };

        // The server excludes backlog items by default; assert anyway.
        if task.is_backlog {
            debug!(display_number = n, "backlog task — never dispatched");
            return;
        }
        if task.execution_status != ExecutionStatus::Queued {
            debug!(display_number = n, status = task.execution_status.as_str(), "not queued — skipping");
            return;
        }
        if self.running.contains_key(&n) {
            debug!(display_number = n, "already running");
            return;
        }
        if self.running.len() >= self.config.max_concurrent {
            debug!(display_number = n, "at concurrency limit — deferring to next poll");
            self.pending.push(PendingTask {
                display_number: n,
                task_id: task.id.clone(),
                summary: task.summary.clone(),
                queued_at: task.created_at.unwrap_or_else(Utc::now),
            });
            return;
        }

        // Route to a directory. An unregistered project is skipped, not
        // failed — registering it later makes the task eligible again.
        let project_path = match self.resolve_project(&task) {
            Some(path) => path,
            None => return,
        };

        // In routed mode the claim must succeed before any local side
        // effect. Losing is normal — another machine owns the task.
        if self.config.mode.is_routed() {
            match self.api.claim_task(n, &self.machine_id, &self.machine_name).await {
                Ok(outcome) if outcome.won() => {}
                Ok(_) => return,
                Err(e) => {
                    warn!(display_number = n, err = %e, "claim attempt failed");
                    return;
                }
            }
        }

        let analysis = certainty::analyze(
            &task.normalized_content,
            Some(&task.summary),
            task.original_transcript.as_deref(),
        );
        let mode = ExecutionMode::from_score(analysis.score);
        debug!(
            display_number = n,
            score = analysis.score,
            ?mode,
            "certainty analysis"
        );

        if mode == ExecutionMode::Clarify {
            let update = ExecutionUpdate::needs_clarification(
                n,
                analysis.score,
                &analysis.clarification_questions,
            );
            if let Err(e) = self.api.update_task_execution(&update).await {
                warn!(display_number = n, err = %e, "failed to request clarification");
            }
            let note = DaemonNotification::new(
                NotificationKind::NeedsClarification,
                format!("Task #{n} needs clarification: {}", task.summary),
            )
            .for_task(&task.id, n);
            self.api.notify(&note).await;
            self.publish_status();
            return;
        }

        let worktree_path = match self.worktrees.create(n, &project_path).await {
            Ok(path) => path,
            Err(e) => {
                let error = format!("worktree creation failed: {e:#}");
                warn!(display_number = n, error = %error, "dispatch failed");
                self.report_failed(n, &error).await;
                self.publish_status();
                return;
            }
        };

        let prompt = build_prompt(&task);
        let branch = self.worktrees.branch_name(n);
        let spec = SpawnSpec {
            display_number: n,
            remote_id: &task.id,
            summary: &task.summary,
            prompt: &prompt,
            project_path: &project_path,
            worktree_path: &worktree_path,
            branch: &branch,
            planning: mode == ExecutionMode::Planning,
        };

        match supervisor::spawn_assistant(&spec) {
            Ok(running) => {
                info!(
                    display_number = n,
                    branch = %branch,
                    planning = mode == ExecutionMode::Planning,
                    "assistant spawned"
                );
                self.running.insert(n, running);
            }
            Err(e) => {
                let error = format!("failed to spawn assistant: {e:#}");
                warn!(display_number = n, error = %error, "dispatch failed");
                self.report_failed(n, &error).await;
                self.worktrees.remove(n, &project_path).await;
            }
        }
        self.publish_status();
    }

    fn resolve_project(&self, task: &Task) -> Option<PathBuf> {
        match &self.config.mode {
            Mode::SingleProject {
                git_remote,
                project_path,
            } => {
                // The server filter already scopes the fetch, but assert
                // again: a task bound to some other project must never run
                // in this checkout.
                match (git_remote.as_deref(), task.git_remote.as_deref()) {
                    (Some(mine), Some(theirs)) if mine != theirs => {
                        debug!(task_remote = theirs, "task belongs to another project — skipping");
                        None
                    }
                    (None, Some(theirs)) => {
                        debug!(task_remote = theirs, "task is project-bound but this checkout has no remote");
                        None
                    }
                    _ => Some(project_path.clone()),
                }
            }
            Mode::Routed => {
                let remote = match task.git_remote.as_deref() {
                    Some(r) => r,
                    None => {
                        debug!(task_id = %task.id, "task has no git remote — cannot route");
                        return None;
                    }
                };
                // Re-opened per lookup so registrations made while the
                // daemon runs take effect without a restart.
                let mut registry = ProjectRegistry::open(&paths::registry_file());
                match registry.resolve(remote) {
                    Some(path) => Some(path),
                    None => {
                        debug!(remote, "project not registered — skipping task");
                        None
                    }
                }
            }
        }
    }

    // ─── Status ─────────────────────────────────────────────────────────────

    fn publish_status(&self) {
        let mut running: Vec<&RunningTask> = self.running.values().collect();
        running.sort_by_key(|t| t.started_at);

        let mut active_tasks: Vec<ActiveTask> = running
            .into_iter()
            .map(|t| ActiveTask {
                display_number: t.display_number,
                task_id: t.remote_id.clone(),
                summary: t.summary.clone(),
                status: ActiveStatus::Running,
                phase: Some(t.phase),
                detail: if t.detail.is_empty() {
                    None
                } else {
                    Some(t.detail.clone())
                },
                started_at: Some(t.started_at),
                elapsed_seconds: Some(t.elapsed().as_secs()),
                queued_at: None,
            })
            .collect();
        active_tasks.extend(self.pending.iter().map(|p| ActiveTask {
            display_number: p.display_number,
            task_id: p.task_id.clone(),
            summary: p.summary.clone(),
            status: ActiveStatus::Queued,
            phase: None,
            detail: None,
            started_at: None,
            elapsed_seconds: None,
            queued_at: Some(p.queued_at),
        }));

        let status = DaemonStatus {
            daemon: DaemonInfo {
                pid: std::process::id(),
                version: DaemonConfig::version().to_string(),
                started_at: self.started_at,
                machine_name: self.machine_name.clone(),
                machine_id: self.machine_id.clone(),
            },
            active_tasks,
            completed_today: self.completed_today.iter().cloned().collect(),
            stats: Stats {
                running: self.running.len(),
                max_concurrent: self.config.max_concurrent,
                completed_today: self.completed_today_count,
            },
            last_updated: Utc::now(),
        };
        self.status.write(&status);
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        info!(children = self.running.len(), "shutting down");
        for (_, mut task) in self.running.drain() {
            task.terminate().await;
        }
        self.status.remove();
        self.self_heal.clear_runtime_files();
        info!("daemon exited cleanly");
    }
}

/// Build the prompt handed to the assistant.
fn build_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    if !task.summary.is_empty() && task.summary != task.normalized_content {
        prompt.push_str(&task.summary);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&task.normalized_content);
    if let Some(ref transcript) = task.original_transcript {
        if !transcript.is_empty() {
            prompt.push_str("\n\nOriginal voice transcript (for context):\n> ");
            prompt.push_str(transcript);
        }
    }
    prompt
}

/// Resolves when the process receives SIGINT or (on Unix) SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(err = %e, "cannot listen for SIGTERM — ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_thresholds_are_inclusive_at_the_boundaries() {
        assert_eq!(ExecutionMode::from_score(1.0), ExecutionMode::Immediate);
        assert_eq!(ExecutionMode::from_score(0.7), ExecutionMode::Immediate);
        assert_eq!(ExecutionMode::from_score(0.69), ExecutionMode::Planning);
        assert_eq!(ExecutionMode::from_score(0.4), ExecutionMode::Planning);
        assert_eq!(ExecutionMode::from_score(0.39), ExecutionMode::Clarify);
        assert_eq!(ExecutionMode::from_score(0.0), ExecutionMode::Clarify);
    }

    #[test]
    fn prompt_includes_summary_and_transcript() {
        let task = Task {
            id: "t1".to_string(),
            display_number: Some(1),
            summary: "Fix login".to_string(),
            normalized_content: "Fix the login redirect bug".to_string(),
            original_transcript: Some("uh fix the login thing".to_string()),
            git_remote: None,
            is_backlog: false,
            created_at: None,
            execution_status: ExecutionStatus::Queued,
        };
        let prompt = build_prompt(&task);
        assert!(prompt.starts_with("Fix login\n\n"));
        assert!(prompt.contains("Fix the login redirect bug"));
        assert!(prompt.contains("uh fix the login thing"));
    }

    #[test]
    fn prompt_skips_duplicate_summary() {
        let task = Task {
            id: "t1".to_string(),
            display_number: Some(1),
            summary: "Same".to_string(),
            normalized_content: "Same".to_string(),
            original_transcript: None,
            git_remote: None,
            is_backlog: false,
            created_at: None,
            execution_status: ExecutionStatus::Queued,
        };
        assert_eq!(build_prompt(&task), "Same");
    }
}
