//! Wire types for the cloud task queue.
//!
//! The queue speaks camelCase JSON; everything here is renamed accordingly.
//! Responses from older server builds may omit newer fields, so defaults are
//! liberal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Tasks ───────────────────────────────────────────────────────────────────

/// Server-authoritative task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Queued,
    Running,
    NeedsClarification,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::NeedsClarification => "needs_clarification",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A work item fetched from `GET /synced-todos`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque stable identifier from the cloud service.
    pub id: String,
    /// Unique positive integer per user, human-facing. Tasks without one are
    /// never dispatched.
    #[serde(default)]
    pub display_number: Option<u64>,
    #[serde(default)]
    pub summary: String,
    /// Actionable instruction text (may originate from a decrypted voice
    /// transcript).
    #[serde(default)]
    pub normalized_content: String,
    #[serde(default)]
    pub original_transcript: Option<String>,
    /// Normalized remote key (`host/owner/repo`) used for routing, if the
    /// task is bound to a project.
    #[serde(default)]
    pub git_remote: Option<String>,
    /// Backlog items are excluded server-side by default; asserted again
    /// client-side.
    #[serde(default)]
    pub is_backlog: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_status: ExecutionStatus,
}

#[derive(Debug, Deserialize)]
pub struct TaskListResponse {
    #[serde(default)]
    pub todos: Vec<Task>,
}

/// Query filters for `GET /synced-todos`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub execution_status: Option<ExecutionStatus>,
    pub git_remote: Option<String>,
    pub display_number: Option<u64>,
    pub later_only: bool,
    pub include_later: bool,
}

impl TaskFilters {
    /// Fetch queued tasks, optionally scoped to one project.
    pub fn queued(git_remote: Option<String>) -> Self {
        Self {
            execution_status: Some(ExecutionStatus::Queued),
            git_remote,
            ..Self::default()
        }
    }

    pub(crate) fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if let Some(status) = self.execution_status {
            q.push(("execution_status", status.as_str().to_string()));
        }
        if let Some(ref remote) = self.git_remote {
            q.push(("git_remote", remote.clone()));
        }
        if let Some(n) = self.display_number {
            q.push(("display_number", n.to_string()));
        }
        if self.later_only {
            q.push(("later_only", "true".to_string()));
        }
        if self.include_later {
            q.push(("include_later", "true".to_string()));
        }
        q
    }
}

// ─── Execution updates & claiming ────────────────────────────────────────────

/// Body of `PATCH /update-task-execution`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUpdate {
    pub display_number: u64,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certainty_score: Option<f64>,
    /// JSON-serialized list of clarification questions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_questions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// When true the server updates only if the task is still `queued`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomic: Option<bool>,
}

impl ExecutionUpdate {
    fn new(display_number: u64, status: ExecutionStatus) -> Self {
        Self {
            display_number,
            status,
            summary: None,
            error: None,
            certainty_score: None,
            clarification_questions: None,
            machine_id: None,
            machine_name: None,
            atomic: None,
        }
    }

    /// Atomic `queued → running` claim attempt with machine attribution.
    pub fn claim(display_number: u64, machine_id: &str, machine_name: &str) -> Self {
        Self {
            machine_id: Some(machine_id.to_string()),
            machine_name: Some(machine_name.to_string()),
            atomic: Some(true),
            ..Self::new(display_number, ExecutionStatus::Running)
        }
    }

    pub fn failed(display_number: u64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(display_number, ExecutionStatus::Failed)
        }
    }

    pub fn needs_clarification(
        display_number: u64,
        certainty_score: f64,
        questions: &[String],
    ) -> Self {
        Self {
            certainty_score: Some(certainty_score),
            clarification_questions: serde_json::to_string(questions).ok(),
            ..Self::new(display_number, ExecutionStatus::NeedsClarification)
        }
    }
}

/// Response of `PATCH /update-task-execution`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub claimed: Option<bool>,
    #[serde(default)]
    pub claimed_by: Option<String>,
}

/// The two response shapes of an atomic claim, collapsed into one local type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This machine owns the task.
    Won,
    /// Another machine got there first.
    LostTo(String),
    /// The server did not accept the update at all.
    Unknown,
}

impl ClaimOutcome {
    pub fn won(&self) -> bool {
        matches!(self, Self::Won)
    }
}

impl From<UpdateResponse> for ClaimOutcome {
    fn from(resp: UpdateResponse) -> Self {
        match (resp.success, resp.claimed) {
            (true, Some(true)) => Self::Won,
            // Older server builds omit `claimed`; success alone means ours.
            (true, None) => Self::Won,
            (_, Some(false)) => {
                Self::LostTo(resp.claimed_by.unwrap_or_else(|| "another machine".to_string()))
            }
            (false, _) => Self::Unknown,
        }
    }
}

// ─── Todo completion ─────────────────────────────────────────────────────────

/// Body of `PATCH /todo-status` — flips the user-visible checkbox.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoStatusUpdate {
    pub todo_id: String,
    pub is_completed: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_comment: Option<String>,
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskCompleted,
    TaskFailed,
    NeedsInput,
    NeedsClarification,
}

/// Body of `POST /daemon-notification`. Fire-and-forget.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl DaemonNotification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            task_id: None,
            display_number: None,
            priority: None,
        }
    }

    pub fn for_task(mut self, task_id: &str, display_number: u64) -> Self {
        self.task_id = Some(task_id.to_string());
        self.display_number = Some(display_number);
        self
    }

    pub fn priority(mut self, priority: &str) -> Self {
        self.priority = Some(priority.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_deserializes_from_queue_shape() {
        let json = r#"{
            "id": "uuid-1",
            "displayNumber": 427,
            "summary": "Add tests",
            "normalizedContent": "Add tests for X",
            "gitRemote": "github.com/o/r",
            "isBacklog": false,
            "createdAt": "2026-01-28T10:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.display_number, Some(427));
        assert_eq!(task.git_remote.as_deref(), Some("github.com/o/r"));
        assert_eq!(task.execution_status, ExecutionStatus::Queued);
    }

    #[test]
    fn missing_display_number_is_none() {
        let task: Task = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        assert_eq!(task.display_number, None);
        assert!(!task.is_backlog);
    }

    #[test]
    fn claim_outcome_collapses_both_shapes() {
        let won: UpdateResponse =
            serde_json::from_str(r#"{"success": true, "claimed": true}"#).unwrap();
        assert_eq!(ClaimOutcome::from(won), ClaimOutcome::Won);

        let lost: UpdateResponse =
            serde_json::from_str(r#"{"success": true, "claimed": false, "claimedBy": "other-mac"}"#)
                .unwrap();
        assert_eq!(ClaimOutcome::from(lost), ClaimOutcome::LostTo("other-mac".to_string()));

        // Backward-compat: servers predating atomic claims omit `claimed`.
        let legacy: UpdateResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert_eq!(ClaimOutcome::from(legacy), ClaimOutcome::Won);

        let rejected: UpdateResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert_eq!(ClaimOutcome::from(rejected), ClaimOutcome::Unknown);
    }

    #[test]
    fn claim_body_carries_machine_identity() {
        let update = ExecutionUpdate::claim(88, "host-a1b2c3d4", "host");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["displayNumber"], 88);
        assert_eq!(json["status"], "running");
        assert_eq!(json["atomic"], true);
        assert_eq!(json["machineId"], "host-a1b2c3d4");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn clarification_questions_are_serialized_as_json_string() {
        let update = ExecutionUpdate::needs_clarification(
            9,
            0.2,
            &["Which file?".to_string(), "Which branch?".to_string()],
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["certaintyScore"], 0.2);
        let questions = json["clarificationQuestions"].as_str().unwrap();
        let parsed: Vec<String> = serde_json::from_str(questions).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn filters_build_expected_query() {
        let filters = TaskFilters::queued(Some("github.com/o/r".to_string()));
        let q = filters.to_query();
        assert!(q.contains(&("execution_status", "queued".to_string())));
        assert!(q.contains(&("git_remote", "github.com/o/r".to_string())));
        assert_eq!(q.len(), 2);
    }
}
