//! Typed, retrying HTTP client for the cloud task queue.
//!
//! All endpoints authenticate with `Authorization: Bearer <PUSH_API_KEY>`.
//! The credential is re-read from disk on every call so a re-auth takes
//! effect mid-run. Transient failures (network weather, 429, 5xx) are
//! retried with exponential backoff; business rejections are not.

pub mod types;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::credentials::{self, CredentialError};
use crate::retry::{retry_with_backoff, RetryConfig};

pub use types::{
    ClaimOutcome, DaemonNotification, ExecutionStatus, ExecutionUpdate, NotificationKind, Task,
    TaskFilters, TodoStatusUpdate,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Error taxonomy ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP 401 — the API key was rejected. Configuration, not weather.
    #[error("unauthorized — the queue rejected the API key (reconnect to refresh it)")]
    Unauthorized,

    /// HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, timeout, 429, or 5xx. Worth retrying.
    #[error("transient queue failure: {0}")]
    Transient(String),

    /// Any other 4xx — the server understood us and said no.
    #[error("queue rejected request (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl ApiError {
    /// Case analysis replacing the old "match error text against a pattern
    /// list" retry heuristic.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            404 => Self::NotFound(body),
            429 => Self::Transient(format!("HTTP 429: {body}")),
            s if s >= 500 => Self::Transient(format!("HTTP {s}: {body}")),
            s => Self::Server {
                status: s,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        // Connect failures, resets, and timeouts are all transient; reqwest
        // has already given up on the request by the time we see them.
        Self::Transient(e.to_string())
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential_file: PathBuf,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base_url: &str, credential_file: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential_file,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry schedule (tests).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn api_key(&self) -> Result<String, ApiError> {
        Ok(credentials::api_key(&self.credential_file)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `GET /synced-todos` — list tasks matching the filters, in server order.
    pub async fn list_tasks(&self, filters: &TaskFilters) -> Result<Vec<Task>, ApiError> {
        let key = self.api_key()?;
        let query = filters.to_query();

        let resp: types::TaskListResponse =
            retry_with_backoff(&self.retry, ApiError::is_transient, || async {
                let resp = self
                    .http
                    .get(self.url("synced-todos"))
                    .bearer_auth(&key)
                    .query(&query)
                    .send()
                    .await?;
                Self::parse_json(resp).await
            })
            .await?;

        debug!(count = resp.todos.len(), "fetched tasks");
        Ok(resp.todos)
    }

    /// `PATCH /update-task-execution` — report a state transition.
    pub async fn update_task_execution(
        &self,
        update: &ExecutionUpdate,
    ) -> Result<types::UpdateResponse, ApiError> {
        let key = self.api_key()?;

        retry_with_backoff(&self.retry, ApiError::is_transient, || async {
            let resp = self
                .http
                .patch(self.url("update-task-execution"))
                .bearer_auth(&key)
                .json(update)
                .send()
                .await?;
            Self::parse_json(resp).await
        })
        .await
    }

    /// Atomic `queued → running` claim. The server updates only if it still
    /// observes the task as `queued`; the outcome says who owns it now.
    pub async fn claim_task(
        &self,
        display_number: u64,
        machine_id: &str,
        machine_name: &str,
    ) -> Result<ClaimOutcome, ApiError> {
        let update = ExecutionUpdate::claim(display_number, machine_id, machine_name);
        let resp = self.update_task_execution(&update).await?;
        let outcome = ClaimOutcome::from(resp);
        match &outcome {
            ClaimOutcome::Won => info!(display_number, "claimed task"),
            ClaimOutcome::LostTo(machine) => {
                debug!(display_number, winner = %machine, "claim lost")
            }
            ClaimOutcome::Unknown => debug!(display_number, "claim not accepted"),
        }
        Ok(outcome)
    }

    /// `PATCH /todo-status` — flip the user-visible completion checkbox.
    pub async fn set_todo_status(&self, update: &TodoStatusUpdate) -> Result<(), ApiError> {
        let key = self.api_key()?;

        retry_with_backoff(&self.retry, ApiError::is_transient, || async {
            let resp = self
                .http
                .patch(self.url("todo-status"))
                .bearer_auth(&key)
                .json(update)
                .send()
                .await?;
            Self::check_status(resp).await
        })
        .await
    }

    /// `POST /daemon-notification` — best-effort; failures are logged and
    /// never propagate.
    pub async fn notify(&self, notification: &DaemonNotification) {
        let key = match self.api_key() {
            Ok(k) => k,
            Err(_) => return,
        };

        let result = self
            .http
            .post(self.url("daemon-notification"))
            .bearer_auth(&key)
            .json(notification)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => info!(status = %resp.status(), "notification not delivered"),
            Err(e) => info!(err = %e, "notification not delivered"),
        }
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, truncate(&body, 300)));
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            warn!(err = %e, "queue response did not match expected shape");
            ApiError::Server {
                status: status.as_u16(),
                message: format!("unparseable response: {e}"),
            }
        })
    }

    async fn check_status(resp: reqwest::Response) -> Result<(), ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, truncate(&body, 300)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        let unauthorized = ApiError::from_status(reqwest::StatusCode::UNAUTHORIZED, String::new());
        assert!(matches!(unauthorized, ApiError::Unauthorized));
        assert!(!unauthorized.is_transient());

        let not_found = ApiError::from_status(reqwest::StatusCode::NOT_FOUND, "gone".into());
        assert!(matches!(not_found, ApiError::NotFound(_)));

        let throttled = ApiError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(throttled.is_transient());

        let bad_gateway = ApiError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(bad_gateway.is_transient());

        let bad_request = ApiError::from_status(reqwest::StatusCode::BAD_REQUEST, "nope".into());
        assert!(matches!(bad_request, ApiError::Server { status: 400, .. }));
        assert!(!bad_request.is_transient());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 300), "short");
        let long = "é".repeat(400);
        let cut = truncate(&long, 300);
        assert!(cut.len() <= 304); // 300 bytes + ellipsis
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = ApiClient::new("https://api.example.com/v1/", PathBuf::from("/dev/null"));
        assert_eq!(client.url("/synced-todos"), "https://api.example.com/v1/synced-todos");
    }
}
