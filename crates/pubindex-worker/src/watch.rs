//! Ingest task tracking
//!
//! Polls the search index for the state of submitted tasks until each one
//! reaches a terminal state or the deadline passes.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pubindex_common::types::{Secret, TaskId, TaskState};

use crate::config::SearchConfig;
use crate::stages::submit::task_url;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<String>,
}

/// Final word on one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub task_id: TaskId,
    /// Last state seen; `None` if the index never answered
    pub state: Option<TaskState>,
    pub message: Option<String>,
}

impl WatchReport {
    pub fn is_finished(&self) -> bool {
        self.state.is_some_and(|s| s.is_terminal())
    }
}

pub struct TaskWatcher {
    client: Client,
    base_url: String,
    access_token: Option<Secret>,
    poll_interval: Duration,
    deadline: Duration,
}

impl TaskWatcher {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<Secret>,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(crate::config::DEFAULT_HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build search HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            access_token,
            poll_interval,
            deadline,
        })
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.access_token.clone(),
            Duration::from_secs(config.poll_interval_secs.max(1)),
            Duration::from_secs(config.watch_timeout_secs),
        )
    }

    /// Current status of one task
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        let url = task_url(&self.base_url, task_id.as_str());
        let mut request = self.client.get(&url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Task status request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("search index responded with HTTP {} for task {}", status.as_u16(), task_id);
        }

        response
            .json()
            .await
            .with_context(|| format!("Invalid task status for {}", task_id))
    }

    /// Poll every task until all are finished, the deadline passes or
    /// `cancel` fires. Reports come back in input order.
    pub async fn watch(&self, task_ids: &[TaskId], cancel: &CancellationToken) -> Vec<WatchReport> {
        let mut reports: Vec<WatchReport> = task_ids
            .iter()
            .map(|id| WatchReport {
                task_id: id.clone(),
                state: None,
                message: None,
            })
            .collect();

        let started = Instant::now();
        loop {
            for report in reports.iter_mut().filter(|r| !r.is_finished()) {
                match self.status(&report.task_id).await {
                    Ok(status) => {
                        debug!(task_id = %report.task_id, state = %status.state, "Task polled");
                        if status.state.is_terminal() {
                            info!(task_id = %report.task_id, state = %status.state, "Task finished");
                        }
                        report.state = Some(status.state);
                        report.message = status.message;
                    },
                    Err(e) => {
                        let cause = format!("{:#}", e);
                        warn!(task_id = %report.task_id, cause = %cause, "Task status unavailable")
                    },
                }
            }

            if reports.iter().all(WatchReport::is_finished) {
                break;
            }
            if started.elapsed() >= self.deadline {
                warn!(
                    pending = reports.iter().filter(|r| !r.is_finished()).count(),
                    "Watch deadline reached"
                );
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {},
            }
        }

        reports
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn watcher(uri: String, deadline: Duration) -> TaskWatcher {
        TaskWatcher::new(uri, None, Duration::from_millis(10), deadline).unwrap()
    }

    #[tokio::test]
    async fn test_watch_reports_terminal_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/task/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "task_id": "t-1", "state": "SUCCESS", "message": "Task succeeded"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/task/t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "task_id": "t-2", "state": "FAILED"
            })))
            .mount(&server)
            .await;

        let reports = watcher(server.uri(), Duration::from_secs(5))
            .watch(&[TaskId::new("t-1"), TaskId::new("t-2")], &CancellationToken::new())
            .await;

        assert_eq!(reports[0].state, Some(TaskState::Success));
        assert_eq!(reports[0].message.as_deref(), Some("Task succeeded"));
        assert_eq!(reports[1].state, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn test_watch_stops_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "task_id": "t-3", "state": "PROGRESS"
            })))
            .mount(&server)
            .await;

        let reports = watcher(server.uri(), Duration::from_millis(50))
            .watch(&[TaskId::new("t-3")], &CancellationToken::new())
            .await;

        assert_eq!(reports[0].state, Some(TaskState::Progress));
        assert!(!reports[0].is_finished());
    }

    #[tokio::test]
    async fn test_status_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = watcher(server.uri(), Duration::from_secs(1))
            .status(&TaskId::new("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
