//! Search index ingest client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use pubindex_common::types::{Secret, TaskId};

use crate::config::SearchConfig;

use super::Submitter;

pub(crate) fn ingest_url(base_url: &str, index_id: &str) -> String {
    format!("{}/v1/index/{}/ingest", base_url.trim_end_matches('/'), index_id)
}

pub(crate) fn task_url(base_url: &str, task_id: &str) -> String {
    format!("{}/v1/task/{}", base_url.trim_end_matches('/'), task_id)
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    task_id: Option<String>,
}

/// Posts ingest documents to the search index
#[derive(Debug, Clone)]
pub struct SearchSubmitter {
    client: Client,
    base_url: String,
    access_token: Option<Secret>,
}

impl SearchSubmitter {
    pub fn new(base_url: impl Into<String>, access_token: Option<Secret>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build search HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            access_token,
        })
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.access_token.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl Submitter for SearchSubmitter {
    async fn submit(&self, document: &Path, index_id: &str) -> Result<TaskId> {
        let body = tokio::fs::read(document)
            .await
            .with_context(|| format!("Failed to read {}", document.display()))?;
        let url = ingest_url(&self.base_url, index_id);

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.expose());
        }

        debug!(url = %url, document = %document.display(), "Submitting ingest document");
        let response = request
            .send()
            .await
            .with_context(|| format!("Ingest request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("search index responded with HTTP {}: {}", status.as_u16(), body);
        }

        let parsed: IngestResponse = response
            .json()
            .await
            .context("Ingest response is not valid JSON")?;
        let task_id = parsed
            .task_id
            .filter(|id| !id.trim().is_empty())
            .context("Ingest response has no task_id")?;

        info!(task_id = %task_id, document = %document.display(), "Ingest accepted");
        Ok(TaskId::new(task_id))
    }
}
