//! Portal callback

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use pubindex_common::types::{ResourceId, Secret, TaskId};

use crate::config::PortalConfig;
use crate::error::NotifyError;

use super::PortalNotifier;

#[derive(Debug, Serialize)]
struct ResourceUpdate<'a> {
    uuid: &'a str,
    task_id: &'a str,
}

/// Tells the portal which search task indexes a resource
#[derive(Debug, Clone)]
pub struct PortalClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl PortalClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &PortalConfig) -> Result<Self, NotifyError> {
        Self::new(config.base_url.clone(), Duration::from_secs(config.timeout_secs))
    }

    fn update_url(&self) -> String {
        format!("{}/resource/update/", self.base_url)
    }
}

#[async_trait]
impl PortalNotifier for PortalClient {
    async fn notify(
        &self,
        credential: Option<&Secret>,
        resource_id: &ResourceId,
        task_id: &TaskId,
    ) -> Result<(), NotifyError> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or(NotifyError::MissingCredential)?;

        let body = ResourceUpdate {
            uuid: resource_id.as_str(),
            task_id: task_id.as_str(),
        };

        let response = self
            .client
            .post(self.update_url())
            .header(reqwest::header::AUTHORIZATION, credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.timeout.as_secs())
                } else {
                    NotifyError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(resource_id = %resource_id, task_id = %task_id, "Portal notified");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_notify_posts_update() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resource/update/"))
            .and(header("authorization", "jupyter-token"))
            .and(body_json(serde_json::json!({"uuid": "r2", "task_id": "t-100"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = PortalClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        client
            .notify(
                Some(&Secret::new("jupyter-token")),
                &ResourceId::new("r2").unwrap(),
                &TaskId::new("t-100"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = PortalClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .notify(
                Some(&Secret::new("tok")),
                &ResourceId::new("r2").unwrap(),
                &TaskId::new("t-100"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_notify_without_credential_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = PortalClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .notify(None, &ResourceId::new("r2").unwrap(), &TaskId::new("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::MissingCredential));
    }
}
