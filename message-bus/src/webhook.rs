//! Webhook sink: POSTs each event as JSON, retrying with exponential backoff

use crate::{consumer::EventSink, types::Topic, Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Header carrying the topic of the delivered event
pub const TOPIC_HEADER: &str = "x-hub-topic";

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Endpoint URL
    pub url: String,
    /// Per-request timeout (ms)
    pub request_timeout_ms: u64,
    /// First retry delay (ms)
    pub initial_retry_ms: u64,
    /// Upper bound on a single retry delay (ms)
    pub max_retry_ms: u64,
    /// Give up after this long (ms)
    pub max_elapsed_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: 5_000,
            initial_retry_ms: 100,
            max_retry_ms: 2_000,
            max_elapsed_ms: 10_000,
        }
    }
}

/// POSTs events to one HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookForwarder {
    /// Create forwarder
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    async fn post_once(&self, topic: &Topic, body: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TOPIC_HEADER, topic.as_str())
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::WebhookStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl<E> EventSink<E> for WebhookForwarder
where
    E: Serialize + Send + Sync,
{
    async fn deliver(&self, topic: &Topic, event: &E) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_retry_ms))
            .with_max_interval(Duration::from_millis(self.config.max_retry_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.max_elapsed_ms)))
            .build();

        let body = body.as_slice();
        backoff::future::retry(policy, || async move {
            self.post_once(topic, body).await.map_err(|e| {
                if e.is_transient() {
                    warn!(url = %self.config.url, error = %e, "Webhook delivery failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder(server: &MockServer) -> WebhookForwarder {
        WebhookForwarder::new(WebhookConfig {
            url: format!("{}/hook", server.uri()),
            initial_retry_ms: 10,
            max_retry_ms: 20,
            max_elapsed_ms: 2_000,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_json_with_topic_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(TOPIC_HEADER, "user.7"))
            .and(body_json(json!({"id": 1, "state": "settled"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        forwarder(&server)
            .deliver(&Topic::user(7), &json!({"id": 1, "state": "settled"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        forwarder(&server)
            .deliver(&Topic::new("t"), &json!({"id": 2}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad event"))
            .expect(1)
            .mount(&server)
            .await;

        let err = forwarder(&server)
            .deliver(&Topic::new("t"), &json!({"id": 3}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebhookStatus { status: 400, .. }));
    }
}
