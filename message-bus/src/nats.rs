//! NATS sink: publishes each event as JSON to `<prefix>.<topic>`

use crate::{consumer::EventSink, types::Topic, Error, Result};
use async_nats::Client;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Publishes events to NATS
#[derive(Debug, Clone)]
pub struct NatsForwarder {
    client: Client,
    subject_prefix: String,
}

impl NatsForwarder {
    /// Connect to NATS
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        info!("Connected to NATS at {}", url);
        Ok(Self::with_client(client, subject_prefix))
    }

    /// Wrap an existing connection
    pub fn with_client(client: Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Subject an event on `topic` is published to
    pub fn subject(&self, topic: &Topic) -> String {
        subject_for(&self.subject_prefix, topic)
    }
}

fn subject_for(prefix: &str, topic: &Topic) -> String {
    if prefix.is_empty() {
        topic.to_string()
    } else {
        format!("{}.{}", prefix, topic)
    }
}

#[async_trait]
impl<E> EventSink<E> for NatsForwarder
where
    E: Serialize + Send + Sync,
{
    async fn deliver(&self, topic: &Topic, event: &E) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(self.subject(topic), payload.into())
            .await
            .map_err(|e| Error::Nats(e.to_string()))
    }

    fn name(&self) -> &str {
        "nats"
    }
}
