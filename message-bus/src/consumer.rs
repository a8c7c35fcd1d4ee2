//! External event consumers
//!
//! A sink is driven by its own task reading one broker subscription.
//! Delivery failures are logged and counted; the loop keeps going.

use crate::{
    broker::Subscription,
    metrics::{FORWARD_DURATION, FORWARD_TOTAL},
    types::Topic,
    Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Destination outside the process (webhook, NATS, ...)
#[async_trait]
pub trait EventSink<E>: Send + Sync {
    /// Deliver one event
    async fn deliver(&self, topic: &Topic, event: &E) -> Result<()>;

    /// Sink name, for logs and metrics
    fn name(&self) -> &str;
}

/// Forward every event of `subscription` to `sink` until cancelled or the
/// subscription closes. Returns the number of events delivered.
pub async fn forward<E, S>(
    mut subscription: Subscription<E>,
    sink: Arc<S>,
    cancel: CancellationToken,
) -> usize
where
    E: Send + Sync + 'static,
    S: EventSink<E> + ?Sized,
{
    let topic = subscription.topic.clone();
    info!(sink = sink.name(), %topic, "Forwarder started");
    let mut delivered = 0usize;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let start = Instant::now();
        let result = sink.deliver(&topic, &event).await;
        FORWARD_DURATION
            .with_label_values(&[sink.name()])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                delivered += 1;
                FORWARD_TOTAL.with_label_values(&[sink.name(), "success"]).inc();
            }
            Err(e) => {
                error!(sink = sink.name(), %topic, error = %e, "Event delivery failed");
                FORWARD_TOTAL.with_label_values(&[sink.name(), "error"]).inc();
            }
        }
    }

    info!(sink = sink.name(), %topic, delivered, "Forwarder stopped");
    delivered
}
