//! Message Bus: in-process event fan-out
//!
//! Provides pub/sub messaging with:
//! - Topic-keyed broker with bounded, non-blocking per-subscriber channels
//! - Slow-consumer policy (drop the event or disconnect the subscriber)
//! - Webhook and NATS sinks with retry logic
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broker;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod nats;
pub mod types;
pub mod webhook;

pub use broker::{Broker, Subscription};
pub use consumer::{forward, EventSink};
pub use error::{Error, Result};
pub use nats::NatsForwarder;
pub use types::{BrokerConfig, PublishReport, SlowConsumerPolicy, SubscriberId, Topic};
pub use webhook::{WebhookConfig, WebhookForwarder};
