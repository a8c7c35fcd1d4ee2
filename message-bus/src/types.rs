//! Broker types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic name, e.g. `invoice.incoming.settled` or `user.42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Create topic
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Per-user topic
    pub fn user(user_id: u64) -> Self {
        Self(format!("user.{}", user_id))
    }

    /// Topic name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque subscriber handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What to do with a subscriber whose channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Drop the event for that subscriber only
    #[default]
    DropEvent,
    /// Remove the subscriber; its receiver sees the channel close
    Disconnect,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-subscriber channel capacity
    pub channel_capacity: usize,
    /// Full-channel policy
    pub slow_consumer_policy: SlowConsumerPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            slow_consumer_policy: SlowConsumerPolicy::DropEvent,
        }
    }
}

/// Result of one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    /// Subscribers that received the event
    pub delivered: usize,
    /// Subscribers that missed it (channel full, kept)
    pub dropped: usize,
    /// Subscribers removed (channel full under `Disconnect`, or receiver gone)
    pub removed: usize,
}
