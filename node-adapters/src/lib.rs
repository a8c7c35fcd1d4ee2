//! # Satshub Node Adapters
//!
//! Lightning node connectivity layer with:
//! - One capability trait ([`NodeClient`]) for every backend
//! - N-way liveness cluster with threshold-based failover
//! - In-memory simulated node for tests and local runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │      Life-cycle managers (invoices, payments)       │
//! └────────────┬────────────────────────────────────────┘
//!              │  Arc<dyn NodeClient>
//! ┌────────────▼────────────────────────────────────────┐
//! │      LivenessCluster (active node pointer)          │
//! └────────────┬───────────────────────────┬────────────┘
//!              │                           │
//!         ┌────▼─────┐                ┌────▼─────┐
//!         │  node A  │                │  node B  │
//!         └──────────┘                └──────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod cluster;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod simulated;
pub mod types;

pub use cluster::{ClusterConfig, LivenessCluster};
pub use connector::{InvoiceUpdateStream, NodeClient};
pub use error::{Error, Result};
pub use simulated::{PayOutcome, SimulatedNode};
pub use types::*;

/// Default minimum active/total channel ratio
pub const DEFAULT_LIVENESS_THRESHOLD: f64 = 0.5;

/// Default liveness check period (seconds)
pub const DEFAULT_LIVENESS_PERIOD_SECONDS: u64 = 30;
