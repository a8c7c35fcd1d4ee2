//! Invoice and payment life cycles
//!
//! Drives invoices through their state machines on top of the ledger:
//!
//! 1. **Incoming**: `initialized -> open -> settled`, settled from the
//!    node's invoice update stream
//! 2. **Outgoing**: `initialized -> settled | error`, with funds reserved
//!    before the node is asked to pay
//! 3. **Reconciliation**: payments whose outcome was never observed are
//!    resolved from the node's payment record
//!
//! # Guarantees
//!
//! - Every balance change goes through one ledger transaction with
//!   fail-fast row locks and a commit-time balance check
//! - The synchronous and reconciliation paths both re-check
//!   `state = initialized` under the invoice lock, so only one applies
//! - Events are published after commit and never block the publisher
//!
//! # Example
//!
//! ```no_run
//! use lifecycle::{Config, Hub};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> lifecycle::Result<()> {
//!     let hub = Hub::from_config(Config::from_env()?)?;
//!     let (user, _) = hub.ledger().create_user("alice", "credential-hash")?;
//!
//!     let cancel = CancellationToken::new();
//!     let handle = hub.start(cancel.clone()).await?;
//!
//!     let invoice = hub
//!         .invoices()
//!         .add_incoming_invoice(user.id, 1_000, "top up", None)
//!         .await?;
//!     println!("pay {}", invoice.payment_request.unwrap_or_default());
//!
//!     cancel.cancel();
//!     handle.join_tasks().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fees;
pub mod invoices;
pub mod metrics;
pub mod payments;
pub mod reconcile;
pub mod subscription;

pub use config::Config;
pub use engine::{Hub, HubHandle};
pub use error::{Error, Result};
pub use events::{EventPublisher, InvoiceEvent};
pub use fees::FeeConfig;
pub use invoices::InvoiceManager;
pub use payments::{OutgoingTarget, PaymentManager, PaymentOutcome};
pub use reconcile::{PendingPaymentReconciler, ReconcileAction};
pub use subscription::{InvoiceUpdateSubscription, SubscriptionSupervisor};
