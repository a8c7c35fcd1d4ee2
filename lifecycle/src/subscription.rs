//! Invoice settlement stream
//!
//! [`InvoiceUpdateSubscription`] follows the node's invoice updates and
//! settles matching incoming invoices. A stream that ends or errors is
//! fatal for that run; [`SubscriptionSupervisor`] restarts it with
//! exponential backoff and gives up after `max_restarts` consecutive
//! failures, at which point the process is expected to exit.

use crate::{
    config::SupervisorConfig, invoices::InvoiceManager, metrics::SUBSCRIPTION_RESTARTS_TOTAL,
    Error, Result,
};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use ledger_core::Ledger;
use node_adapters::NodeClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One run of the settlement stream
#[derive(Clone)]
pub struct InvoiceUpdateSubscription {
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    invoices: Arc<InvoiceManager>,
}

impl std::fmt::Debug for InvoiceUpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceUpdateSubscription")
            .field("node", &self.node.name())
            .finish()
    }
}

impl InvoiceUpdateSubscription {
    /// Create subscription
    pub fn new(
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        invoices: Arc<InvoiceManager>,
    ) -> Self {
        Self {
            ledger,
            node,
            invoices,
        }
    }

    /// Follow the stream until cancelled (`Ok`) or the stream fails
    /// ([`Error::SubscriptionFailed`]).
    ///
    /// Resumes one before the highest known `add_index` so the last update
    /// is seen again; settlement is idempotent.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let from_add_index = self.ledger.max_add_index().saturating_sub(1);
        let mut stream = self
            .node
            .subscribe_invoices(from_add_index)
            .await
            .map_err(|e| Error::SubscriptionFailed(e.to_string()))?;
        info!(from_add_index, node = self.node.name(), "Invoice subscription started");

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Invoice subscription cancelled");
                    return Ok(());
                }
                item = stream.next() => item,
            };

            let update = match item {
                Some(Ok(update)) => update,
                Some(Err(e)) => return Err(Error::SubscriptionFailed(e.to_string())),
                None => return Err(Error::SubscriptionFailed("stream ended".into())),
            };
            if !update.is_settled() {
                debug!(add_index = update.add_index, state = ?update.state, "Skipping update");
                continue;
            }

            if let Err(e) = self.invoices.settle_incoming(&update).await {
                // Retryable failures are not replayed by a restart; they need an operator
                error!(
                    r_hash = %hex::encode(update.r_hash),
                    add_index = update.add_index,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Failed to apply settlement"
                );
            }
        }
    }
}

/// Restarts the settlement stream after failures
#[derive(Debug)]
pub struct SubscriptionSupervisor {
    subscription: InvoiceUpdateSubscription,
    config: SupervisorConfig,
}

impl SubscriptionSupervisor {
    /// Create supervisor
    pub fn new(subscription: InvoiceUpdateSubscription, config: SupervisorConfig) -> Self {
        Self {
            subscription,
            config,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run until cancelled (`Ok`) or restarts are exhausted (the last error).
    ///
    /// A run that stayed up longer than `max_backoff_ms` resets the restart
    /// count.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.backoff();
        let healthy_after = Duration::from_millis(self.config.max_backoff_ms);
        let mut restarts = 0u32;

        loop {
            let started = Instant::now();
            let err = match self.subscription.run(cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => e,
            };

            if started.elapsed() >= healthy_after {
                restarts = 0;
                backoff.reset();
            }
            if restarts >= self.config.max_restarts {
                error!(restarts, error = %err, "Invoice subscription failed permanently");
                return Err(err);
            }
            restarts += 1;
            SUBSCRIPTION_RESTARTS_TOTAL.inc();

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_millis(self.config.max_backoff_ms));
            warn!(
                restart = restarts,
                max_restarts = self.config.max_restarts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Invoice subscription failed; restarting"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
