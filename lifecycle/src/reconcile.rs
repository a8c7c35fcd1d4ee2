//! Pending outgoing payment reconciliation
//!
//! Outgoing invoices left `initialized` by an indeterminate payment are
//! resolved against the node's own record of the payment. Invoices touched
//! within the safety window are skipped so a synchronous `pay_exact` that
//! is still running is never raced.

use crate::{
    config::ReconcileConfig,
    metrics::RECONCILE_ACTIONS_TOTAL,
    payments::{parse_hash, PaymentManager},
    Result,
};
use chrono::{Duration as ChronoDuration, Utc};
use ledger_core::{Invoice, InvoiceId, Ledger};
use node_adapters::{NodeClient, PaymentStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What reconciliation did with one invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Node reports success; invoice settled
    Settled,
    /// Node reports failure or does not know the payment; reservation reversed
    Failed,
    /// Still routing; retried next pass
    InFlight,
    /// Another path resolved the invoice first
    AlreadyResolved,
}

impl ReconcileAction {
    fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Settled => "settled",
            ReconcileAction::Failed => "failed",
            ReconcileAction::InFlight => "in_flight",
            ReconcileAction::AlreadyResolved => "already_resolved",
        }
    }
}

/// Periodic resolver of indeterminate payments
pub struct PendingPaymentReconciler {
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    payments: Arc<PaymentManager>,
    config: ReconcileConfig,
}

impl std::fmt::Debug for PendingPaymentReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPaymentReconciler")
            .field("node", &self.node.name())
            .field("config", &self.config)
            .finish()
    }
}

impl PendingPaymentReconciler {
    /// Create reconciler
    pub fn new(
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        payments: Arc<PaymentManager>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            ledger,
            node,
            payments,
            config,
        }
    }

    /// One pass over every pending outgoing invoice older than the safety
    /// window. Per-invoice failures are logged and skipped.
    pub async fn check_pending_outgoing_payments(
        &self,
    ) -> Result<Vec<(InvoiceId, ReconcileAction)>> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.safety_window_secs as i64);
        let pending: Vec<Invoice> = self
            .ledger
            .pending_outgoing_invoices()?
            .into_iter()
            .filter(|invoice| invoice.updated_at <= cutoff)
            .collect();

        if pending.is_empty() {
            debug!("No pending outgoing payments to reconcile");
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "Reconciling pending outgoing payments");

        let mut actions = Vec::with_capacity(pending.len());
        for invoice in &pending {
            match self.track_outgoing_payment_status(invoice).await {
                Ok(action) => actions.push((invoice.id, action)),
                Err(e) => {
                    warn!(invoice_id = invoice.id, error = %e, "Reconciliation failed");
                    RECONCILE_ACTIONS_TOTAL.with_label_values(&["error"]).inc();
                }
            }
        }
        Ok(actions)
    }

    /// Ask the node what happened to one payment and apply it
    pub async fn track_outgoing_payment_status(
        &self,
        invoice: &Invoice,
    ) -> Result<ReconcileAction> {
        let r_hash = parse_hash(invoice.r_hash.as_deref().unwrap_or_default())?;

        let resolved = match self.node.track_payment(&r_hash).await {
            Ok(track) => match track.status {
                PaymentStatus::Succeeded => self
                    .payments
                    .settle_outgoing(invoice.id, track.preimage, track.fee_sat)?
                    .map(|_| ReconcileAction::Settled),
                PaymentStatus::Failed => {
                    let reason = track
                        .failure_reason
                        .unwrap_or_else(|| "payment failed".to_string());
                    self.payments
                        .fail_outgoing(invoice.id, &reason)?
                        .map(|_| ReconcileAction::Failed)
                }
                PaymentStatus::InFlight => Some(ReconcileAction::InFlight),
            },
            Err(node_adapters::Error::PaymentNotFound(_)) => self
                .payments
                .fail_outgoing(invoice.id, "payment unknown to node")?
                .map(|_| ReconcileAction::Failed),
            Err(e) => return Err(e.into()),
        };

        let action = resolved.unwrap_or(ReconcileAction::AlreadyResolved);
        RECONCILE_ACTIONS_TOTAL
            .with_label_values(&[action.as_str()])
            .inc();
        debug!(invoice_id = invoice.id, action = action.as_str(), "Payment reconciled");
        Ok(action)
    }

    /// Reconcile once now, then every `interval_secs` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        info!(
            interval_secs = self.config.interval_secs,
            safety_window_secs = self.config.safety_window_secs,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_pending_outgoing_payments().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PaymentConfig, events::EventPublisher, fees::FeeConfig, OutgoingTarget};
    use ledger_core::{AccountType, InvoiceState};
    use message_bus::{Broker, BrokerConfig};
    use node_adapters::{PayOutcome, PaymentTrack, SimulatedNode};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        ledger: Arc<Ledger>,
        node: Arc<SimulatedNode>,
        payments: Arc<PaymentManager>,
        reconciler: PendingPaymentReconciler,
        _dir: TempDir,
    }

    fn fixture(safety_window_secs: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger =
            Arc::new(Ledger::open(ledger_core::Config::with_data_dir(dir.path())).unwrap());
        let node = Arc::new(SimulatedNode::new("node-a"));
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let events = EventPublisher::new(broker, ledger.clone());
        let payments = Arc::new(PaymentManager::new(
            ledger.clone(),
            node.clone(),
            events,
            FeeConfig::default(),
            PaymentConfig::default(),
        ));
        let reconciler = PendingPaymentReconciler::new(
            ledger.clone(),
            node.clone(),
            payments.clone(),
            ReconcileConfig {
                interval_secs: 60,
                safety_window_secs,
            },
        );
        Fixture {
            ledger,
            node,
            payments,
            reconciler,
            _dir: dir,
        }
    }

    /// Fund a user and leave a 500 sat keysend payment indeterminate
    async fn pending_payment(f: &Fixture, outcome: PayOutcome) -> (u64, Invoice) {
        let (user, accounts) = f.ledger.create_user("alice", "h").unwrap();
        let mut tx = f.ledger.begin();
        let funding = tx
            .insert_invoice(Invoice::draft(ledger_core::InvoiceType::Incoming, user.id, 1_000))
            .unwrap();
        tx.insert_entry(ledger_core::NewEntry {
            user_id: user.id,
            invoice_id: funding.id,
            parent_id: None,
            debit_account_id: accounts[0].id,
            credit_account_id: accounts[1].id,
            amount: 1_000,
            entry_type: ledger_core::EntryType::Incoming,
        })
        .unwrap();
        tx.commit().unwrap();

        f.node.push_outcome(outcome);
        let invoice = f
            .payments
            .add_outgoing_invoice(
                user.id,
                OutgoingTarget::Keysend {
                    destination: format!("02{}", "ab".repeat(32)),
                    custom_records: BTreeMap::new(),
                },
                Some(500),
            )
            .await
            .unwrap();
        let outcome = f.payments.pay_invoice(&invoice).await.unwrap();
        (user.id, outcome.invoice().clone())
    }

    fn r_hash(invoice: &Invoice) -> [u8; 32] {
        parse_hash(invoice.r_hash.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_silent_success_settled_once() {
        let f = fixture(0);
        let (user_id, invoice) =
            pending_payment(&f, PayOutcome::SucceedSilently { fee_sat: 1 }).await;

        let actions = f.reconciler.check_pending_outgoing_payments().await.unwrap();
        assert_eq!(actions, vec![(invoice.id, ReconcileAction::Settled)]);
        assert!(f.reconciler.check_pending_outgoing_payments().await.unwrap().is_empty());

        let action = f.reconciler.track_outgoing_payment_status(&invoice).await.unwrap();
        assert_eq!(action, ReconcileAction::AlreadyResolved);

        assert_eq!(f.ledger.balance_of(user_id, AccountType::Current).unwrap(), 499);
        assert_eq!(f.ledger.invoice(invoice.id).unwrap().state, InvoiceState::Settled);
    }

    #[tokio::test]
    async fn test_unknown_payment_reversed() {
        let f = fixture(0);
        let (user_id, invoice) = pending_payment(&f, PayOutcome::Vanish).await;

        let actions = f.reconciler.check_pending_outgoing_payments().await.unwrap();
        assert_eq!(actions, vec![(invoice.id, ReconcileAction::Failed)]);
        assert_eq!(f.ledger.balance_of(user_id, AccountType::Current).unwrap(), 1_000);

        let stored = f.ledger.invoice(invoice.id).unwrap();
        assert_eq!(stored.state, InvoiceState::Error);
        assert_eq!(stored.error_message.as_deref(), Some("payment unknown to node"));
    }

    #[tokio::test]
    async fn test_in_flight_left_alone_then_failed() {
        let f = fixture(0);
        let (user_id, invoice) = pending_payment(&f, PayOutcome::Vanish).await;
        let hash = r_hash(&invoice);

        f.node.set_payment_status(
            hash,
            PaymentTrack {
                status: PaymentStatus::InFlight,
                fee_sat: 0,
                preimage: None,
                failure_reason: None,
            },
        );
        let actions = f.reconciler.check_pending_outgoing_payments().await.unwrap();
        assert_eq!(actions, vec![(invoice.id, ReconcileAction::InFlight)]);
        assert_eq!(f.ledger.balance_of(user_id, AccountType::Current).unwrap(), 500);

        f.node.set_payment_status(
            hash,
            PaymentTrack {
                status: PaymentStatus::Failed,
                fee_sat: 0,
                preimage: None,
                failure_reason: Some("incorrect payment details".into()),
            },
        );
        let actions = f.reconciler.check_pending_outgoing_payments().await.unwrap();
        assert_eq!(actions, vec![(invoice.id, ReconcileAction::Failed)]);
        assert_eq!(f.ledger.entries_for_invoice(invoice.id).unwrap().len(), 2);
        assert_eq!(f.ledger.balance_of(user_id, AccountType::Current).unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_safety_window_skips_recent() {
        let f = fixture(3_600);
        pending_payment(&f, PayOutcome::SucceedSilently { fee_sat: 1 }).await;

        assert!(f.reconciler.check_pending_outgoing_payments().await.unwrap().is_empty());
        assert_eq!(f.ledger.pending_outgoing_invoices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_logged_not_fatal() {
        let f = fixture(0);
        let (_, invoice) = pending_payment(&f, PayOutcome::Vanish).await;
        f.node.set_unreachable(true);

        let actions = f.reconciler.check_pending_outgoing_payments().await.unwrap();
        assert!(actions.is_empty());
        assert!(f.ledger.invoice(invoice.id).unwrap().is_pending_outgoing());
    }

    #[tokio::test]
    async fn test_run_reconciles_at_start_and_stops() {
        let f = Arc::new(fixture(0));
        let (_, invoice) = pending_payment(&f, PayOutcome::SucceedSilently { fee_sat: 0 }).await;

        let cancel = CancellationToken::new();
        let task = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.reconciler.run(cancel).await })
        };

        for _ in 0..100 {
            if !f.ledger.invoice(invoice.id).unwrap().is_pending_outgoing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.ledger.invoice(invoice.id).unwrap().state, InvoiceState::Settled);

        cancel.cancel();
        task.await.unwrap();
    }
}
