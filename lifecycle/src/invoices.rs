//! Incoming invoice life cycle
//!
//! `initialized -> open -> settled`. The invoice row is written before the
//! node is asked for a payment request, so a crash in between leaves an
//! `initialized` row and never an unknown node invoice. Settlement credits
//! `current` from `incoming` in one transaction guarded by the invoice state.

use crate::{
    config::InvoiceConfig,
    events::{EventPublisher, INCOMING_SETTLED},
    metrics::{INVOICES_CREATED_TOTAL, INVOICES_SETTLED_TOTAL},
    Error, Result,
};
use chrono::{Duration, Utc};
use ledger_core::{
    AccountType, EntryType, Invoice, InvoiceState, InvoiceType, Ledger, NewEntry, UserId,
    MAX_AMOUNT_SAT,
};
use node_adapters::{random_preimage, AddInvoiceRequest, Hash32, InvoiceUpdate, NodeClient};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates and settles incoming invoices
pub struct InvoiceManager {
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    events: EventPublisher,
    config: InvoiceConfig,
}

impl std::fmt::Debug for InvoiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceManager")
            .field("node", &self.node.name())
            .field("config", &self.config)
            .finish()
    }
}

impl InvoiceManager {
    /// Create manager
    pub fn new(
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        events: EventPublisher,
        config: InvoiceConfig,
    ) -> Self {
        Self {
            ledger,
            node,
            events,
            config,
        }
    }

    /// Create an incoming invoice for `user_id` and register it with the node.
    ///
    /// On a node error the invoice stays `initialized` and the error is
    /// returned.
    pub async fn add_incoming_invoice(
        &self,
        user_id: UserId,
        amount: i64,
        memo: impl Into<String>,
        description_hash: Option<Hash32>,
    ) -> Result<Invoice> {
        if amount < 0 {
            return Err(Error::Validation(format!("negative amount {}", amount)));
        }
        if amount > MAX_AMOUNT_SAT {
            return Err(Error::Validation(format!(
                "amount {} above {}",
                amount, MAX_AMOUNT_SAT
            )));
        }
        if let Some(max) = self.config.max_receive_sat {
            if amount > max {
                return Err(Error::Validation(format!(
                    "amount {} above receive limit {}",
                    amount, max
                )));
            }
        }
        let user = self.ledger.user(user_id)?;
        if !user.active {
            return Err(Error::UserInactive(user_id));
        }

        let preimage = random_preimage();
        let mut draft = Invoice::draft(InvoiceType::Incoming, user_id, amount);
        draft.memo = memo.into();
        draft.description_hash = description_hash.map(hex::encode);
        draft.preimage = Some(hex::encode(preimage));

        let mut tx = self.ledger.begin();
        let mut invoice = tx.insert_invoice(draft)?;
        tx.commit()?;
        INVOICES_CREATED_TOTAL
            .with_label_values(&[InvoiceType::Incoming.as_str()])
            .inc();

        let request = AddInvoiceRequest {
            amount_sat: amount,
            memo: invoice.memo.clone(),
            description_hash,
            preimage,
            expiry_secs: self.config.expiry_secs,
        };
        let response = match self.node.add_invoice(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(invoice_id = invoice.id, error = %e, "Node rejected invoice; left initialized");
                return Err(e.into());
            }
        };

        invoice.payment_request = Some(response.payment_request);
        invoice.r_hash = Some(hex::encode(response.r_hash));
        invoice.add_index = Some(response.add_index);
        invoice.expires_at = Some(Utc::now() + Duration::seconds(self.config.expiry_secs as i64));
        invoice.state = InvoiceState::Open;

        let mut tx = self.ledger.begin();
        let invoice = tx.update_invoice(invoice)?;
        tx.commit()?;

        info!(
            invoice_id = invoice.id,
            user_id,
            amount,
            add_index = response.add_index,
            "Incoming invoice open"
        );
        Ok(invoice)
    }

    /// Apply a settled update from the node.
    ///
    /// Returns the settled invoice, or `None` when the update is not a
    /// settlement, matches no unsettled invoice, or lost the race to an
    /// earlier delivery of the same update.
    pub async fn settle_incoming(&self, update: &InvoiceUpdate) -> Result<Option<Invoice>> {
        if !update.is_settled() {
            return Ok(None);
        }
        let r_hash = hex::encode(update.r_hash);
        let Some(found) = self.ledger.find_invoice_by_r_hash(
            InvoiceType::Incoming,
            &r_hash,
            Some(InvoiceState::Settled),
        )?
        else {
            debug!(%r_hash, add_index = update.add_index, "No unsettled invoice for update");
            return Ok(None);
        };

        let mut tx = self.ledger.begin();
        tx.lock_invoice(found.id)?;
        let mut invoice = tx.invoice(found.id)?;
        if invoice.state.is_terminal() {
            debug!(invoice_id = invoice.id, "Invoice already settled");
            return Ok(None);
        }

        // Zero-amount invoices take whatever was paid
        if invoice.amount == 0 {
            invoice.amount = update.amount_paid_sat;
        }

        let incoming = self.ledger.account_for(invoice.user_id, AccountType::Incoming)?;
        let current = self.ledger.account_for(invoice.user_id, AccountType::Current)?;
        tx.insert_entry(NewEntry {
            user_id: invoice.user_id,
            invoice_id: invoice.id,
            parent_id: None,
            debit_account_id: incoming.id,
            credit_account_id: current.id,
            amount: invoice.amount,
            entry_type: EntryType::Incoming,
        })?;

        invoice.state = InvoiceState::Settled;
        invoice.settled_at = Some(update.settle_date.unwrap_or_else(Utc::now));
        if invoice.add_index.is_none() {
            invoice.add_index = Some(update.add_index);
        }
        let invoice = tx.update_invoice(invoice)?;
        tx.commit()?;

        INVOICES_SETTLED_TOTAL
            .with_label_values(&[InvoiceType::Incoming.as_str()])
            .inc();
        info!(
            invoice_id = invoice.id,
            user_id = invoice.user_id,
            amount = invoice.amount,
            "Incoming invoice settled"
        );
        self.events.publish(INCOMING_SETTLED, &invoice);
        Ok(Some(invoice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_bus::{Broker, BrokerConfig};
    use node_adapters::SimulatedNode;
    use tempfile::TempDir;

    struct Fixture {
        ledger: Arc<Ledger>,
        node: Arc<SimulatedNode>,
        manager: InvoiceManager,
        _dir: TempDir,
    }

    fn fixture(config: InvoiceConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger =
            Arc::new(Ledger::open(ledger_core::Config::with_data_dir(dir.path())).unwrap());
        let node = Arc::new(SimulatedNode::new("node-a"));
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let events = EventPublisher::new(broker, ledger.clone());
        let manager = InvoiceManager::new(ledger.clone(), node.clone(), events, config);
        Fixture {
            ledger,
            node,
            manager,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_add_incoming_invoice_opens_it() {
        let f = fixture(InvoiceConfig::default());
        let (user, _) = f.ledger.create_user("alice", "h").unwrap();

        let invoice = f
            .manager
            .add_incoming_invoice(user.id, 1_000, "coffee", None)
            .await
            .unwrap();

        assert_eq!(invoice.state, InvoiceState::Open);
        assert_eq!(invoice.add_index, Some(1));
        assert!(invoice.payment_request.is_some());
        assert!(invoice.expires_at.is_some());
        assert_eq!(f.ledger.max_add_index(), 1);

        let r_hash: Hash32 = hex::decode(invoice.r_hash.unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        assert!(f.node.has_invoice(&r_hash));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture(InvoiceConfig {
            max_receive_sat: Some(500),
            ..Default::default()
        });
        let (user, _) = f.ledger.create_user("alice", "h").unwrap();

        assert!(matches!(
            f.manager.add_incoming_invoice(user.id, -1, "", None).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.manager.add_incoming_invoice(user.id, 501, "", None).await,
            Err(Error::Validation(_))
        ));

        let unlimited = fixture(InvoiceConfig::default());
        let (bob, _) = unlimited.ledger.create_user("bob", "h").unwrap();
        assert!(matches!(
            unlimited
                .manager
                .add_incoming_invoice(bob.id, MAX_AMOUNT_SAT + 1, "", None)
                .await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            unlimited
                .manager
                .add_incoming_invoice(bob.id, i64::MAX, "", None)
                .await,
            Err(Error::Validation(_))
        ));

        f.ledger.deactivate_user(user.id).unwrap();
        assert!(matches!(
            f.manager.add_incoming_invoice(user.id, 10, "", None).await,
            Err(Error::UserInactive(_))
        ));
        assert!(f.ledger.invoices_for_user(user.id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_error_leaves_initialized() {
        let f = fixture(InvoiceConfig::default());
        let (user, _) = f.ledger.create_user("alice", "h").unwrap();
        f.node.set_unreachable(true);

        let result = f.manager.add_incoming_invoice(user.id, 100, "", None).await;
        assert!(matches!(result, Err(Error::Node(_))));

        let invoices = f.ledger.invoices_for_user(user.id, None).unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].state, InvoiceState::Initialized);
    }

    #[tokio::test]
    async fn test_settle_twice_one_entry() {
        let f = fixture(InvoiceConfig::default());
        let (user, _) = f.ledger.create_user("alice", "h").unwrap();
        let invoice = f
            .manager
            .add_incoming_invoice(user.id, 1_000, "", None)
            .await
            .unwrap();
        let r_hash: Hash32 = hex::decode(invoice.r_hash.as_ref().unwrap())
            .unwrap()
            .try_into()
            .unwrap();

        let update = f.node.settle_invoice(&r_hash).unwrap();
        let settled = f.manager.settle_incoming(&update).await.unwrap().unwrap();
        assert_eq!(settled.state, InvoiceState::Settled);
        assert!(f.manager.settle_incoming(&update).await.unwrap().is_none());

        assert_eq!(f.ledger.entries_for_invoice(invoice.id).unwrap().len(), 1);
        assert_eq!(f.ledger.balance_of(user.id, AccountType::Current).unwrap(), 1_000);
        assert_eq!(f.ledger.balance_of(user.id, AccountType::Incoming).unwrap(), -1_000);
    }

    #[tokio::test]
    async fn test_unknown_and_open_updates_ignored() {
        let f = fixture(InvoiceConfig::default());
        let mut update = InvoiceUpdate {
            r_hash: [7u8; 32],
            state: node_adapters::InvoiceUpdateState::Settled,
            settled: true,
            amount_paid_sat: 10,
            settle_date: None,
            add_index: 4,
        };
        assert!(f.manager.settle_incoming(&update).await.unwrap().is_none());

        update.state = node_adapters::InvoiceUpdateState::Open;
        update.settled = false;
        assert!(f.manager.settle_incoming(&update).await.unwrap().is_none());
    }
}
