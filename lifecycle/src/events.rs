//! Invoice events published to the broker
//!
//! Every settled or failed invoice is published twice: once on its kind
//! topic and once on the owner's `user.<id>` topic. Publishing happens only
//! after the ledger transaction has committed.

use crate::metrics::EVENTS_PUBLISHED_TOTAL;
use chrono::{DateTime, Utc};
use ledger_core::{Invoice, InvoiceId, InvoiceState, InvoiceType, Ledger};
use message_bus::{Broker, Topic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Incoming invoice paid
pub const INCOMING_SETTLED: &str = "invoice.incoming.settled";
/// Outgoing payment completed
pub const OUTGOING_SETTLED: &str = "invoice.outgoing.settled";
/// Outgoing payment failed and was reversed
pub const OUTGOING_ERROR: &str = "invoice.outgoing.error";

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    /// Invoice ID
    pub id: InvoiceId,
    /// Direction
    #[serde(rename = "type")]
    pub invoice_type: InvoiceType,
    /// Owner login
    pub user_login: String,
    /// Amount (sat)
    pub amount: i64,
    /// Routing fee paid (sat)
    pub fee: i64,
    /// Memo
    pub memo: String,
    /// Hex description hash
    pub description_hash: Option<String>,
    /// BOLT11 payment request
    pub payment_request: Option<String>,
    /// Payee node
    pub destination_pubkey: Option<String>,
    /// TLV records, values hex encoded
    pub custom_records: BTreeMap<u64, String>,
    /// Hex payment hash
    pub r_hash: Option<String>,
    /// Hex preimage
    pub preimage: Option<String>,
    /// Sent via keysend
    pub keysend: bool,
    /// State at publish time
    pub state: InvoiceState,
    /// Failure reason
    pub error_message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: Option<DateTime<Utc>>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Settlement time
    pub settled_at: Option<DateTime<Utc>>,
}

impl InvoiceEvent {
    /// Snapshot of `invoice` owned by `user_login`
    pub fn from_invoice(invoice: &Invoice, user_login: impl Into<String>) -> Self {
        Self {
            id: invoice.id,
            invoice_type: invoice.invoice_type,
            user_login: user_login.into(),
            amount: invoice.amount,
            fee: invoice.fee,
            memo: invoice.memo.clone(),
            description_hash: invoice.description_hash.clone(),
            payment_request: invoice.payment_request.clone(),
            destination_pubkey: invoice.destination_pubkey.clone(),
            custom_records: invoice
                .custom_records
                .iter()
                .map(|(key, value)| (*key, hex::encode(value)))
                .collect(),
            r_hash: invoice.r_hash.clone(),
            preimage: invoice.preimage.clone(),
            keysend: invoice.keysend,
            state: invoice.state,
            error_message: invoice.error_message.clone(),
            created_at: invoice.created_at,
            expires_at: invoice.expires_at,
            updated_at: invoice.updated_at,
            settled_at: invoice.settled_at,
        }
    }
}

/// Publishes committed invoice changes
#[derive(Debug, Clone)]
pub struct EventPublisher {
    broker: Arc<Broker<InvoiceEvent>>,
    ledger: Arc<Ledger>,
}

impl EventPublisher {
    /// Create publisher
    pub fn new(broker: Arc<Broker<InvoiceEvent>>, ledger: Arc<Ledger>) -> Self {
        Self { broker, ledger }
    }

    /// Broker events go to
    pub fn broker(&self) -> &Arc<Broker<InvoiceEvent>> {
        &self.broker
    }

    /// Publish `invoice` on `kind` and on its owner's topic. Never blocks.
    pub fn publish(&self, kind: &str, invoice: &Invoice) {
        let login = match self.ledger.user(invoice.user_id) {
            Ok(user) => user.login,
            Err(e) => {
                warn!(invoice_id = invoice.id, error = %e, "Publishing event without user login");
                String::new()
            }
        };
        let event = InvoiceEvent::from_invoice(invoice, login);

        let kind_report = self.broker.publish(&Topic::new(kind), event.clone());
        let user_report = self.broker.publish(&Topic::user(invoice.user_id), event);
        EVENTS_PUBLISHED_TOTAL.with_label_values(&[kind]).inc();

        debug!(
            invoice_id = invoice.id,
            topic = kind,
            delivered = kind_report.delivered + user_report.delivered,
            dropped = kind_report.dropped + user_report.dropped,
            "Event published"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_bus::BrokerConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_published_on_kind_and_user_topics() {
        let temp_dir = TempDir::new().unwrap();
        let ledger =
            Arc::new(Ledger::open(ledger_core::Config::with_data_dir(temp_dir.path())).unwrap());
        let (user, _) = ledger.create_user("alice", "hash").unwrap();
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let publisher = EventPublisher::new(broker.clone(), ledger);

        let mut by_kind = broker.subscribe(INCOMING_SETTLED);
        let mut by_user = broker.subscribe(Topic::user(user.id));

        let mut invoice = Invoice::draft(InvoiceType::Incoming, user.id, 1_000);
        invoice.id = 9;
        invoice.custom_records.insert(5482373484, vec![0xab, 0xcd]);
        publisher.publish(INCOMING_SETTLED, &invoice);

        let event = by_kind.recv().await.unwrap();
        assert_eq!(event.id, 9);
        assert_eq!(event.user_login, "alice");
        assert_eq!(event.custom_records[&5482373484], "abcd");
        assert_eq!(by_user.recv().await.unwrap(), event);
    }

    #[test]
    fn test_payload_field_names() {
        let invoice = Invoice::draft(InvoiceType::Outgoing, 1, 10);
        let json = serde_json::to_value(InvoiceEvent::from_invoice(&invoice, "bob")).unwrap();
        assert_eq!(json["type"], "outgoing");
        assert_eq!(json["state"], "initialized");
        assert_eq!(json["user_login"], "bob");
    }
}
