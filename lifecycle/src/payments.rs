//! Outgoing payment life cycle
//!
//! `initialized -> settled | error`. Funds are reserved (`current ->
//! outgoing`, plus the fee reserve when enabled) in a committed transaction
//! before the node is asked to pay. The outcome is then applied by exactly
//! one of the synchronous path or the reconciler: both re-check that the
//! invoice is still `initialized` under its row lock before mutating.

use crate::{
    config::PaymentConfig,
    events::{EventPublisher, OUTGOING_ERROR, OUTGOING_SETTLED},
    fees::FeeConfig,
    metrics::{
        INVOICES_CREATED_TOTAL, INVOICES_SETTLED_TOTAL, PAYMENT_DURATION, PAYMENT_OUTCOMES_TOTAL,
    },
    Error, Result,
};
use chrono::Utc;
use ledger_core::{
    AccountType, EntryType, Invoice, InvoiceId, InvoiceState, InvoiceType, Ledger, LedgerTx,
    NewEntry, TransactionEntry, UserId, MAX_AMOUNT_SAT,
};
use node_adapters::{payment_hash, random_preimage, Hash32, NodeClient, PayRequest, PaymentTarget};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What an outgoing invoice pays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingTarget {
    /// BOLT11 payment request
    PaymentRequest(String),
    /// Spontaneous payment; the hub chooses the preimage
    Keysend {
        /// Payee node pubkey (hex, 33 bytes)
        destination: String,
        /// TLV records sent along
        custom_records: BTreeMap<u64, Vec<u8>>,
    },
}

/// Result of [`PaymentManager::pay_invoice`] that is not a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Paid; invoice is `settled`
    Settled(Invoice),
    /// Outcome unknown; invoice stays `initialized` until reconciled
    Pending(Invoice),
}

impl PaymentOutcome {
    /// Invoice as last seen
    pub fn invoice(&self) -> &Invoice {
        match self {
            PaymentOutcome::Settled(invoice) | PaymentOutcome::Pending(invoice) => invoice,
        }
    }
}

/// Creates, pays and resolves outgoing invoices
pub struct PaymentManager {
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    events: EventPublisher,
    fees: FeeConfig,
    config: PaymentConfig,
}

impl std::fmt::Debug for PaymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentManager")
            .field("node", &self.node.name())
            .field("fees", &self.fees)
            .field("config", &self.config)
            .finish()
    }
}

impl PaymentManager {
    /// Create manager
    pub fn new(
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        events: EventPublisher,
        fees: FeeConfig,
        config: PaymentConfig,
    ) -> Self {
        Self {
            ledger,
            node,
            events,
            fees,
            config,
        }
    }

    /// Fee reserve configuration
    pub fn fees(&self) -> &FeeConfig {
        &self.fees
    }

    /// Validate a payment target and record it as an `initialized` outgoing
    /// invoice. No funds move yet.
    ///
    /// The balance check here is advisory: the reservation in
    /// [`pay_invoice`](Self::pay_invoice) is what enforces it.
    pub async fn add_outgoing_invoice(
        &self,
        user_id: UserId,
        target: OutgoingTarget,
        requested_amount: Option<i64>,
    ) -> Result<Invoice> {
        if let Some(amount) = requested_amount {
            if amount < 0 {
                return Err(Error::Validation(format!("negative amount {}", amount)));
            }
        }
        let user = self.ledger.user(user_id)?;
        if !user.active {
            return Err(Error::UserInactive(user_id));
        }

        let draft = match target {
            OutgoingTarget::PaymentRequest(text) => {
                self.draft_for_payment_request(user_id, text, requested_amount)
                    .await?
            }
            OutgoingTarget::Keysend {
                destination,
                custom_records,
            } => draft_for_keysend(user_id, destination, custom_records, requested_amount)?,
        };
        if draft.amount <= 0 {
            return Err(Error::Validation("amount must be positive".into()));
        }
        if draft.amount > MAX_AMOUNT_SAT {
            return Err(Error::Validation(format!(
                "amount {} above {}",
                draft.amount, MAX_AMOUNT_SAT
            )));
        }

        let r_hash = draft.r_hash.clone().unwrap_or_default();
        if let Some(existing) = self.ledger.find_invoice_by_r_hash(
            InvoiceType::Outgoing,
            &r_hash,
            Some(InvoiceState::Error),
        )? {
            return Err(Error::Validation(format!(
                "payment hash already used by invoice {} ({})",
                existing.id, existing.state
            )));
        }

        let required = draft
            .amount
            .checked_add(self.fees.fee_reserve(draft.amount))
            .ok_or_else(|| Error::Validation(format!("amount {} too large", draft.amount)))?;
        let available = self.ledger.balance_of(user_id, AccountType::Current)?;
        if available < required {
            return Err(Error::InsufficientBalance {
                available,
                required,
            });
        }

        let mut tx = self.ledger.begin();
        let invoice = tx.insert_invoice(draft)?;
        tx.commit()?;
        INVOICES_CREATED_TOTAL
            .with_label_values(&[InvoiceType::Outgoing.as_str()])
            .inc();

        info!(
            invoice_id = invoice.id,
            user_id,
            amount = invoice.amount,
            keysend = invoice.keysend,
            "Outgoing invoice created"
        );
        Ok(invoice)
    }

    async fn draft_for_payment_request(
        &self,
        user_id: UserId,
        payment_request: String,
        requested_amount: Option<i64>,
    ) -> Result<Invoice> {
        let decoded = self
            .node
            .decode_payment_request(&payment_request)
            .await
            .map_err(|e| match e {
                e @ node_adapters::Error::InvalidPaymentRequest(_) => {
                    Error::Validation(e.to_string())
                }
                other => Error::Node(other),
            })?;

        let amount = match (decoded.amount_sat(), requested_amount) {
            (Some(encoded), Some(requested)) if encoded != requested => {
                return Err(Error::Validation(format!(
                    "requested amount {} differs from encoded amount {}",
                    requested, encoded
                )))
            }
            (Some(encoded), _) => encoded,
            (None, Some(requested)) => requested,
            (None, None) => {
                return Err(Error::Validation(
                    "zero-amount payment request needs an amount".into(),
                ))
            }
        };
        if decoded.is_expired(Utc::now()) {
            return Err(Error::Validation("payment request expired".into()));
        }

        let mut draft = Invoice::draft(InvoiceType::Outgoing, user_id, amount);
        draft.memo = decoded.description.clone();
        draft.description_hash = decoded.description_hash.map(hex::encode);
        draft.payment_request = Some(payment_request);
        draft.r_hash = Some(hex::encode(decoded.payment_hash));
        draft.destination_pubkey = Some(decoded.destination.clone());
        draft.expires_at = Some(decoded.expires_at());
        Ok(draft)
    }

    /// Reserve funds and pay.
    ///
    /// A definite node failure reverses the reservation and returns
    /// [`Error::PaymentFailed`]. An indeterminate one (connection loss,
    /// `pay_timeout_secs` elapsed) returns [`PaymentOutcome::Pending`].
    pub async fn pay_invoice(&self, invoice: &Invoice) -> Result<PaymentOutcome> {
        let invoice = self.ledger.invoice(invoice.id)?;
        if !invoice.is_pending_outgoing() {
            return Err(Error::NotPayable {
                invoice_id: invoice.id,
                state: invoice.state,
            });
        }
        if !self.ledger.entries_for_invoice(invoice.id)?.is_empty() {
            return Err(Error::Validation(format!(
                "invoice {} already has a payment attempt",
                invoice.id
            )));
        }

        let reserve = self.fees.fee_reserve(invoice.amount);
        let invoice = match self.reserve(&invoice, reserve) {
            Ok(invoice) => invoice,
            Err(Error::Ledger(ledger_core::Error::InsufficientBalance { .. })) => {
                let available = self.ledger.balance_of(invoice.user_id, AccountType::Current)?;
                let required = invoice.amount.saturating_add(reserve);
                self.fail_outgoing(invoice.id, "insufficient balance")?;
                PAYMENT_OUTCOMES_TOTAL
                    .with_label_values(&["insufficient_balance"])
                    .inc();
                return Err(Error::InsufficientBalance {
                    available,
                    required,
                });
            }
            Err(e) => return Err(e),
        };

        let request = PayRequest {
            target: payment_target(&invoice)?,
            amount_sat: invoice.amount,
            fee_limit_sat: self.fees.reserve_enabled.then_some(reserve),
            custom_records: invoice.custom_records.clone(),
        };

        let start = Instant::now();
        let call = self.node.pay_exact(&request);
        let result = match self.config.pay_timeout_secs {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), call)
                .await
                .unwrap_or_else(|_| {
                    Err(node_adapters::Error::Timeout {
                        seconds,
                        operation: "pay_exact".to_string(),
                    })
                }),
            None => call.await,
        };
        PAYMENT_DURATION.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                self.settle_outgoing(invoice.id, Some(response.preimage), response.fee_sat)?;
                self.resolved(invoice.id)
            }
            Err(e) if e.is_indeterminate() => {
                warn!(
                    invoice_id = invoice.id,
                    error = %e,
                    "Payment outcome unknown; left for reconciliation"
                );
                PAYMENT_OUTCOMES_TOTAL.with_label_values(&["pending"]).inc();
                Ok(PaymentOutcome::Pending(self.ledger.invoice(invoice.id)?))
            }
            Err(e) => {
                self.fail_outgoing(invoice.id, &e.to_string())?;
                self.resolved(invoice.id)
            }
        }
    }

    /// Reservation transaction. Re-checks the invoice under its lock so two
    /// concurrent callers cannot both reserve. Touching the invoice bumps
    /// `updated_at`, which the reconciler's safety window is measured from.
    fn reserve(&self, invoice: &Invoice, fee_reserve: i64) -> Result<Invoice> {
        let current = self.ledger.account_for(invoice.user_id, AccountType::Current)?;
        let outgoing = self.ledger.account_for(invoice.user_id, AccountType::Outgoing)?;

        let mut tx = self.ledger.begin();
        tx.lock_invoice(invoice.id)?;
        let invoice = tx.invoice(invoice.id)?;
        if !invoice.is_pending_outgoing() {
            return Err(Error::NotPayable {
                invoice_id: invoice.id,
                state: invoice.state,
            });
        }
        if !tx.entries_for_invoice(invoice.id)?.is_empty() {
            return Err(Error::Validation(format!(
                "invoice {} already has a payment attempt",
                invoice.id
            )));
        }
        let invoice = tx.update_invoice(invoice)?;
        tx.insert_entry(NewEntry {
            user_id: invoice.user_id,
            invoice_id: invoice.id,
            parent_id: None,
            debit_account_id: current.id,
            credit_account_id: outgoing.id,
            amount: invoice.amount,
            entry_type: EntryType::Outgoing,
        })?;
        if fee_reserve > 0 {
            let fees = self.ledger.account_for(invoice.user_id, AccountType::Fees)?;
            tx.insert_entry(NewEntry {
                user_id: invoice.user_id,
                invoice_id: invoice.id,
                parent_id: None,
                debit_account_id: current.id,
                credit_account_id: fees.id,
                amount: fee_reserve,
                entry_type: EntryType::FeeReserve,
            })?;
        }
        tx.commit()?;

        info!(
            invoice_id = invoice.id,
            amount = invoice.amount,
            fee_reserve,
            "Funds reserved"
        );
        Ok(invoice)
    }

    /// Map the stored invoice to the caller-facing result
    fn resolved(&self, invoice_id: InvoiceId) -> Result<PaymentOutcome> {
        let invoice = self.ledger.invoice(invoice_id)?;
        match invoice.state {
            InvoiceState::Settled => {
                PAYMENT_OUTCOMES_TOTAL.with_label_values(&["settled"]).inc();
                Ok(PaymentOutcome::Settled(invoice))
            }
            InvoiceState::Error => {
                PAYMENT_OUTCOMES_TOTAL.with_label_values(&["failed"]).inc();
                Err(Error::PaymentFailed {
                    invoice_id,
                    reason: invoice.error_message.unwrap_or_default(),
                })
            }
            _ => {
                PAYMENT_OUTCOMES_TOTAL.with_label_values(&["pending"]).inc();
                Ok(PaymentOutcome::Pending(invoice))
            }
        }
    }

    /// Apply a successful payment, if the invoice is still `initialized`.
    ///
    /// Releases the fee reserve, books the actual fee and marks the invoice
    /// `settled`. Returns `None` when another path already resolved it.
    pub fn settle_outgoing(
        &self,
        invoice_id: InvoiceId,
        preimage: Option<Hash32>,
        fee: i64,
    ) -> Result<Option<Invoice>> {
        let mut tx = self.ledger.begin();
        tx.lock_invoice(invoice_id)?;
        let mut invoice = tx.invoice(invoice_id)?;
        if !invoice.is_pending_outgoing() {
            return Ok(None);
        }

        let current = self.ledger.account_for(invoice.user_id, AccountType::Current)?;
        let entries = tx.entries_for_invoice(invoice_id)?;

        if !entries.iter().any(|e| e.entry_type == EntryType::Outgoing) {
            // Paid without a committed reservation: book it now
            let outgoing = self.ledger.account_for(invoice.user_id, AccountType::Outgoing)?;
            tx.insert_entry(NewEntry {
                user_id: invoice.user_id,
                invoice_id,
                parent_id: None,
                debit_account_id: current.id,
                credit_account_id: outgoing.id,
                amount: invoice.amount,
                entry_type: EntryType::Outgoing,
            })?;
        }
        for entry in unreversed(&entries) {
            if entry.entry_type == EntryType::FeeReserve {
                tx.insert_entry(entry.reversal())?;
            }
        }
        if fee > 0 {
            let fees = self.ledger.account_for(invoice.user_id, AccountType::Fees)?;
            tx.insert_entry(NewEntry {
                user_id: invoice.user_id,
                invoice_id,
                parent_id: None,
                debit_account_id: current.id,
                credit_account_id: fees.id,
                amount: fee,
                entry_type: EntryType::Fee,
            })?;
        }

        invoice.state = InvoiceState::Settled;
        invoice.fee = fee.max(0);
        if let Some(preimage) = preimage {
            invoice.preimage = Some(hex::encode(preimage));
        }
        invoice.settled_at = Some(Utc::now());
        let invoice = tx.update_invoice(invoice)?;

        commit_resolution(tx, invoice_id)?;

        INVOICES_SETTLED_TOTAL
            .with_label_values(&[InvoiceType::Outgoing.as_str()])
            .inc();
        info!(
            invoice_id,
            user_id = invoice.user_id,
            amount = invoice.amount,
            fee = invoice.fee,
            "Outgoing payment settled"
        );
        self.events.publish(OUTGOING_SETTLED, &invoice);
        Ok(Some(invoice))
    }

    /// Reverse every reservation of a failed payment, if the invoice is
    /// still `initialized`. Returns `None` when another path already
    /// resolved it.
    pub fn fail_outgoing(&self, invoice_id: InvoiceId, reason: &str) -> Result<Option<Invoice>> {
        let mut tx = self.ledger.begin();
        tx.lock_invoice(invoice_id)?;
        let mut invoice = tx.invoice(invoice_id)?;
        if !invoice.is_pending_outgoing() {
            return Ok(None);
        }

        let entries = tx.entries_for_invoice(invoice_id)?;
        for entry in unreversed(&entries) {
            tx.insert_entry(entry.reversal())?;
        }

        invoice.state = InvoiceState::Error;
        invoice.error_message = Some(reason.to_string());
        let invoice = tx.update_invoice(invoice)?;

        commit_resolution(tx, invoice_id)?;

        warn!(invoice_id, user_id = invoice.user_id, reason, "Outgoing payment failed");
        self.events.publish(OUTGOING_ERROR, &invoice);
        Ok(Some(invoice))
    }
}

fn commit_resolution(tx: LedgerTx<'_>, invoice_id: InvoiceId) -> Result<()> {
    match tx.commit() {
        Ok(_) => Ok(()),
        Err(e @ ledger_core::Error::InsufficientBalance { .. }) => {
            error!(
                invoice_id,
                error = %e,
                "Payment resolution rejected by balance check; needs operator attention"
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Entries that are neither reversals nor already reversed
fn unreversed(entries: &[TransactionEntry]) -> Vec<&TransactionEntry> {
    let reversed: HashSet<_> = entries.iter().filter_map(|e| e.parent_id).collect();
    entries
        .iter()
        .filter(|e| !e.entry_type.is_reversal() && !reversed.contains(&e.id))
        .collect()
}

fn draft_for_keysend(
    user_id: UserId,
    destination: String,
    custom_records: BTreeMap<u64, Vec<u8>>,
    requested_amount: Option<i64>,
) -> Result<Invoice> {
    let amount = requested_amount
        .ok_or_else(|| Error::Validation("keysend needs an amount".into()))?;
    match hex::decode(&destination) {
        Ok(bytes) if bytes.len() == 33 => {}
        _ => {
            return Err(Error::Validation(format!(
                "invalid destination pubkey {}",
                destination
            )))
        }
    }

    let preimage = random_preimage();
    let mut draft = Invoice::draft(InvoiceType::Outgoing, user_id, amount);
    draft.keysend = true;
    draft.destination_pubkey = Some(destination);
    draft.custom_records = custom_records;
    draft.preimage = Some(hex::encode(preimage));
    draft.r_hash = Some(hex::encode(payment_hash(&preimage)));
    Ok(draft)
}

fn payment_target(invoice: &Invoice) -> Result<PaymentTarget> {
    if invoice.keysend {
        let destination = invoice
            .destination_pubkey
            .clone()
            .ok_or_else(|| Error::Validation("keysend invoice without destination".into()))?;
        let preimage = parse_hash(invoice.preimage.as_deref().unwrap_or_default())?;
        Ok(PaymentTarget::Keysend {
            destination,
            preimage,
        })
    } else {
        invoice
            .payment_request
            .clone()
            .map(PaymentTarget::PaymentRequest)
            .ok_or_else(|| Error::Validation("invoice without payment request".into()))
    }
}

/// Decode a hex payment hash / preimage
pub(crate) fn parse_hash(value: &str) -> Result<Hash32> {
    hex::decode(value)
        .ok()
        .and_then(|bytes| Hash32::try_from(bytes).ok())
        .ok_or_else(|| Error::Validation(format!("invalid 32-byte hex value {:?}", value)))
}
