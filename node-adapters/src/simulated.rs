//! In-memory node backend
//!
//! Behaves like a single Lightning node with scriptable payment outcomes.
//! Used by the `simulated` backend of the hub server and by tests.

use crate::{connector::*, types::*, Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

/// Outcome of a `pay_exact` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayOutcome {
    /// Payment succeeds with the given routing fee
    Succeed {
        /// Routing fee
        fee_sat: i64,
    },
    /// Payment definitely fails
    Fail(String),
    /// Call blocks until [`SimulatedNode::release`]; tracked as in flight meanwhile
    Hold,
    /// Node completes the payment but the call errors (connection lost)
    SucceedSilently {
        /// Routing fee
        fee_sat: i64,
    },
    /// Call errors and the node never learns of the payment
    Vanish,
}

#[derive(Debug, Clone)]
enum StreamEvent {
    Update(InvoiceUpdate),
    Fail(String),
}

#[derive(Debug, Clone)]
struct SimInvoice {
    amount_sat: i64,
    add_index: u64,
    settled: bool,
}

#[derive(Debug)]
struct State {
    info: NodeInfo,
    unreachable: bool,
    invoices: HashMap<Hash32, SimInvoice>,
    updates: Vec<InvoiceUpdate>,
    next_add_index: u64,
    outcomes: VecDeque<PayOutcome>,
    default_outcome: PayOutcome,
    payments: HashMap<Hash32, PaymentTrack>,
    held: HashMap<Hash32, oneshot::Sender<PayOutcome>>,
    requests: HashMap<String, (DecodedPaymentRequest, Hash32)>,
}

/// Simulated Lightning node
pub struct SimulatedNode {
    name: String,
    state: Mutex<State>,
    stream: broadcast::Sender<StreamEvent>,
    pay_calls: AtomicUsize,
}

impl std::fmt::Debug for SimulatedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNode")
            .field("name", &self.name)
            .field("pay_calls", &self.pay_calls.load(Ordering::Relaxed))
            .finish()
    }
}

impl SimulatedNode {
    /// Node with one active channel that pays everything for free
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (stream, _) = broadcast::channel(1024);
        let info = NodeInfo {
            identity_pubkey: format!("02{}", hex::encode(payment_hash(&[0u8; 32]))),
            alias: name.clone(),
            num_active_channels: 1,
            synced_to_chain: true,
            ..Default::default()
        };
        Self {
            name,
            state: Mutex::new(State {
                info,
                unreachable: false,
                invoices: HashMap::new(),
                updates: Vec::new(),
                next_add_index: 1,
                outcomes: VecDeque::new(),
                default_outcome: PayOutcome::Succeed { fee_sat: 0 },
                payments: HashMap::new(),
                held: HashMap::new(),
                requests: HashMap::new(),
            }),
            stream,
            pay_calls: AtomicUsize::new(0),
        }
    }

    /// Set what `get_info` reports
    pub fn set_info(&self, info: NodeInfo) {
        self.state.lock().info = info;
    }

    /// Make `get_info` fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Queue the outcome of the next `pay_exact` call
    pub fn push_outcome(&self, outcome: PayOutcome) {
        self.state.lock().outcomes.push_back(outcome);
    }

    /// Outcome used once the queue is empty
    pub fn set_default_outcome(&self, outcome: PayOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    /// Make `payment_request` decodable; paying it reveals `preimage`
    pub fn register_payment_request(
        &self,
        payment_request: impl Into<String>,
        decoded: DecodedPaymentRequest,
        preimage: Hash32,
    ) {
        self.state
            .lock()
            .requests
            .insert(payment_request.into(), (decoded, preimage));
    }

    /// Resolve a held payment; returns false if nothing was held
    pub fn release(&self, r_hash: &Hash32, outcome: PayOutcome) -> bool {
        match self.state.lock().held.remove(r_hash) {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Record a payment outcome directly, as if learned by the node
    pub fn set_payment_status(&self, r_hash: Hash32, track: PaymentTrack) {
        self.state.lock().payments.insert(r_hash, track);
    }

    /// Mark an invoice paid and emit the settled update
    pub fn settle_invoice(&self, r_hash: &Hash32) -> Result<InvoiceUpdate> {
        let mut state = self.state.lock();
        let invoice = state
            .invoices
            .get_mut(r_hash)
            .ok_or_else(|| Error::Rpc(format!("unknown invoice {}", hex::encode(r_hash))))?;
        if invoice.settled {
            return Err(Error::Rpc("invoice already settled".to_string()));
        }
        invoice.settled = true;
        let update = InvoiceUpdate {
            r_hash: *r_hash,
            state: InvoiceUpdateState::Settled,
            settled: true,
            amount_paid_sat: invoice.amount_sat,
            settle_date: Some(Utc::now()),
            add_index: invoice.add_index,
        };
        state.updates.push(update.clone());
        drop(state);

        let _ = self.stream.send(StreamEvent::Update(update.clone()));
        Ok(update)
    }

    /// Emit an arbitrary update (e.g. a duplicate delivery)
    pub fn emit_update(&self, update: InvoiceUpdate) {
        let _ = self.stream.send(StreamEvent::Update(update));
    }

    /// Break every open invoice stream with an error
    pub fn fail_invoice_streams(&self, reason: impl Into<String>) {
        let _ = self.stream.send(StreamEvent::Fail(reason.into()));
    }

    /// Whether the node knows an invoice
    pub fn has_invoice(&self, r_hash: &Hash32) -> bool {
        self.state.lock().invoices.contains_key(r_hash)
    }

    /// Number of `pay_exact` calls received
    pub fn pay_calls(&self) -> usize {
        self.pay_calls.load(Ordering::SeqCst)
    }

    /// Number of payments currently held
    pub fn held_payments(&self) -> usize {
        self.state.lock().held.len()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.state.lock().unreachable {
            return Err(Error::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    fn resolve_target(&self, target: &PaymentTarget) -> Result<(Hash32, Hash32)> {
        match target {
            PaymentTarget::Keysend { preimage, .. } => Ok((payment_hash(preimage), *preimage)),
            PaymentTarget::PaymentRequest(text) => {
                let state = self.state.lock();
                let (decoded, preimage) = state
                    .requests
                    .get(text)
                    .ok_or_else(|| Error::InvalidPaymentRequest(text.clone()))?;
                Ok((decoded.payment_hash, *preimage))
            }
        }
    }

    fn record(&self, r_hash: Hash32, outcome: &PayOutcome, preimage: Hash32) {
        let track = match outcome {
            PayOutcome::Succeed { fee_sat } | PayOutcome::SucceedSilently { fee_sat } => {
                PaymentTrack {
                    status: PaymentStatus::Succeeded,
                    fee_sat: *fee_sat,
                    preimage: Some(preimage),
                    failure_reason: None,
                }
            }
            PayOutcome::Fail(reason) => PaymentTrack {
                status: PaymentStatus::Failed,
                fee_sat: 0,
                preimage: None,
                failure_reason: Some(reason.clone()),
            },
            PayOutcome::Hold => PaymentTrack {
                status: PaymentStatus::InFlight,
                fee_sat: 0,
                preimage: None,
                failure_reason: None,
            },
            PayOutcome::Vanish => return,
        };
        self.state.lock().payments.insert(r_hash, track);
    }

    fn respond(outcome: PayOutcome, preimage: Hash32) -> Result<PayResponse> {
        match outcome {
            PayOutcome::Succeed { fee_sat } => Ok(PayResponse {
                preimage,
                fee_sat,
                route: Vec::new(),
            }),
            PayOutcome::Fail(reason) => Err(Error::PaymentFailed(reason)),
            PayOutcome::SucceedSilently { .. } | PayOutcome::Vanish | PayOutcome::Hold => {
                Err(Error::Rpc("connection reset by peer".to_string()))
            }
        }
    }
}

#[async_trait]
impl NodeClient for SimulatedNode {
    async fn add_invoice(&self, request: &AddInvoiceRequest) -> Result<AddInvoiceResponse> {
        self.ensure_reachable()?;
        let r_hash = payment_hash(&request.preimage);
        let payment_request = format!("lnsim{}1{}", request.amount_sat, hex::encode(r_hash));

        let mut state = self.state.lock();
        if state.invoices.contains_key(&r_hash) {
            return Err(Error::Rpc("invoice with that preimage already exists".to_string()));
        }
        let add_index = state.next_add_index;
        state.next_add_index += 1;
        state.invoices.insert(
            r_hash,
            SimInvoice {
                amount_sat: request.amount_sat,
                add_index,
                settled: false,
            },
        );
        let decoded = DecodedPaymentRequest {
            destination: state.info.identity_pubkey.clone(),
            payment_hash: r_hash,
            amount_msat: request.amount_sat * 1000,
            description: request.memo.clone(),
            description_hash: request.description_hash,
            timestamp: Utc::now(),
            expiry_secs: request.expiry_secs,
        };
        state
            .requests
            .insert(payment_request.clone(), (decoded, request.preimage));
        let update = InvoiceUpdate {
            r_hash,
            state: InvoiceUpdateState::Open,
            settled: false,
            amount_paid_sat: 0,
            settle_date: None,
            add_index,
        };
        state.updates.push(update.clone());
        drop(state);

        let _ = self.stream.send(StreamEvent::Update(update));
        debug!(node = %self.name, add_index, "Invoice added");

        Ok(AddInvoiceResponse {
            payment_request,
            r_hash,
            add_index,
        })
    }

    async fn pay_exact(&self, request: &PayRequest) -> Result<PayResponse> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;
        let (r_hash, preimage) = self.resolve_target(&request.target)?;

        let outcome = {
            let mut state = self.state.lock();
            match state.outcomes.pop_front() {
                Some(outcome) => outcome,
                None => state.default_outcome.clone(),
            }
        };
        self.record(r_hash, &outcome, preimage);

        if outcome != PayOutcome::Hold {
            return Self::respond(outcome, preimage);
        }

        let (sender, receiver) = oneshot::channel();
        self.state.lock().held.insert(r_hash, sender);
        debug!(node = %self.name, r_hash = %hex::encode(r_hash), "Payment held");

        match receiver.await {
            Ok(outcome) => {
                self.record(r_hash, &outcome, preimage);
                Self::respond(outcome, preimage)
            }
            Err(_) => Err(Error::Rpc("held payment abandoned".to_string())),
        }
    }

    async fn subscribe_invoices(&self, from_add_index: u64) -> Result<InvoiceUpdateStream> {
        self.ensure_reachable()?;
        // Subscribe before snapshotting the backlog so nothing falls in between
        let live = BroadcastStream::new(self.stream.subscribe());
        let backlog: Vec<Result<InvoiceUpdate>> = self
            .state
            .lock()
            .updates
            .iter()
            .filter(|update| update.add_index > from_add_index)
            .cloned()
            .map(Ok)
            .collect();

        let live = live.map(|item| match item {
            Ok(StreamEvent::Update(update)) => Ok(update),
            Ok(StreamEvent::Fail(reason)) => Err(Error::StreamClosed(reason)),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Err(Error::StreamClosed(format!("subscriber lagged by {}", missed)))
            }
        });

        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }

    async fn track_payment(&self, r_hash: &Hash32) -> Result<PaymentTrack> {
        self.ensure_reachable()?;
        self.state
            .lock()
            .payments
            .get(r_hash)
            .cloned()
            .ok_or_else(|| Error::PaymentNotFound(hex::encode(r_hash)))
    }

    async fn get_info(&self) -> Result<NodeInfo> {
        self.ensure_reachable()?;
        Ok(self.state.lock().info.clone())
    }

    async fn decode_payment_request(
        &self,
        payment_request: &str,
    ) -> Result<DecodedPaymentRequest> {
        self.state
            .lock()
            .requests
            .get(payment_request)
            .map(|(decoded, _)| decoded.clone())
            .ok_or_else(|| Error::InvalidPaymentRequest(payment_request.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn keysend(preimage: Hash32) -> PayRequest {
        PayRequest {
            target: PaymentTarget::Keysend {
                destination: "02bb".to_string(),
                preimage,
            },
            amount_sat: 100,
            fee_limit_sat: None,
            custom_records: Default::default(),
        }
    }

    fn add_request(preimage: Hash32) -> AddInvoiceRequest {
        AddInvoiceRequest {
            amount_sat: 250,
            memo: "coffee".to_string(),
            description_hash: None,
            preimage,
            expiry_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_add_invoice_is_decodable() {
        let node = SimulatedNode::new("sim");
        let response = node.add_invoice(&add_request([1u8; 32])).await.unwrap();

        assert_eq!(response.add_index, 1);
        assert_eq!(response.r_hash, payment_hash(&[1u8; 32]));

        let decoded = node
            .decode_payment_request(&response.payment_request)
            .await
            .unwrap();
        assert_eq!(decoded.amount_sat(), Some(250));
        assert_eq!(decoded.payment_hash, response.r_hash);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let node = SimulatedNode::new("sim");
        node.push_outcome(PayOutcome::Succeed { fee_sat: 3 });
        node.push_outcome(PayOutcome::Fail("no route".to_string()));

        let ok = node.pay_exact(&keysend([1u8; 32])).await.unwrap();
        assert_eq!(ok.fee_sat, 3);
        assert_eq!(ok.preimage, [1u8; 32]);

        let err = node.pay_exact(&keysend([2u8; 32])).await.unwrap_err();
        assert_eq!(err, Error::PaymentFailed("no route".to_string()));

        let track = node.track_payment(&payment_hash(&[2u8; 32])).await.unwrap();
        assert_eq!(track.status, PaymentStatus::Failed);
        assert_eq!(node.pay_calls(), 2);
    }

    #[tokio::test]
    async fn test_vanished_payment_unknown() {
        let node = SimulatedNode::new("sim");
        node.push_outcome(PayOutcome::Vanish);

        let err = node.pay_exact(&keysend([4u8; 32])).await.unwrap_err();
        assert!(err.is_indeterminate());
        assert!(matches!(
            node.track_payment(&payment_hash(&[4u8; 32])).await,
            Err(Error::PaymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hold_until_released() {
        let node = Arc::new(SimulatedNode::new("sim"));
        node.push_outcome(PayOutcome::Hold);
        let r_hash = payment_hash(&[5u8; 32]);

        let pay = tokio::spawn({
            let node = node.clone();
            async move { node.pay_exact(&keysend([5u8; 32])).await }
        });

        while node.held_payments() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            node.track_payment(&r_hash).await.unwrap().status,
            PaymentStatus::InFlight
        );

        assert!(node.release(&r_hash, PayOutcome::Succeed { fee_sat: 1 }));
        let response = pay.await.unwrap().unwrap();
        assert_eq!(response.fee_sat, 1);
        assert_eq!(
            node.track_payment(&r_hash).await.unwrap().status,
            PaymentStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_subscription_replays_then_streams() {
        let node = SimulatedNode::new("sim");
        let first = node.add_invoice(&add_request([1u8; 32])).await.unwrap();
        let second = node.add_invoice(&add_request([2u8; 32])).await.unwrap();

        let mut stream = node.subscribe_invoices(1).await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.add_index, second.add_index);

        node.settle_invoice(&first.r_hash).unwrap();
        let settled = stream.next().await.unwrap().unwrap();
        assert!(settled.is_settled());
        assert_eq!(settled.r_hash, first.r_hash);

        node.fail_invoice_streams("node restarted");
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(Error::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let node = SimulatedNode::new("sim");
        node.set_unreachable(true);
        assert!(matches!(node.get_info().await, Err(Error::Unavailable(_))));
    }
}
