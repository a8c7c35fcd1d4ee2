//! Node client interface

use crate::{types::*, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of incoming-invoice updates
pub type InvoiceUpdateStream = BoxStream<'static, Result<InvoiceUpdate>>;

/// Lightning node capability set.
///
/// Single nodes, the liveness cluster and stub backends all implement this,
/// so the life-cycle managers never know which one is active.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Register an incoming invoice
    async fn add_invoice(&self, request: &AddInvoiceRequest) -> Result<AddInvoiceResponse>;

    /// Pay and wait for the outcome; may block for the lifetime of the payment
    async fn pay_exact(&self, request: &PayRequest) -> Result<PayResponse>;

    /// Incoming-invoice updates with `add_index > from_add_index`
    async fn subscribe_invoices(&self, from_add_index: u64) -> Result<InvoiceUpdateStream>;

    /// Point-in-time status of an outgoing payment
    async fn track_payment(&self, r_hash: &Hash32) -> Result<PaymentTrack>;

    /// Node identity and channel counts
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Decode a BOLT11 payment request
    async fn decode_payment_request(&self, payment_request: &str)
        -> Result<DecodedPaymentRequest>;

    /// Get client name
    fn name(&self) -> &str;
}
