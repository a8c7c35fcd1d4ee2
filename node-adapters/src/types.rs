//! Request/response types of the node capability surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// 32-byte payment preimage / hash, hex encoded on the wire
pub type Hash32 = [u8; 32];

/// Payment hash of a preimage
pub fn payment_hash(preimage: &Hash32) -> Hash32 {
    Sha256::digest(preimage).into()
}

/// Fresh random preimage
pub fn random_preimage() -> Hash32 {
    rand::random()
}

/// AddInvoice request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddInvoiceRequest {
    /// Amount in satoshis (0 = any amount)
    pub amount_sat: i64,
    /// Memo
    pub memo: String,
    /// Description hash, if any
    pub description_hash: Option<Hash32>,
    /// Hub-generated preimage
    pub preimage: Hash32,
    /// Expiry in seconds
    pub expiry_secs: u64,
}

/// AddInvoice response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddInvoiceResponse {
    /// BOLT11 payment request
    pub payment_request: String,
    /// Payment hash
    pub r_hash: Hash32,
    /// Subscription cursor of the new invoice
    pub add_index: u64,
}

/// What a payment pays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentTarget {
    /// A BOLT11 payment request
    PaymentRequest(String),
    /// Spontaneous payment to a node
    Keysend {
        /// Destination node pubkey (hex)
        destination: String,
        /// Preimage chosen by the payer
        preimage: Hash32,
    },
}

/// PayExact request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRequest {
    /// Target
    pub target: PaymentTarget,
    /// Amount in satoshis
    pub amount_sat: i64,
    /// Maximum routing fee the hub is willing to pay
    pub fee_limit_sat: Option<i64>,
    /// TLV custom records
    pub custom_records: BTreeMap<u64, Vec<u8>>,
}

/// PayExact success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayResponse {
    /// Proof of payment
    pub preimage: Hash32,
    /// Routing fee actually paid
    pub fee_sat: i64,
    /// Hops taken (pubkeys)
    pub route: Vec<String>,
}

/// Node-side state of an incoming invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceUpdateState {
    /// Created, not paid
    Open,
    /// HTLCs accepted but not settled (HODL)
    Accepted,
    /// Paid
    Settled,
    /// Cancelled or expired
    Canceled,
}

/// One item of the invoice subscription stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceUpdate {
    /// Payment hash
    pub r_hash: Hash32,
    /// Node-side state
    pub state: InvoiceUpdateState,
    /// Settled flag
    pub settled: bool,
    /// Amount actually paid
    pub amount_paid_sat: i64,
    /// Settlement time
    pub settle_date: Option<DateTime<Utc>>,
    /// Subscription cursor
    pub add_index: u64,
}

impl InvoiceUpdate {
    /// Whether this update reports a completed settlement
    pub fn is_settled(&self) -> bool {
        self.settled && self.state == InvoiceUpdateState::Settled
    }
}

/// Status reported by TrackPayment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Completed
    Succeeded,
    /// Definitely failed
    Failed,
    /// Still being routed
    InFlight,
}

/// TrackPayment response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTrack {
    /// Status
    pub status: PaymentStatus,
    /// Fee paid (succeeded only)
    pub fee_sat: i64,
    /// Preimage (succeeded only)
    pub preimage: Option<Hash32>,
    /// Failure reason (failed only)
    pub failure_reason: Option<String>,
}

/// GetInfo response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node pubkey (hex)
    pub identity_pubkey: String,
    /// Alias
    pub alias: String,
    /// Active channels
    pub num_active_channels: u32,
    /// Pending channels
    pub num_pending_channels: u32,
    /// Inactive channels
    pub num_inactive_channels: u32,
    /// Public URIs
    pub uris: Vec<String>,
    /// Best block height
    pub block_height: u32,
    /// Synced to chain
    pub synced_to_chain: bool,
}

impl NodeInfo {
    /// Fraction of channels that are active; 0 when the node has none
    pub fn active_channel_ratio(&self) -> f64 {
        let total = self.num_active_channels as u64
            + self.num_pending_channels as u64
            + self.num_inactive_channels as u64;
        if total == 0 {
            0.0
        } else {
            self.num_active_channels as f64 / total as f64
        }
    }
}

/// DecodePaymentRequest response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPaymentRequest {
    /// Payee node pubkey (hex)
    pub destination: String,
    /// Payment hash
    pub payment_hash: Hash32,
    /// Amount in millisatoshis (0 = any amount)
    pub amount_msat: i64,
    /// Description
    pub description: String,
    /// Description hash, if any
    pub description_hash: Option<Hash32>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Expiry in seconds from `timestamp`
    pub expiry_secs: u64,
}

impl DecodedPaymentRequest {
    /// Encoded amount in whole satoshis, if any
    pub fn amount_sat(&self) -> Option<i64> {
        (self.amount_msat > 0).then(|| self.amount_msat / 1000)
    }

    /// Expiry time
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::seconds(self.expiry_secs as i64)
    }

    /// Whether the request has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}
