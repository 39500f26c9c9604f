//! Wallet providers - one contract over three very different backends
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │   dyn WalletProvider     │  balance · info · invoices · history
//!                 └────────────┬─────────────┘
//!          ┌───────────────────┼────────────────────┐
//!   ┌──────┴──────┐     ┌──────┴──────┐      ┌──────┴──────┐
//!   │    Spark    │     │     NWC     │      │   LNBits    │
//!   │ self-custody│     │remote-control│     │   hosted    │
//!   │  SparkSdk   │     │ NwcTransport │     │  REST+JSON  │
//!   └─────────────┘     └─────────────┘      └─────────────┘
//! ```
//!
//! Each backend speaks its own dialect (status strings, timestamp units, msat vs
//! sat). Providers translate into the records below before anything leaves the
//! module: amounts are whole sats, timestamps are unix seconds, direction lives
//! in [`Direction`] and never in a sign.
//!
//! Two queries are infallible by signature: [`WalletProvider::lookup_invoice`]
//! and [`WalletProvider::get_transactions`]. The payment monitor and history
//! views depend on them degrading to "not paid" and "empty" instead of failing.

pub mod lnbits;
pub mod nwc;
pub mod spark;

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::WalletResult;

pub use lnbits::{LnbitsConnection, LnbitsProvider, ValidatedLnbits};
pub use nwc::{NwcConnection, NwcConnector, NwcProvider, NwcTransport, NwcUri};
pub use spark::{SparkConnection, SparkConnector, SparkNetwork, SparkProvider, SparkSdk};

// =============================================================================
// Identity
// =============================================================================

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    Spark,
    Nwc,
    Lnbits,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Spark => "spark",
            WalletKind::Nwc => "nwc",
            WalletKind::Lnbits => "lnbits",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "spark" => Some(WalletKind::Spark),
            "nwc" => Some(WalletKind::Nwc),
            "lnbits" => Some(WalletKind::Lnbits),
            _ => None,
        }
    }
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WalletKind::Spark => "Spark",
            WalletKind::Nwc => "NWC",
            WalletKind::Lnbits => "LNBits",
        })
    }
}

// =============================================================================
// Connection state
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error: Option<String>,
}

/// Interior-mutable connection flag + last error, shared by all providers.
#[derive(Debug, Default)]
pub struct ConnectionCell(Mutex<ConnectionStatus>);

impl ConnectionCell {
    pub fn status(&self) -> ConnectionStatus {
        self.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn set_connected(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.error = None;
    }

    pub fn set_disconnected(&self) {
        self.lock().connected = false;
    }

    /// Records the error and drops the connected flag.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.lock();
        state.connected = false;
        state.error = Some(message.into());
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionStatus> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Normalized records
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub balance: u64,
    pub pending: u64,
}

/// Backend-dependent fields are `None` where the concept does not apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub alias: Option<String>,
    pub color: Option<String>,
    pub pubkey: Option<String>,
    pub lightning_address: Option<String>,
    pub spark_address: Option<String>,
    pub network: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    /// 0 means "any amount"
    pub amount: u64,
    pub description: Option<String>,
    /// Seconds
    pub expiry: Option<u64>,
}

impl CreateInvoiceRequest {
    pub fn new(amount: u64) -> Self {
        Self { amount, ..Default::default() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_expiry(mut self, secs: u64) -> Self {
        self.expiry = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_request: String,
    pub payment_hash: String,
    pub id: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayInvoiceRequest {
    pub invoice: String,
    /// Advisory upper bound in sats
    pub max_fee: Option<u64>,
    /// Only meaningful for zero-amount invoices
    pub amount_sats: Option<u64>,
}

impl PayInvoiceRequest {
    pub fn new(invoice: impl Into<String>) -> Self {
        Self { invoice: invoice.into(), ..Default::default() }
    }

    pub fn with_max_fee(mut self, sats: u64) -> Self {
        self.max_fee = Some(sats);
        self
    }

    pub fn with_amount(mut self, sats: u64) -> Self {
        self.amount_sats = Some(sats);
        self
    }
}

/// Canonical tri-state every backend vocabulary folds into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Option<String>,
    pub payment_hash: Option<String>,
    pub preimage: Option<String>,
    pub fee: u64,
    pub status: PaymentStatus,
}

impl Payment {
    /// Best identifier for annotating the resulting transaction.
    pub fn reference(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.payment_hash.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLookup {
    pub paid: bool,
    pub preimage: Option<String>,
    pub amount: Option<u64>,
}

impl InvoiceLookup {
    pub fn not_paid() -> Self {
        Self::default()
    }

    pub fn paid(preimage: Option<String>, amount: Option<u64>) -> Self {
        Self { paid: true, preimage, amount }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "receive", alias = "incoming")]
    Receive,
    #[serde(rename = "send", alias = "outgoing")]
    Send,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Receive => "receive",
            Direction::Send => "send",
        }
    }
}

/// One history entry. `amount` is never negative; direction carries the sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub direction: Direction,
    pub amount: u64,
    /// Unix seconds of settlement (creation when unsettled)
    pub timestamp: i64,
    #[serde(default)]
    pub description: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_npub: Option<String>,
}

impl TransactionRecord {
    pub fn new(id: impl Into<String>, direction: Direction, amount: u64, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            direction,
            amount,
            timestamp,
            description: String::new(),
            status: PaymentStatus::Completed,
            fee: 0,
            payment_hash: None,
            payment_request: None,
            sender_npub: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: PaymentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_payment_hash(mut self, hash: impl Into<String>) -> Self {
        self.payment_hash = Some(hash.into());
        self
    }

    pub fn with_sender_npub(mut self, npub: impl Into<String>) -> Self {
        self.sender_npub = Some(npub.into());
        self
    }
}

// =============================================================================
// Optional capabilities
// =============================================================================

/// Confirmation tier for on-chain withdrawals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Slow,
    Medium,
    Fast,
}

impl FeeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeTier::Slow => "slow",
            FeeTier::Medium => "medium",
            FeeTier::Fast => "fast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount: Option<u64>,
    pub confirmations: u32,
    pub claimable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimQuote {
    pub txid: String,
    pub vout: u32,
    pub credit_amount_sats: u64,
    pub signature: String,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed { transfer_id: Option<String> },
    /// Another claim for the same output is already running and will finish it
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierQuote {
    pub service_fee: u64,
    pub network_fee: u64,
    pub total: u64,
    /// sat/vB observed for this tier
    pub fee_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalQuote {
    pub id: String,
    pub amount: u64,
    pub expires_at: Option<i64>,
    pub slow: TierQuote,
    pub medium: TierQuote,
    pub fast: TierQuote,
}

impl WithdrawalQuote {
    pub fn tier(&self, tier: FeeTier) -> &TierQuote {
        match tier {
            FeeTier::Slow => &self.slow,
            FeeTier::Medium => &self.medium,
            FeeTier::Fast => &self.fast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub address: String,
    pub amount: u64,
    pub tier: FeeTier,
    pub quote_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub status: PaymentStatus,
}

/// Static-address deposits and L1 withdrawals.
#[async_trait]
pub trait OnchainWallet: Send + Sync {
    async fn deposit_address(&self) -> WalletResult<String>;
    async fn pending_deposits(&self) -> WalletResult<Vec<DepositUtxo>>;
    async fn quote_deposit_claim(&self, txid: &str, vout: u32) -> WalletResult<ClaimQuote>;
    async fn claim_deposit(&self, quote: &ClaimQuote) -> WalletResult<ClaimOutcome>;
    async fn withdrawal_fee_quote(&self, address: &str, amount: u64) -> WalletResult<WithdrawalQuote>;
    async fn withdraw(&self, request: WithdrawRequest) -> WalletResult<Withdrawal>;
}

/// Zero-fee address-to-address transfers and Lightning-address payments.
#[async_trait]
pub trait SparkTransfers: Send + Sync {
    async fn spark_address(&self) -> WalletResult<String>;
    async fn transfer_to_spark_address(&self, address: &str, amount: u64) -> WalletResult<Payment>;
    async fn pay_lightning_address(
        &self,
        address: &str,
        amount: u64,
        comment: Option<&str>,
    ) -> WalletResult<Payment>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub payment_hash: String,
    pub amount: u64,
    pub preimage: Option<String>,
    pub settled_at: Option<i64>,
}

/// Push notifications for incoming payments.
#[async_trait]
pub trait PaymentNotifications: Send + Sync {
    async fn subscribe_payment_received(&self) -> WalletResult<mpsc::Receiver<PaymentReceived>>;
}

// =============================================================================
// Contract
// =============================================================================

#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn wallet_id(&self) -> &str;
    fn kind(&self) -> WalletKind;
    fn connection_status(&self) -> ConnectionStatus;

    /// Idempotent; no-op when already connected.
    async fn connect(&self) -> WalletResult<()>;

    /// Always clears in-memory session state; backend teardown errors are logged, not returned.
    async fn disconnect(&self);

    /// Records the failure on the connection cell before returning it.
    async fn get_balance(&self) -> WalletResult<Balance>;
    async fn get_info(&self) -> WalletResult<WalletInfo>;
    async fn create_invoice(&self, request: CreateInvoiceRequest) -> WalletResult<Invoice>;
    async fn pay_invoice(&self, request: PayInvoiceRequest) -> WalletResult<Payment>;

    /// Unknown hashes and backend failures resolve to `paid: false`.
    async fn lookup_invoice(&self, payment_hash: &str) -> InvoiceLookup;

    /// Best effort; backend failures resolve to an empty list.
    async fn get_transactions(&self, page: Page) -> Vec<TransactionRecord>;

    fn is_connected(&self) -> bool {
        self.connection_status().connected
    }

    fn onchain(&self) -> Option<&dyn OnchainWallet> {
        None
    }

    fn spark_transfers(&self) -> Option<&dyn SparkTransfers> {
        None
    }

    fn notifications(&self) -> Option<&dyn PaymentNotifications> {
        None
    }
}

/// Self-custodial addresses are bech32m with an `sp1`/`tsp1` prefix.
pub fn is_spark_address(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    lower.starts_with("sp1") || lower.starts_with("tsp1")
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// msat → sat, floor.
pub(crate) fn msat_to_sat(msat: i64) -> u64 {
    msat.unsigned_abs() / 1000
}
