//! Self-custodial provider
//!
//! The signing SDK is an opaque remote service reached through [`SparkSdk`].
//! This module owns everything around it: session lifecycle, fee policy,
//! zero-amount invoice handling, status/direction normalization, and the
//! on-chain deposit/withdraw sub-protocol.
//!
//! The decrypted mnemonic lives only in a `Zeroizing<String>` for the lifetime
//! of the session and is dropped on disconnect.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use super::{
    is_spark_address, now_secs, Balance, ClaimOutcome, ClaimQuote, ConnectionCell,
    ConnectionStatus, CreateInvoiceRequest, DepositUtxo, Direction, FeeTier, Invoice,
    InvoiceLookup, OnchainWallet, Page, PayInvoiceRequest, Payment, PaymentStatus,
    SparkTransfers, TierQuote, TransactionRecord, WalletInfo, WalletKind, WalletProvider,
    Withdrawal, WithdrawalQuote, WithdrawRequest,
};
use crate::config::{FeePolicy, PaymentWait};
use crate::error::{WalletError, WalletResult};
use crate::explorer::ChainData;
use crate::lnurl::{check_invoice_amount, LightningAddressResolver};

const DEFAULT_INVOICE_EXPIRY_SECS: u64 = 3600;
const LOOKUP_TRANSFER_SCAN: usize = 100;
const CLAIM_IN_PROGRESS_CODE: &str = "transfer_locked";

// =============================================================================
// Backend seam
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SparkNetwork {
    #[default]
    Mainnet,
    Regtest,
    Testnet,
    Signet,
}

impl SparkNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            SparkNetwork::Mainnet => "MAINNET",
            SparkNetwork::Regtest => "REGTEST",
            SparkNetwork::Testnet => "TESTNET",
            SparkNetwork::Signet => "SIGNET",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MAINNET" | "BITCOIN" => Some(SparkNetwork::Mainnet),
            "REGTEST" => Some(SparkNetwork::Regtest),
            "TESTNET" => Some(SparkNetwork::Testnet),
            "SIGNET" => Some(SparkNetwork::Signet),
            _ => None,
        }
    }
}

/// Stored connection parameters (the seed itself lives encrypted in the wallet record).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkConnection {
    pub network: SparkNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkInvoiceRequest {
    pub amount_sats: u64,
    pub memo: Option<String>,
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkPayRequest {
    pub invoice: String,
    pub max_fee_sats: u64,
    /// Set only for zero-amount invoices
    pub amount_sats_to_send: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdkReceiveRequest {
    pub id: String,
    pub invoice: String,
    pub payment_hash: String,
    pub status: String,
    pub amount_sats: u64,
    pub expires_at: Option<i64>,
    pub preimage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdkSendRequest {
    pub id: String,
    pub status: String,
    pub payment_hash: Option<String>,
    pub preimage: Option<String>,
    pub fee_sats: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdkTransfer {
    pub id: String,
    pub status: Option<String>,
    /// `INCOMING` / `OUTGOING`
    pub direction: Option<String>,
    /// Legacy type field (`LIGHTNING_RECEIVE`, `SPARK_SEND`, ...)
    pub transfer_type: Option<String>,
    pub amount_sats: i64,
    /// Seconds or milliseconds, depending on SDK version
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub payment_hash: Option<String>,
    pub memo: Option<String>,
    pub fee_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount_sats: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkClaimQuote {
    pub credit_amount_sats: u64,
    pub signature: String,
    pub expires_at: Option<i64>,
}

/// Backend service-fee component per tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkWithdrawalFeeQuote {
    pub id: String,
    pub expires_at: Option<i64>,
    pub service_fee_slow: u64,
    pub service_fee_medium: u64,
    pub service_fee_fast: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkWithdrawal {
    pub id: String,
    pub status: String,
}

/// Opaque self-custodial backend. Errors carry a structured code when the backend has one.
#[async_trait]
pub trait SparkSdk: Send + Sync {
    async fn balance(&self) -> WalletResult<u64>;
    async fn spark_address(&self) -> WalletResult<String>;
    async fn identity_pubkey(&self) -> WalletResult<String>;
    async fn create_lightning_invoice(&self, request: SdkInvoiceRequest) -> WalletResult<SdkReceiveRequest>;
    async fn pay_lightning_invoice(&self, request: SdkPayRequest) -> WalletResult<SdkSendRequest>;
    async fn lightning_send_fee_estimate(&self, invoice: &str) -> WalletResult<u64>;
    async fn lightning_send_request(&self, id: &str) -> WalletResult<Option<SdkSendRequest>>;
    async fn lightning_receive_request(&self, id: &str) -> WalletResult<Option<SdkReceiveRequest>>;
    async fn transfers(&self, limit: usize, offset: usize) -> WalletResult<Vec<SdkTransfer>>;
    async fn transfer(&self, receiver_address: &str, amount_sats: u64) -> WalletResult<SdkTransfer>;
    async fn static_deposit_address(&self) -> WalletResult<String>;
    async fn deposit_utxos(&self, address: &str) -> WalletResult<Vec<SdkUtxo>>;
    async fn claim_quote(&self, txid: &str, vout: u32) -> WalletResult<SdkClaimQuote>;
    async fn claim_deposit(&self, txid: &str, vout: u32, credit_amount_sats: u64, signature: &str) -> WalletResult<Option<String>>;
    async fn withdrawal_fee_quote(&self, amount_sats: u64, address: &str) -> WalletResult<SdkWithdrawalFeeQuote>;
    async fn withdraw(&self, address: &str, amount_sats: u64, tier: FeeTier, quote_id: &str) -> WalletResult<SdkWithdrawal>;
    async fn cleanup(&self) -> WalletResult<()>;
}

/// Opens an SDK session from a decrypted mnemonic.
#[async_trait]
pub trait SparkConnector: Send + Sync {
    async fn initialize(&self, mnemonic: &str, network: SparkNetwork) -> WalletResult<Arc<dyn SparkSdk>>;
}

// =============================================================================
// Normalization tables
// =============================================================================

/// Exact SDK values, consulted before the keyword fallback.
const PAYMENT_STATUS_EXACT: &[(&str, PaymentStatus)] = &[
    ("TRANSFER_COMPLETED", PaymentStatus::Completed),
    ("LIGHTNING_PAYMENT_SUCCEEDED", PaymentStatus::Completed),
    ("PREIMAGE_PROVIDED", PaymentStatus::Completed),
    ("TRANSFER_FAILED", PaymentStatus::Failed),
    ("LIGHTNING_PAYMENT_FAILED", PaymentStatus::Failed),
    ("USER_SWAP_RETURNED", PaymentStatus::Failed),
    ("INVOICE_CREATED", PaymentStatus::Pending),
    ("TRANSFER_PENDING", PaymentStatus::Pending),
    ("LIGHTNING_PAYMENT_INITIATED", PaymentStatus::Pending),
];

const PAYMENT_STATUS_KEYWORDS: &[(&str, PaymentStatus)] = &[
    ("COMPLETED", PaymentStatus::Completed),
    ("FINALIZED", PaymentStatus::Completed),
    ("SUCCEEDED", PaymentStatus::Completed),
    ("SUCCESS", PaymentStatus::Completed),
    ("CLAIMED", PaymentStatus::Completed),
    ("FAILED", PaymentStatus::Failed),
    ("ERROR", PaymentStatus::Failed),
    ("EXPIRED", PaymentStatus::Failed),
    ("CANCELLED", PaymentStatus::Failed),
    ("RETURNED", PaymentStatus::Failed),
];

/// Send/receive request status → tri-state. Unknown values stay pending.
pub fn map_payment_status(raw: &str) -> PaymentStatus {
    let upper = raw.trim().to_ascii_uppercase();
    if let Some((_, status)) = PAYMENT_STATUS_EXACT.iter().find(|(k, _)| *k == upper) {
        return *status;
    }
    PAYMENT_STATUS_KEYWORDS
        .iter()
        .find(|(k, _)| upper.contains(k))
        .map(|(_, status)| *status)
        .unwrap_or(PaymentStatus::Pending)
}

const TRANSFER_STATUS_KEYWORDS: &[(&str, PaymentStatus)] = &[
    ("completed", PaymentStatus::Completed),
    ("finalized", PaymentStatus::Completed),
    ("claimed", PaymentStatus::Completed),
    ("pending", PaymentStatus::Pending),
    ("waiting", PaymentStatus::Pending),
    ("failed", PaymentStatus::Failed),
    ("expired", PaymentStatus::Failed),
];

/// History status. A transfer with no status is one the SDK already settled.
pub fn map_transfer_status(raw: Option<&str>) -> PaymentStatus {
    let lower = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.to_ascii_lowercase(),
        None => return PaymentStatus::Completed,
    };
    TRANSFER_STATUS_KEYWORDS
        .iter()
        .find(|(k, _)| lower.contains(k))
        .map(|(_, status)| *status)
        .unwrap_or_else(|| map_payment_status(&lower))
}

const DIRECTION_TABLE: &[(&str, Direction)] = &[
    ("INCOMING", Direction::Receive),
    ("OUTGOING", Direction::Send),
];

const LEGACY_TYPE_TABLE: &[(&str, Direction)] = &[
    ("LIGHTNING_RECEIVE", Direction::Receive),
    ("SPARK_RECEIVE", Direction::Receive),
    ("LIGHTNING_SEND", Direction::Send),
    ("SPARK_SEND", Direction::Send),
    ("SPARK_TRANSFER", Direction::Send),
];

/// Direction field, then legacy type, then amount sign.
pub fn map_transfer_direction(transfer: &SdkTransfer) -> Direction {
    fn lookup(table: &[(&str, Direction)], value: Option<&str>) -> Option<Direction> {
        let value = value?;
        table.iter().find(|(k, _)| *k == value).map(|(_, d)| *d)
    }
    lookup(DIRECTION_TABLE, transfer.direction.as_deref())
        .or_else(|| lookup(LEGACY_TYPE_TABLE, transfer.transfer_type.as_deref()))
        .unwrap_or(if transfer.amount_sats > 0 { Direction::Receive } else { Direction::Send })
}

/// Values above 1e12 are milliseconds.
pub fn normalize_sdk_timestamp(raw: i64) -> i64 {
    if raw > 1_000_000_000_000 {
        raw / 1000
    } else {
        raw
    }
}

fn transfer_to_record(transfer: SdkTransfer) -> TransactionRecord {
    let direction = map_transfer_direction(&transfer);
    let timestamp = transfer
        .created_at
        .or(transfer.updated_at)
        .map(normalize_sdk_timestamp)
        .unwrap_or_else(now_secs);
    TransactionRecord {
        direction,
        amount: transfer.amount_sats.unsigned_abs(),
        timestamp,
        description: transfer.memo.unwrap_or_default(),
        status: map_transfer_status(transfer.status.as_deref()),
        fee: transfer.fee_sats,
        payment_hash: transfer.payment_hash,
        payment_request: None,
        sender_npub: None,
        id: transfer.id,
    }
}

// =============================================================================
// Fees and invoice decoding
// =============================================================================

/// `max(floor, ceil(amount × bps / 10_000))`
pub fn recommended_fee(policy: &FeePolicy, amount_sats: u64) -> u64 {
    let proportional = (amount_sats as u128 * policy.fee_bps as u128).div_ceil(10_000) as u64;
    proportional.max(policy.min_fee_sats)
}

/// Live estimate plus safety margin, never below the floor.
pub fn inflate_estimate(policy: &FeePolicy, estimate_sats: u64) -> u64 {
    let margin = (estimate_sats as u128 * policy.estimate_margin_percent as u128).div_ceil(100) as u64;
    estimate_sats.saturating_add(margin).max(policy.min_fee_sats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceAmount {
    Fixed(u64),
    Zero,
    /// Could not decode locally; treated as carrying an amount
    Unknown,
}

pub fn decode_invoice_amount(invoice: &str) -> InvoiceAmount {
    let raw = invoice.trim();
    let raw = raw
        .strip_prefix("lightning:")
        .or_else(|| raw.strip_prefix("LIGHTNING:"))
        .unwrap_or(raw);
    match Bolt11Invoice::from_str(raw) {
        Ok(decoded) => match decoded.amount_milli_satoshis() {
            Some(msat) if msat > 0 => InvoiceAmount::Fixed(msat.div_ceil(1000)),
            _ => InvoiceAmount::Zero,
        },
        Err(_) => InvoiceAmount::Unknown,
    }
}

fn is_claim_in_progress(err: &WalletError) -> bool {
    match err.code() {
        Some(code) => code.eq_ignore_ascii_case(CLAIM_IN_PROGRESS_CODE),
        None => match err {
            WalletError::Backend { message, .. } => {
                message.to_ascii_lowercase().contains(CLAIM_IN_PROGRESS_CODE)
            }
            _ => false,
        },
    }
}

fn quote_expired(expires_at: Option<i64>) -> bool {
    expires_at.is_some_and(|at| at <= now_secs())
}

// =============================================================================
// Provider
// =============================================================================

pub struct SparkProvider {
    wallet_id: String,
    network: SparkNetwork,
    connector: Arc<dyn SparkConnector>,
    chain: Arc<dyn ChainData>,
    lnurl: Arc<dyn LightningAddressResolver>,
    fees: FeePolicy,
    wait: PaymentWait,
    state: ConnectionCell,
    session: RwLock<Option<Arc<dyn SparkSdk>>>,
    mnemonic: Mutex<Option<Zeroizing<String>>>,
    deposit_address: Mutex<Option<String>>,
    /// Withdrawal quote id → expiry, for quotes this provider issued
    quotes: Mutex<HashMap<String, Option<i64>>>,
}

impl SparkProvider {
    pub fn new(
        wallet_id: impl Into<String>,
        connection: SparkConnection,
        connector: Arc<dyn SparkConnector>,
        chain: Arc<dyn ChainData>,
        lnurl: Arc<dyn LightningAddressResolver>,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            network: connection.network,
            connector,
            chain,
            lnurl,
            fees: FeePolicy::default(),
            wait: PaymentWait::default(),
            state: ConnectionCell::default(),
            session: RwLock::new(None),
            mnemonic: Mutex::new(None),
            deposit_address: Mutex::new(None),
            quotes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fee_policy(mut self, fees: FeePolicy) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_payment_wait(mut self, wait: PaymentWait) -> Self {
        self.wait = wait;
        self
    }

    pub fn network(&self) -> SparkNetwork {
        self.network
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fees
    }

    /// Hand the decrypted seed to the provider and open a session.
    pub async fn unlock(&self, mnemonic: Zeroizing<String>) -> WalletResult<()> {
        *lock(&self.mnemonic) = Some(mnemonic);
        self.connect().await
    }

    pub fn is_unlocked(&self) -> bool {
        lock(&self.mnemonic).is_some()
    }

    async fn sdk(&self) -> WalletResult<Arc<dyn SparkSdk>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(WalletError::NotConnected(WalletKind::Spark))
    }

    fn record<T>(&self, result: WalletResult<T>) -> WalletResult<T> {
        if let Err(e) = &result {
            self.state.set_error(e.to_string());
        }
        result
    }

    /// Upper fee bound: live estimate with margin, else the static formula.
    pub async fn max_fee_for(&self, invoice: &str, basis_sats: u64) -> u64 {
        let estimate = match self.sdk().await {
            Ok(sdk) => sdk.lightning_send_fee_estimate(invoice).await,
            Err(e) => Err(e),
        };
        match estimate {
            Ok(sats) => inflate_estimate(&self.fees, sats),
            Err(e) => {
                tracing::debug!(error = %e, "fee estimate unavailable, using static policy");
                recommended_fee(&self.fees, basis_sats)
            }
        }
    }

    /// Poll a send request until it settles or fails, bounded by the configured timeout.
    pub async fn wait_for_payment_completion(&self, request_id: &str) -> WalletResult<SdkSendRequest> {
        let sdk = self.sdk().await?;
        tokio::time::timeout(
            self.wait.timeout,
            poll_send_request(sdk.as_ref(), request_id, self.wait.interval),
        )
        .await
        .map_err(|_| WalletError::Timeout("Payment status check timed out".into()))
    }

    async fn lookup_via_sdk(&self, payment_hash: &str) -> WalletResult<InvoiceLookup> {
        let sdk = self.sdk().await?;
        if let Some(receive) = sdk.lightning_receive_request(payment_hash).await? {
            if map_payment_status(&receive.status) == PaymentStatus::Completed {
                return Ok(InvoiceLookup::paid(receive.preimage, Some(receive.amount_sats)));
            }
            return Ok(InvoiceLookup::not_paid());
        }

        let transfers = sdk.transfers(LOOKUP_TRANSFER_SCAN, 0).await?;
        let found = transfers.into_iter().find(|t| {
            t.id == payment_hash || t.payment_hash.as_deref() == Some(payment_hash)
        });
        Ok(match found {
            Some(t) if map_transfer_status(t.status.as_deref()) == PaymentStatus::Completed => {
                InvoiceLookup::paid(None, Some(t.amount_sats.unsigned_abs()))
            }
            _ => InvoiceLookup::not_paid(),
        })
    }
}

async fn poll_send_request(sdk: &dyn SparkSdk, request_id: &str, interval: Duration) -> SdkSendRequest {
    loop {
        match sdk.lightning_send_request(request_id).await {
            Ok(Some(request)) if map_payment_status(&request.status) != PaymentStatus::Pending => {
                return request;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(request_id, error = %e, "send status check failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl WalletProvider for SparkProvider {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    fn kind(&self) -> WalletKind {
        WalletKind::Spark
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.state.status()
    }

    async fn connect(&self) -> WalletResult<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }
        let mnemonic = lock(&self.mnemonic).clone();
        let Some(mnemonic) = mnemonic else {
            self.state.set_error(WalletError::Locked.to_string());
            return Err(WalletError::Locked);
        };

        match self.connector.initialize(mnemonic.as_str(), self.network).await {
            Ok(sdk) => {
                *session = Some(sdk);
                self.state.set_connected();
                tracing::info!(wallet_id = %self.wallet_id, network = self.network.as_str(), "spark wallet connected");
                Ok(())
            }
            Err(e) => {
                self.state.set_error(e.to_string());
                Err(WalletError::Connection(e.to_string()))
            }
        }
    }

    async fn disconnect(&self) {
        let sdk = self.session.write().await.take();
        if let Some(sdk) = sdk {
            if let Err(e) = sdk.cleanup().await {
                tracing::warn!(wallet_id = %self.wallet_id, error = %e, "spark cleanup failed");
            }
        }
        lock(&self.mnemonic).take();
        lock(&self.deposit_address).take();
        lock(&self.quotes).clear();
        self.state.set_disconnected();
    }

    async fn get_balance(&self) -> WalletResult<Balance> {
        let result = match self.sdk().await {
            Ok(sdk) => sdk.balance().await,
            Err(e) => Err(e),
        };
        let balance = self.record(result)?;
        Ok(Balance { balance, pending: 0 })
    }

    async fn get_info(&self) -> WalletResult<WalletInfo> {
        let sdk = self.sdk().await?;
        let spark_address = self.record(sdk.spark_address().await)?;
        let pubkey = sdk.identity_pubkey().await.ok();
        Ok(WalletInfo {
            alias: Some("Spark Wallet".into()),
            color: None,
            pubkey,
            lightning_address: None,
            spark_address: Some(spark_address),
            network: Some(self.network.as_str().to_string()),
            methods: Vec::new(),
        })
    }

    async fn create_invoice(&self, request: CreateInvoiceRequest) -> WalletResult<Invoice> {
        let sdk = self.sdk().await?;
        let receive = sdk
            .create_lightning_invoice(SdkInvoiceRequest {
                amount_sats: request.amount,
                memo: request.description.filter(|d| !d.is_empty()),
                expiry_secs: request.expiry.unwrap_or(DEFAULT_INVOICE_EXPIRY_SECS),
            })
            .await?;
        Ok(Invoice {
            payment_request: receive.invoice,
            payment_hash: receive.payment_hash,
            id: Some(receive.id),
            expires_at: receive.expires_at,
            amount: receive.amount_sats,
        })
    }

    async fn pay_invoice(&self, request: PayInvoiceRequest) -> WalletResult<Payment> {
        let sdk = self.sdk().await?;
        let decoded = decode_invoice_amount(&request.invoice);

        let amount_sats_to_send = match decoded {
            InvoiceAmount::Zero => match request.amount_sats {
                Some(amount) if amount > 0 => Some(amount),
                _ => {
                    return Err(WalletError::validation(
                        "amount",
                        "Amount is required for a zero-amount invoice",
                    ))
                }
            },
            InvoiceAmount::Fixed(_) | InvoiceAmount::Unknown => None,
        };
        let basis = match decoded {
            InvoiceAmount::Fixed(sats) => sats,
            _ => amount_sats_to_send.unwrap_or(self.fees.fallback_amount_sats),
        };
        let max_fee_sats = match request.max_fee {
            Some(fee) => fee,
            None => self.max_fee_for(&request.invoice, basis).await,
        };

        let sent = sdk
            .pay_lightning_invoice(SdkPayRequest {
                invoice: request.invoice.trim().to_string(),
                max_fee_sats,
                amount_sats_to_send,
            })
            .await?;

        let settled = match map_payment_status(&sent.status) {
            PaymentStatus::Pending => self.wait_for_payment_completion(&sent.id).await?,
            _ => sent,
        };
        match map_payment_status(&settled.status) {
            PaymentStatus::Failed => Err(WalletError::backend(format!(
                "Payment failed: {}",
                settled.status
            ))),
            status => Ok(Payment {
                id: Some(settled.id),
                payment_hash: settled.payment_hash,
                preimage: settled.preimage,
                fee: settled.fee_sats.unwrap_or(0),
                status,
            }),
        }
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> InvoiceLookup {
        match self.lookup_via_sdk(payment_hash).await {
            Ok(lookup) => lookup,
            Err(e) => {
                tracing::warn!(wallet_id = %self.wallet_id, payment_hash, error = %e, "spark invoice lookup failed");
                InvoiceLookup::not_paid()
            }
        }
    }

    async fn get_transactions(&self, page: Page) -> Vec<TransactionRecord> {
        let transfers = match self.sdk().await {
            Ok(sdk) => sdk.transfers(page.limit, page.offset).await,
            Err(e) => Err(e),
        };
        match transfers {
            Ok(transfers) => transfers.into_iter().map(transfer_to_record).collect(),
            Err(e) => {
                tracing::warn!(wallet_id = %self.wallet_id, error = %e, "spark history unavailable");
                Vec::new()
            }
        }
    }

    fn onchain(&self) -> Option<&dyn OnchainWallet> {
        Some(self)
    }

    fn spark_transfers(&self) -> Option<&dyn SparkTransfers> {
        Some(self)
    }
}

#[async_trait]
impl SparkTransfers for SparkProvider {
    async fn spark_address(&self) -> WalletResult<String> {
        self.sdk().await?.spark_address().await
    }

    async fn transfer_to_spark_address(&self, address: &str, amount: u64) -> WalletResult<Payment> {
        if !is_spark_address(address) {
            return Err(WalletError::validation("spark_address", "Invalid Spark address"));
        }
        if amount == 0 {
            return Err(WalletError::validation("amount", "Amount must be greater than zero"));
        }
        let transfer = self.sdk().await?.transfer(address.trim(), amount).await?;
        Ok(Payment {
            status: map_transfer_status(transfer.status.as_deref()),
            id: Some(transfer.id),
            payment_hash: None,
            preimage: None,
            fee: 0,
        })
    }

    async fn pay_lightning_address(
        &self,
        address: &str,
        amount: u64,
        comment: Option<&str>,
    ) -> WalletResult<Payment> {
        let invoice = self.lnurl.request_invoice(address, amount, comment).await?;
        check_invoice_amount(&invoice, amount)?;
        self.pay_invoice(PayInvoiceRequest::new(invoice)).await
    }
}

#[async_trait]
impl OnchainWallet for SparkProvider {
    async fn deposit_address(&self) -> WalletResult<String> {
        if let Some(address) = lock(&self.deposit_address).clone() {
            return Ok(address);
        }
        let address = self.sdk().await?.static_deposit_address().await?;
        *lock(&self.deposit_address) = Some(address.clone());
        Ok(address)
    }

    async fn pending_deposits(&self) -> WalletResult<Vec<DepositUtxo>> {
        let address = self.deposit_address().await?;
        let utxos = self.sdk().await?.deposit_utxos(&address).await?;
        let mut deposits = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let confirmations = match self.chain.confirmations(&utxo.txid).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(txid = %utxo.txid, error = %e, "confirmation lookup failed");
                    0
                }
            };
            deposits.push(DepositUtxo {
                claimable: confirmations >= self.fees.min_deposit_confirmations,
                txid: utxo.txid,
                vout: utxo.vout,
                amount: utxo.amount_sats,
                confirmations,
            });
        }
        Ok(deposits)
    }

    async fn quote_deposit_claim(&self, txid: &str, vout: u32) -> WalletResult<ClaimQuote> {
        let confirmations = self.chain.confirmations(txid).await?;
        let required = self.fees.min_deposit_confirmations;
        if confirmations < required {
            return Err(WalletError::validation(
                "deposit",
                format!("Deposit needs {required} confirmations, has {confirmations}"),
            ));
        }
        let quote = self.sdk().await?.claim_quote(txid, vout).await?;
        Ok(ClaimQuote {
            txid: txid.to_string(),
            vout,
            credit_amount_sats: quote.credit_amount_sats,
            signature: quote.signature,
            expires_at: quote.expires_at,
        })
    }

    async fn claim_deposit(&self, quote: &ClaimQuote) -> WalletResult<ClaimOutcome> {
        if quote_expired(quote.expires_at) {
            return Err(WalletError::QuoteExpired(format!("claim quote for {}:{}", quote.txid, quote.vout)));
        }
        let sdk = self.sdk().await?;
        match sdk
            .claim_deposit(&quote.txid, quote.vout, quote.credit_amount_sats, &quote.signature)
            .await
        {
            Ok(transfer_id) => {
                tracing::info!(txid = %quote.txid, vout = quote.vout, "deposit claimed");
                Ok(ClaimOutcome::Claimed { transfer_id })
            }
            Err(e) if is_claim_in_progress(&e) => {
                tracing::info!(txid = %quote.txid, vout = quote.vout, "deposit claim already in progress");
                Ok(ClaimOutcome::InProgress)
            }
            Err(e) => Err(e),
        }
    }

    async fn withdrawal_fee_quote(&self, address: &str, amount: u64) -> WalletResult<WithdrawalQuote> {
        if address.trim().is_empty() {
            return Err(WalletError::validation("bitcoin_address", "Bitcoin address is required"));
        }
        if amount == 0 {
            return Err(WalletError::validation("amount", "Amount must be greater than zero"));
        }
        let rates = self.chain.fee_rates().await?;
        let service = self.sdk().await?.withdrawal_fee_quote(amount, address.trim()).await?;

        let tier = |service_fee: u64, fee_rate: u64| {
            let network_fee = fee_rate.saturating_mul(self.fees.withdraw_vbytes);
            TierQuote { service_fee, network_fee, total: service_fee.saturating_add(network_fee), fee_rate }
        };
        let quote = WithdrawalQuote {
            amount,
            expires_at: service.expires_at,
            slow: tier(service.service_fee_slow, rates.slow),
            medium: tier(service.service_fee_medium, rates.medium),
            fast: tier(service.service_fee_fast, rates.fast),
            id: service.id,
        };
        lock(&self.quotes).insert(quote.id.clone(), quote.expires_at);
        Ok(quote)
    }

    async fn withdraw(&self, request: WithdrawRequest) -> WalletResult<Withdrawal> {
        if request.quote_id.is_empty() {
            return Err(WalletError::validation("quote", "Fee quote id is required"));
        }
        let issued = lock(&self.quotes).get(&request.quote_id).copied();
        if issued.is_some_and(quote_expired) {
            return Err(WalletError::QuoteExpired(format!("withdrawal quote {}", request.quote_id)));
        }
        let withdrawal = self
            .sdk()
            .await?
            .withdraw(request.address.trim(), request.amount, request.tier, &request.quote_id)
            .await?;
        lock(&self.quotes).remove(&request.quote_id);
        tracing::info!(wallet_id = %self.wallet_id, amount = request.amount, tier = request.tier.as_str(), "withdrawal submitted");
        Ok(Withdrawal { status: map_payment_status(&withdrawal.status), id: withdrawal.id })
    }
}
