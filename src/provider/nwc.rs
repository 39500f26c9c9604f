//! Remote-control provider (Nostr Wallet Connect)
//!
//! Payments are delegated to a remote wallet service over a message transport;
//! no keys beyond the connection secret ever touch this process. The transport
//! is a seam ([`NwcTransport`]) so the relay implementation can be swapped.
//!
//! NIP-47 amounts are millisatoshis on the wire; everything leaving this module
//! is whole sats.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};

use super::{
    msat_to_sat, now_secs, Balance, ConnectionCell, ConnectionStatus, CreateInvoiceRequest,
    Direction, Invoice, InvoiceLookup, Page, PayInvoiceRequest, Payment, PaymentNotifications,
    PaymentReceived, PaymentStatus, TransactionRecord, WalletInfo, WalletKind, WalletProvider,
};
use crate::config::RetryPolicy;
use crate::error::{WalletError, WalletResult};

pub const DEFAULT_DESCRIPTION: &str = "BuhoGO Payment";
pub const DEFAULT_EXPIRY_SECS: u64 = 3600;
const LOOKUP_SCAN_LIMIT: usize = 100;
const LOOKUP_SCAN_ATTEMPTS: u32 = 3;
const NOTIFICATION_BUFFER: usize = 32;

// =============================================================================
// Connection URI
// =============================================================================

const URI_SCHEMES: &[&str] = &["nostr+walletconnect://", "nostrwalletconnect://", "nostr+walletconnect:"];

/// Parsed `nostr+walletconnect://<pubkey>?relay=..&secret=..[&lud16=..]`
#[derive(Clone, PartialEq, Eq)]
pub struct NwcUri {
    pub wallet_pubkey: String,
    pub relays: Vec<String>,
    pub secret: String,
    pub lud16: Option<String>,
    raw: String,
}

impl NwcUri {
    pub fn parse(input: &str) -> WalletResult<Self> {
        let raw = input.trim();
        let rest = URI_SCHEMES
            .iter()
            .find_map(|scheme| strip_prefix_ignore_case(raw, scheme))
            .ok_or_else(|| WalletError::validation("nwc_url", "must start with nostr+walletconnect://"))?;

        let (pubkey, query) = rest.split_once('?').unwrap_or((rest, ""));
        let pubkey = pubkey.trim_end_matches('/').to_ascii_lowercase();
        if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WalletError::validation("nwc_url", "wallet pubkey must be 64 hex characters"));
        }

        let mut relays = Vec::new();
        let mut secret = None;
        let mut lud16 = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value);
            match key {
                "relay" if !value.is_empty() => relays.push(value),
                "secret" if !value.is_empty() => secret = Some(value),
                "lud16" => lud16 = Some(value),
                _ => {}
            }
        }
        if relays.is_empty() {
            return Err(WalletError::validation("nwc_url", "missing relay parameter"));
        }
        let secret = secret.ok_or_else(|| WalletError::validation("nwc_url", "missing secret parameter"))?;
        if secret.len() != 64 || !secret.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WalletError::validation("nwc_url", "secret must be 64 hex characters"));
        }

        Ok(Self { wallet_pubkey: pubkey, relays, secret, lud16, raw: raw.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for NwcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NwcUri")
            .field("wallet_pubkey", &self.wallet_pubkey)
            .field("relays", &self.relays)
            .field("secret", &"<redacted>")
            .field("lud16", &self.lud16)
            .finish()
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &value[prefix.len()..])
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Stored connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwcConnection {
    pub nwc_url: String,
}

// =============================================================================
// Transport seam (raw protocol shapes)
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NwcInfo {
    pub alias: Option<String>,
    pub color: Option<String>,
    pub pubkey: Option<String>,
    pub network: Option<String>,
    pub block_height: Option<u64>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<String>,
    pub lud16: Option<String>,
    pub metadata: Option<Value>,
}

/// A NIP-47 transaction as wallets actually send it: every settlement field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NwcTransaction {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub settled: Option<bool>,
    pub paid: Option<bool>,
    #[serde(alias = "settledAt")]
    pub settled_at: Option<i64>,
    pub preimage: Option<String>,
    pub invoice: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "paymentHash")]
    pub payment_hash: Option<String>,
    /// msat; sign varies by wallet
    pub amount: Option<i64>,
    pub fees_paid: Option<i64>,
    pub created_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NwcPayResult {
    pub preimage: String,
    pub fees_paid: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NwcListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpaid: Option<bool>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NwcNotification {
    pub notification_type: String,
    pub notification: NwcTransaction,
}

#[async_trait]
pub trait NwcTransport: Send + Sync {
    async fn get_info(&self) -> WalletResult<NwcInfo>;
    /// msat
    async fn get_balance(&self) -> WalletResult<u64>;
    async fn make_invoice(&self, amount_msat: u64, description: &str, expiry_secs: u64) -> WalletResult<NwcTransaction>;
    async fn pay_invoice(&self, invoice: &str, amount_msat: Option<u64>) -> WalletResult<NwcPayResult>;
    async fn lookup_invoice(&self, payment_hash: &str) -> WalletResult<NwcTransaction>;
    async fn list_transactions(&self, query: NwcListQuery) -> WalletResult<Vec<NwcTransaction>>;
    async fn subscribe_notifications(&self) -> WalletResult<mpsc::Receiver<NwcNotification>>;
    async fn close(&self);
}

/// Performs the (flaky) session handshake.
#[async_trait]
pub trait NwcConnector: Send + Sync {
    async fn open(&self, uri: &NwcUri) -> WalletResult<Arc<dyn NwcTransport>>;
}

// =============================================================================
// Settlement signal table
// =============================================================================

type SettlementRule = fn(&NwcTransaction) -> Option<PaymentStatus>;

/// Evaluated in order; the first rule with an opinion wins.
const SETTLEMENT_RULES: &[(&str, SettlementRule)] = &[
    ("state", rule_state),
    ("settled/paid flags", rule_flags),
    ("status string", rule_status),
    ("settlement timestamp", rule_settled_at),
    ("preimage", rule_preimage),
];

const SETTLED_WORDS: &[&str] = &["settled", "complete", "completed", "paid", "success", "succeeded"];
const FAILED_WORDS: &[&str] = &["failed", "expired", "error", "cancelled"];

fn word_status(raw: &str) -> Option<PaymentStatus> {
    let lower = raw.trim().to_ascii_lowercase();
    if SETTLED_WORDS.contains(&lower.as_str()) {
        Some(PaymentStatus::Completed)
    } else if FAILED_WORDS.contains(&lower.as_str()) {
        Some(PaymentStatus::Failed)
    } else {
        None
    }
}

fn rule_state(tx: &NwcTransaction) -> Option<PaymentStatus> {
    tx.state.as_deref().and_then(word_status)
}

fn rule_flags(tx: &NwcTransaction) -> Option<PaymentStatus> {
    (tx.settled == Some(true) || tx.paid == Some(true)).then_some(PaymentStatus::Completed)
}

fn rule_status(tx: &NwcTransaction) -> Option<PaymentStatus> {
    tx.status.as_deref().and_then(word_status)
}

fn rule_settled_at(tx: &NwcTransaction) -> Option<PaymentStatus> {
    tx.settled_at.filter(|t| *t > 0).map(|_| PaymentStatus::Completed)
}

fn rule_preimage(tx: &NwcTransaction) -> Option<PaymentStatus> {
    tx.preimage
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(|_| PaymentStatus::Completed)
}

pub fn settlement_status(tx: &NwcTransaction) -> PaymentStatus {
    SETTLEMENT_RULES
        .iter()
        .find_map(|(_, rule)| rule(tx))
        .unwrap_or(PaymentStatus::Pending)
}

fn lookup_from(tx: &NwcTransaction) -> InvoiceLookup {
    InvoiceLookup {
        paid: settlement_status(tx) == PaymentStatus::Completed,
        preimage: tx.preimage.clone().filter(|p| !p.is_empty()),
        amount: tx.amount.map(msat_to_sat),
    }
}

fn transaction_to_record(tx: NwcTransaction) -> TransactionRecord {
    let amount_msat = tx.amount.unwrap_or(0);
    let direction = match tx.kind.as_deref() {
        Some("incoming") => Direction::Receive,
        Some("outgoing") => Direction::Send,
        _ if amount_msat > 0 => Direction::Receive,
        _ => Direction::Send,
    };
    let status = settlement_status(&tx);
    let timestamp = tx
        .settled_at
        .filter(|t| *t > 0)
        .or(tx.created_at)
        .unwrap_or_else(now_secs);
    let id = tx
        .payment_hash
        .clone()
        .or_else(|| tx.invoice.clone())
        .unwrap_or_else(|| format!("nwc-{timestamp}"));
    TransactionRecord {
        id,
        direction,
        amount: msat_to_sat(amount_msat),
        timestamp,
        description: tx.description.unwrap_or_default(),
        status,
        fee: tx.fees_paid.map(msat_to_sat).unwrap_or(0),
        payment_hash: tx.payment_hash,
        payment_request: tx.invoice,
        sender_npub: None,
    }
}

/// Lightning address from info, then info metadata, then the URI. Literal "null" is ignored.
pub fn resolve_lud16(info: Option<&NwcInfo>, uri: &NwcUri) -> Option<String> {
    let from_metadata = info
        .and_then(|i| i.metadata.as_ref())
        .and_then(|m| m.get("lud16"))
        .and_then(Value::as_str)
        .map(str::to_string);
    [info.and_then(|i| i.lud16.clone()), from_metadata, uri.lud16.clone()]
        .into_iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty() && s != "null")
}

pub fn payment_hash_from_preimage(preimage: &str) -> Option<String> {
    let bytes = hex::decode(preimage.trim()).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(hex::encode(Sha256::digest(&bytes)))
}

// =============================================================================
// Provider
// =============================================================================

pub struct NwcProvider {
    wallet_id: String,
    uri: NwcUri,
    connector: Arc<dyn NwcConnector>,
    retry: RetryPolicy,
    state: ConnectionCell,
    transport: RwLock<Option<Arc<dyn NwcTransport>>>,
    info: Mutex<Option<NwcInfo>>,
}

impl NwcProvider {
    pub fn new(wallet_id: impl Into<String>, uri: NwcUri, connector: Arc<dyn NwcConnector>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            uri,
            connector,
            retry: RetryPolicy::default(),
            state: ConnectionCell::default(),
            transport: RwLock::new(None),
            info: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn uri(&self) -> &NwcUri {
        &self.uri
    }

    fn cached_info(&self) -> Option<NwcInfo> {
        self.info.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn supports_notifications(&self) -> bool {
        self.cached_info()
            .is_some_and(|info| info.notifications.iter().any(|n| n == "payment_received"))
    }

    /// Unknown until connected; an empty method list is treated as "anything goes".
    fn supports_method(&self, method: &str) -> bool {
        match self.cached_info() {
            Some(info) if !info.methods.is_empty() => info.methods.iter().any(|m| m == method),
            _ => true,
        }
    }

    async fn transport(&self) -> WalletResult<Arc<dyn NwcTransport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or(WalletError::NotConnected(WalletKind::Nwc))
    }

    async fn open_with_retry(&self) -> WalletResult<Arc<dyn NwcTransport>> {
        let attempts = self.retry.attempts.max(1);
        let mut last_err = WalletError::Connection("no connection attempt made".into());
        for attempt in 1..=attempts {
            match self.connector.open(&self.uri).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::warn!(wallet_id = %self.wallet_id, attempt, attempts, error = %e, "nwc handshake failed");
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }
        Err(last_err)
    }

    async fn scan_for_payment(&self, transport: &dyn NwcTransport, payment_hash: &str) -> Option<InvoiceLookup> {
        for attempt in 1..=LOOKUP_SCAN_ATTEMPTS {
            let query = NwcListQuery {
                limit: Some(LOOKUP_SCAN_LIMIT),
                offset: None,
                unpaid: Some(false),
                kind: Some("incoming".into()),
            };
            match transport.list_transactions(query).await {
                Ok(txs) => {
                    if let Some(tx) = txs.iter().find(|tx| tx.payment_hash.as_deref() == Some(payment_hash)) {
                        return Some(lookup_from(tx));
                    }
                }
                Err(e) => tracing::debug!(attempt, error = %e, "nwc list_transactions failed"),
            }
            if attempt < LOOKUP_SCAN_ATTEMPTS {
                tokio::time::sleep(self.retry.delay).await;
            }
        }
        None
    }
}

#[async_trait]
impl WalletProvider for NwcProvider {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    fn kind(&self) -> WalletKind {
        WalletKind::Nwc
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.state.status()
    }

    async fn connect(&self) -> WalletResult<()> {
        let mut slot = self.transport.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let transport = match self.open_with_retry().await {
            Ok(t) => t,
            Err(e) => {
                self.state.set_error(e.to_string());
                return Err(WalletError::Connection(e.to_string()));
            }
        };
        match transport.get_info().await {
            Ok(info) => *self.info.lock().unwrap_or_else(|p| p.into_inner()) = Some(info),
            Err(e) => tracing::debug!(wallet_id = %self.wallet_id, error = %e, "nwc get_info unavailable"),
        }
        *slot = Some(transport);
        self.state.set_connected();
        tracing::info!(wallet_id = %self.wallet_id, relays = ?self.uri.relays, "nwc wallet connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(transport) = self.transport.write().await.take() {
            transport.close().await;
        }
        self.info.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.state.set_disconnected();
    }

    async fn get_balance(&self) -> WalletResult<Balance> {
        let result = match self.transport().await {
            Ok(t) => t.get_balance().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(msat) => Ok(Balance { balance: msat / 1000, pending: 0 }),
            Err(e) => {
                self.state.set_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn get_info(&self) -> WalletResult<WalletInfo> {
        let transport = self.transport().await?;
        let info = match transport.get_info().await {
            Ok(info) => {
                *self.info.lock().unwrap_or_else(|p| p.into_inner()) = Some(info.clone());
                Some(info)
            }
            Err(e) => {
                tracing::debug!(error = %e, "nwc get_info failed, using cached info");
                self.cached_info()
            }
        };
        let lightning_address = resolve_lud16(info.as_ref(), &self.uri);
        let info = info.unwrap_or_default();
        Ok(WalletInfo {
            alias: info.alias.or_else(|| Some("NWC Wallet".into())),
            color: info.color,
            pubkey: info.pubkey,
            lightning_address,
            spark_address: None,
            network: info.network,
            methods: info.methods,
        })
    }

    async fn create_invoice(&self, request: CreateInvoiceRequest) -> WalletResult<Invoice> {
        let transport = self.transport().await?;
        let description = request
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());
        let expiry = request.expiry.unwrap_or(DEFAULT_EXPIRY_SECS);
        let tx = transport
            .make_invoice(request.amount.saturating_mul(1000), &description, expiry)
            .await?;
        let payment_request = tx
            .invoice
            .filter(|i| !i.is_empty())
            .ok_or_else(|| WalletError::backend("Wallet returned no invoice"))?;
        Ok(Invoice {
            payment_hash: tx.payment_hash.unwrap_or_default(),
            id: None,
            expires_at: tx.expires_at.or_else(|| Some(now_secs() + expiry as i64)),
            amount: request.amount,
            payment_request,
        })
    }

    async fn pay_invoice(&self, request: PayInvoiceRequest) -> WalletResult<Payment> {
        let transport = self.transport().await?;
        let amount_msat = request.amount_sats.map(|sats| sats.saturating_mul(1000));
        let result = transport.pay_invoice(request.invoice.trim(), amount_msat).await?;
        Ok(Payment {
            id: None,
            payment_hash: payment_hash_from_preimage(&result.preimage),
            fee: result.fees_paid.map(msat_to_sat).unwrap_or(0),
            preimage: Some(result.preimage).filter(|p| !p.is_empty()),
            status: PaymentStatus::Completed,
        })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> InvoiceLookup {
        let transport = match self.transport().await {
            Ok(t) => t,
            Err(_) => return InvoiceLookup::not_paid(),
        };
        match transport.lookup_invoice(payment_hash).await {
            Ok(tx) => return lookup_from(&tx),
            Err(e) => tracing::debug!(payment_hash, error = %e, "nwc lookup_invoice failed, scanning history"),
        }
        self.scan_for_payment(transport.as_ref(), payment_hash)
            .await
            .unwrap_or_else(InvoiceLookup::not_paid)
    }

    async fn get_transactions(&self, page: Page) -> Vec<TransactionRecord> {
        if !self.supports_method("list_transactions") {
            return Vec::new();
        }
        let transport = match self.transport().await {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        let query = NwcListQuery {
            limit: Some(page.limit),
            offset: Some(page.offset),
            unpaid: None,
            kind: None,
        };
        match transport.list_transactions(query).await {
            Ok(txs) => txs.into_iter().map(transaction_to_record).collect(),
            Err(e) => {
                tracing::warn!(wallet_id = %self.wallet_id, error = %e, "nwc history unavailable");
                Vec::new()
            }
        }
    }

    fn notifications(&self) -> Option<&dyn PaymentNotifications> {
        if self.supports_notifications() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PaymentNotifications for NwcProvider {
    async fn subscribe_payment_received(&self) -> WalletResult<mpsc::Receiver<PaymentReceived>> {
        if !self.supports_notifications() {
            return Err(WalletError::Unsupported("payment notifications".into()));
        }
        let mut raw = self.transport().await?.subscribe_notifications().await?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let wallet_id = self.wallet_id.clone();
        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                if event.notification_type != "payment_received" {
                    continue;
                }
                let n = event.notification;
                let Some(payment_hash) = n.payment_hash.clone() else { continue };
                let received = PaymentReceived {
                    payment_hash,
                    amount: n.amount.map(msat_to_sat).unwrap_or(0),
                    preimage: n.preimage.clone(),
                    settled_at: n.settled_at,
                };
                if tx.send(received).await.is_err() {
                    break;
                }
            }
            tracing::debug!(%wallet_id, "nwc notification stream closed");
        });
        Ok(rx)
    }
}
