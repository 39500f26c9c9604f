//! Hosted-custody provider (LNBits REST API)
//!
//! Plain authenticated HTTP. The server keeps the keys; we hold an admin key
//! scoped to one wallet. Amounts and fees arrive in msat, timestamps in
//! whatever unit the server version happens to emit.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    msat_to_sat, now_secs, Balance, ConnectionCell, ConnectionStatus, CreateInvoiceRequest,
    Direction, Invoice, InvoiceLookup, Page, PayInvoiceRequest, Payment, PaymentStatus,
    TransactionRecord, WalletInfo, WalletKind, WalletProvider,
};
use crate::error::{WalletError, WalletResult};
use crate::lnurl::is_loopback_host;

pub const DEFAULT_MEMO: &str = "BuhoGO Payment";
pub const DEFAULT_EXPIRY_SECS: u64 = 3600;
const BRAND_COLOR: &str = "#FF1FE1";
const DEFAULT_ALIAS: &str = "LNBits Wallet";

/// Year 2100 in seconds; the unit-detection boundary.
const MAX_SECONDS: i64 = 4_102_444_800;

/// Stored connection parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnbitsConnection {
    pub server_url: String,
    pub wallet_id: String,
    pub admin_key: String,
}

impl fmt::Debug for LnbitsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LnbitsConnection")
            .field("server_url", &self.server_url)
            .field("wallet_id", &self.wallet_id)
            .field("admin_key", &"<redacted>")
            .finish()
    }
}

/// Result of the pre-connect credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedLnbits {
    pub server_url: String,
    pub wallet_id: String,
    pub name: String,
    /// sats
    pub balance: u64,
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct WalletDetails {
    id: Option<String>,
    name: Option<String>,
    /// msat
    balance: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LnbitsPayment {
    payment_hash: Option<String>,
    checking_id: Option<String>,
    #[serde(alias = "bolt11")]
    payment_request: Option<String>,
    amount: Option<i64>,
    fee: Option<i64>,
    memo: Option<String>,
    status: Option<String>,
    pending: Option<bool>,
    paid: Option<bool>,
    preimage: Option<String>,
    #[serde(default)]
    time: Value,
    #[serde(default)]
    created_at: Value,
    details: Option<Box<LnbitsPayment>>,
}

impl LnbitsPayment {
    /// Newer servers nest the payment under `details` on single lookups.
    fn flattened(self) -> LnbitsPayment {
        let Some(details) = self.details else { return self };
        let details = *details;
        LnbitsPayment {
            payment_hash: self.payment_hash.or(details.payment_hash),
            checking_id: self.checking_id.or(details.checking_id),
            payment_request: self.payment_request.or(details.payment_request),
            amount: self.amount.or(details.amount),
            fee: self.fee.or(details.fee),
            memo: self.memo.or(details.memo),
            status: self.status.or(details.status),
            pending: self.pending.or(details.pending),
            paid: self.paid.or(details.paid),
            preimage: self.preimage.filter(|p| !p.is_empty()).or(details.preimage),
            time: if self.time.is_null() { details.time } else { self.time },
            created_at: if self.created_at.is_null() { details.created_at } else { self.created_at },
            details: None,
        }
    }

    fn status(&self) -> PaymentStatus {
        if self.status.is_none() && self.pending.is_none() {
            if let Some(paid) = self.paid {
                return if paid { PaymentStatus::Completed } else { PaymentStatus::Pending };
            }
        }
        map_status(self.status.as_deref(), self.pending)
    }

    /// Lookups need a positive settlement signal; a body without one is unpaid.
    fn is_settled(&self) -> bool {
        if self.paid == Some(true) {
            return true;
        }
        match self.status.as_deref() {
            Some(status) => map_status(Some(status), None) == PaymentStatus::Completed,
            None => self.pending == Some(false),
        }
    }

    fn timestamp(&self) -> Option<i64> {
        normalize_timestamp(&self.time).or_else(|| normalize_timestamp(&self.created_at))
    }
}

// =============================================================================
// Normalization
// =============================================================================

const COMPLETED_STATUSES: &[&str] = &["success", "completed", "complete", "settled"];
const FAILED_STATUSES: &[&str] = &["failed", "failure", "expired", "cancelled"];

/// String status wins; the legacy boolean `pending` is consulted only without one.
pub fn map_status(status: Option<&str>, pending: Option<bool>) -> PaymentStatus {
    if let Some(status) = status {
        let lower = status.trim().to_ascii_lowercase();
        if COMPLETED_STATUSES.contains(&lower.as_str()) {
            return PaymentStatus::Completed;
        }
        if FAILED_STATUSES.contains(&lower.as_str()) {
            return PaymentStatus::Failed;
        }
        return PaymentStatus::Pending;
    }
    match pending {
        Some(true) => PaymentStatus::Pending,
        Some(false) | None => PaymentStatus::Completed,
    }
}

/// Unix seconds from seconds, ms, µs or ns (detected by magnitude), a numeric
/// string, or an ISO-8601 datetime.
pub fn normalize_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                integer_seconds(int)
            } else {
                n.as_f64().and_then(float_seconds)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(int) = trimmed.parse::<i64>() {
                return normalize_timestamp(&Value::from(int));
            }
            if let Ok(float) = trimmed.parse::<f64>() {
                return float_seconds(float);
            }
            parse_datetime(trimmed)
        }
        _ => None,
    }
}

fn integer_seconds(value: i64) -> Option<i64> {
    if value <= 0 {
        return None;
    }
    let value = value as i128;
    let max = MAX_SECONDS as i128;
    let seconds = if value < max {
        value
    } else if value < max * 1_000 {
        value / 1_000
    } else if value < max * 1_000_000 {
        value / 1_000_000
    } else {
        value / 1_000_000_000
    };
    i64::try_from(seconds).ok()
}

fn float_seconds(value: f64) -> Option<i64> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let max = MAX_SECONDS as f64;
    let seconds = if value < max {
        value
    } else if value < max * 1e3 {
        value / 1e3
    } else if value < max * 1e6 {
        value / 1e6
    } else {
        value / 1e9
    };
    Some(seconds.floor() as i64)
}

fn parse_datetime(value: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
}

/// Trim, drop trailing `/`, force https unless the host is loopback.
pub fn normalize_server_url(input: &str) -> String {
    let url = input.trim().trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("https://") {
        return format!("https://{rest}");
    }
    if let Some(rest) = url.strip_prefix("http://") {
        let scheme = if is_loopback_host(rest) { "http" } else { "https" };
        return format!("{scheme}://{rest}");
    }
    format!("https://{url}")
}

/// `detail`, then `message`, then the raw body, then `HTTP {status}`.
fn error_detail(status: u16, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["detail", "message"].iter().find_map(|key| match v.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) if !other.is_null() && !other.is_string() => Some(other.to_string()),
            _ => None,
        })
    });
    from_json
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| format!("HTTP {status}"))
}

fn payment_to_record(payment: LnbitsPayment) -> TransactionRecord {
    let amount_msat = payment.amount.unwrap_or(0);
    let status = payment.status();
    let timestamp = payment.timestamp().unwrap_or_else(now_secs);
    TransactionRecord {
        id: payment
            .payment_hash
            .clone()
            .or_else(|| payment.checking_id.clone())
            .unwrap_or_default(),
        direction: if amount_msat > 0 { Direction::Receive } else { Direction::Send },
        amount: msat_to_sat(amount_msat),
        timestamp,
        description: payment.memo.unwrap_or_default(),
        status,
        fee: payment.fee.map(msat_to_sat).unwrap_or(0),
        payment_hash: payment.payment_hash,
        payment_request: payment.payment_request,
        sender_npub: None,
    }
}

// =============================================================================
// Provider
// =============================================================================

pub struct LnbitsProvider {
    wallet_id: String,
    connection: LnbitsConnection,
    client: reqwest::Client,
    name: Option<String>,
    state: ConnectionCell,
}

impl LnbitsProvider {
    pub fn new(wallet_id: impl Into<String>, connection: LnbitsConnection, client: reqwest::Client) -> Self {
        let connection = LnbitsConnection {
            server_url: normalize_server_url(&connection.server_url),
            ..connection
        };
        Self {
            wallet_id: wallet_id.into(),
            connection,
            client,
            name: None,
            state: ConnectionCell::default(),
        }
    }

    /// Display name used when the server reports none.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn server_url(&self) -> &str {
        &self.connection.server_url
    }

    /// Checks URL, key and wallet id together before anything is persisted.
    pub async fn validate_credentials(
        client: &reqwest::Client,
        server_url: &str,
        wallet_id: &str,
        admin_key: &str,
    ) -> WalletResult<ValidatedLnbits> {
        let server_url = normalize_server_url(server_url);
        let response = client
            .get(format!("{server_url}/api/v1/wallet"))
            .header("X-Api-Key", admin_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    WalletError::Connection("Unable to reach server. Check the URL and try again.".into())
                } else {
                    WalletError::from(e)
                }
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 => return Err(WalletError::Api { status, detail: "Invalid API key".into() }),
            404 => {
                return Err(WalletError::Api { status, detail: "LNBits API not found at this URL".into() })
            }
            _ => return Err(WalletError::Api { status, detail: format!("Server returned {status}") }),
        }

        let details: WalletDetails = response
            .json()
            .await
            .map_err(|_| WalletError::backend("Invalid response from server"))?;
        let balance = details
            .balance
            .ok_or_else(|| WalletError::backend("Invalid response from server"))?;
        let actual_id = details.id.unwrap_or_default();
        let expected = wallet_id.trim();
        if !expected.is_empty() && actual_id != expected {
            return Err(WalletError::validation(
                "wallet_id",
                format!(
                    "Wallet ID mismatch. Expected {expected}, got {actual_id}. The admin key belongs to a different wallet."
                ),
            ));
        }

        Ok(ValidatedLnbits {
            server_url,
            wallet_id: actual_id,
            name: details.name.filter(|n| !n.is_empty()).unwrap_or_else(|| DEFAULT_ALIAS.into()),
            balance: msat_to_sat(balance),
        })
    }

    /// Server-side BOLT11 decode, returned as-is.
    pub async fn decode_invoice(&self, bolt11: &str) -> WalletResult<Value> {
        self.ensure_connected()?;
        self.request(reqwest::Method::POST, "/api/v1/payments/decode", Some(json!({ "data": bolt11.trim() })))
            .await
    }

    fn ensure_connected(&self) -> WalletResult<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(WalletError::NotConnected(WalletKind::Lnbits))
        }
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> WalletResult<Value> {
        let url = format!("{}{}", self.connection.server_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header("X-Api-Key", &self.connection.admin_key);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                WalletError::Connection("Unable to reach LNBits server".into())
            } else {
                WalletError::from(e)
            }
        })?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let detail = error_detail(status.as_u16(), &text);
            tracing::debug!(%url, status = status.as_u16(), %detail, "lnbits request failed");
            return Err(WalletError::Api { status: status.as_u16(), detail });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| WalletError::backend(format!("Invalid JSON from LNBits: {e}")))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> WalletResult<T> {
        let value = self.request(reqwest::Method::GET, path, None).await?;
        serde_json::from_value(value).map_err(|e| WalletError::backend(format!("Unexpected LNBits response: {e}")))
    }

    async fn wallet_details(&self) -> WalletResult<WalletDetails> {
        self.get("/api/v1/wallet").await
    }

    /// Records the error on the connection cell on the way out.
    fn track<T>(&self, result: WalletResult<T>) -> WalletResult<T> {
        if let Err(e) = &result {
            self.state.set_error(e.to_string());
        }
        result
    }
}

#[async_trait]
impl WalletProvider for LnbitsProvider {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    fn kind(&self) -> WalletKind {
        WalletKind::Lnbits
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.state.status()
    }

    async fn connect(&self) -> WalletResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        let result = match self.wallet_details().await {
            Ok(details) if details.balance.is_some() => Ok(()),
            Ok(_) => Err(WalletError::backend("Invalid response from LNBits server")),
            Err(e) => Err(e),
        };
        self.track(result)?;
        self.state.set_connected();
        tracing::info!(wallet_id = %self.wallet_id, server = %self.connection.server_url, "lnbits wallet connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.set_disconnected();
    }

    async fn get_balance(&self) -> WalletResult<Balance> {
        self.ensure_connected()?;
        let details = self.track(self.wallet_details().await)?;
        Ok(Balance { balance: details.balance.map(msat_to_sat).unwrap_or(0), pending: 0 })
    }

    async fn get_info(&self) -> WalletResult<WalletInfo> {
        self.ensure_connected()?;
        let details = self.track(self.wallet_details().await)?;
        Ok(WalletInfo {
            alias: details
                .name
                .filter(|n| !n.is_empty())
                .or_else(|| self.name.clone())
                .or_else(|| Some(DEFAULT_ALIAS.into())),
            color: Some(BRAND_COLOR.into()),
            pubkey: None,
            lightning_address: None,
            spark_address: None,
            network: Some("mainnet".into()),
            methods: Vec::new(),
        })
    }

    async fn create_invoice(&self, request: CreateInvoiceRequest) -> WalletResult<Invoice> {
        self.ensure_connected()?;
        let expiry = request.expiry.unwrap_or(DEFAULT_EXPIRY_SECS);
        let memo = request
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MEMO.to_string());
        let body = json!({ "out": false, "amount": request.amount, "memo": memo, "expiry": expiry });
        let created = self.track(self.request(reqwest::Method::POST, "/api/v1/payments", Some(body)).await)?;
        let payment: LnbitsPayment = serde_json::from_value(created).unwrap_or_default();
        let payment_request = payment
            .payment_request
            .filter(|pr| !pr.is_empty())
            .ok_or_else(|| WalletError::backend("Invalid invoice response from LNBits"))?;
        Ok(Invoice {
            payment_request,
            payment_hash: payment.payment_hash.unwrap_or_default(),
            id: payment.checking_id,
            // Not returned by the server; derived from the requested expiry.
            expires_at: Some(now_secs() + expiry as i64),
            amount: request.amount,
        })
    }

    async fn pay_invoice(&self, request: PayInvoiceRequest) -> WalletResult<Payment> {
        self.ensure_connected()?;
        let body = json!({ "out": true, "bolt11": request.invoice.trim() });
        let sent = self.track(self.request(reqwest::Method::POST, "/api/v1/payments", Some(body)).await)?;
        if sent.is_null() {
            return Err(WalletError::backend("Payment failed: No response from LNBits"));
        }
        let sent: LnbitsPayment = serde_json::from_value(sent).unwrap_or_default();
        let payment_hash = sent.payment_hash.clone().filter(|h| !h.is_empty());

        let mut payment = Payment {
            id: sent.checking_id.clone(),
            payment_hash: payment_hash.clone(),
            preimage: sent.preimage.clone().filter(|p| !p.is_empty()),
            fee: 0,
            status: PaymentStatus::Pending,
        };

        let details = match &payment_hash {
            Some(hash) => self.get::<LnbitsPayment>(&format!("/api/v1/payments/{hash}")).await,
            None => Err(WalletError::NotFound("payment hash".into())),
        };
        match details {
            Ok(details) => {
                let details = details.flattened();
                payment.status = details.status();
                payment.fee = details.fee.map(msat_to_sat).unwrap_or(0);
                if let Some(preimage) = details.preimage.filter(|p| !p.is_empty()) {
                    payment.preimage = Some(preimage);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "lnbits payment details unavailable");
                if payment.preimage.is_some() {
                    payment.status = PaymentStatus::Completed;
                }
            }
        }
        Ok(payment)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> InvoiceLookup {
        if self.ensure_connected().is_err() {
            return InvoiceLookup::not_paid();
        }
        let value = match self
            .request(reqwest::Method::GET, &format!("/api/v1/payments/{payment_hash}"), None)
            .await
        {
            Ok(Value::Null) => return InvoiceLookup::not_paid(),
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(payment_hash, error = %e, "lnbits lookup failed");
                return InvoiceLookup::not_paid();
            }
        };
        let payment = match serde_json::from_value::<LnbitsPayment>(value) {
            Ok(p) => p.flattened(),
            Err(_) => return InvoiceLookup::not_paid(),
        };
        InvoiceLookup {
            paid: payment.is_settled(),
            preimage: payment.preimage.filter(|p| !p.is_empty()),
            amount: Some(payment.amount.map(msat_to_sat).unwrap_or(0)),
        }
    }

    async fn get_transactions(&self, page: Page) -> Vec<TransactionRecord> {
        if self.ensure_connected().is_err() {
            return Vec::new();
        }
        let path = format!("/api/v1/payments?limit={}&offset={}", page.limit, page.offset);
        match self.get::<Vec<LnbitsPayment>>(&path).await {
            Ok(payments) => payments.into_iter().map(payment_to_record).collect(),
            Err(e) => {
                tracing::warn!(wallet_id = %self.wallet_id, error = %e, "lnbits history unavailable");
                Vec::new()
            }
        }
    }
}
