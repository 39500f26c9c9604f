//! Shared fakes: a scripted wallet provider, an in-memory NWC wallet service,
//! a canned LNURL resolver and a wallet directory.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use buho::lnurl::LightningAddressResolver;
use buho::provider::nwc::{NwcInfo, NwcListQuery, NwcNotification, NwcPayResult, NwcTransaction};
use buho::provider::{
    Balance, ClaimOutcome, ClaimQuote, ConnectionCell, ConnectionStatus, CreateInvoiceRequest, DepositUtxo,
    Invoice, InvoiceLookup, NwcConnector, NwcTransport, NwcUri, OnchainWallet, Page, PayInvoiceRequest, Payment,
    PaymentNotifications, PaymentReceived, PaymentStatus, SparkTransfers, TierQuote, TransactionRecord, WalletInfo,
    WalletKind, WalletProvider, Withdrawal, WithdrawRequest, WithdrawalQuote,
};
use buho::withdraw::WalletDirectory;
use buho::{WalletConfig, WalletError, WalletResult};

pub const NWC_PUBKEY: &str = "b889ff5b1513b641e2a139f661a661364979c5beee91842f8f0ef42ab558e9d4";
pub const NWC_SECRET: &str = "71a8c14c1407c113601079c4302dab36460f0ccd0ad506f1f2dc73b5100e4f3c";

pub fn nwc_uri(relay: &str) -> String {
    format!("nostr+walletconnect://{NWC_PUBKEY}?relay={relay}&secret={NWC_SECRET}")
}

/// A real signed mainnet BOLT11 invoice; `None` makes a zero-amount invoice.
pub fn signed_invoice(amount_sats: Option<u64>) -> String {
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&[0x41; 32]).expect("key");
    let builder = InvoiceBuilder::new(Currency::Bitcoin)
        .description("buho test".into())
        .payment_hash(sha256::Hash::hash(format!("{amount_sats:?}").as_bytes()))
        .payment_secret(PaymentSecret([42; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144);
    let builder = match amount_sats {
        Some(sats) => builder.amount_milli_satoshis(sats * 1000),
        None => builder,
    };
    builder
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key))
        .expect("sign invoice")
        .to_string()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// =============================================================================
// Scripted provider
// =============================================================================

pub struct MockProvider {
    id: String,
    kind: WalletKind,
    state: ConnectionCell,
    balance: AtomicU64,
    lookups: Mutex<VecDeque<InvoiceLookup>>,
    pub lookup_calls: AtomicU32,
    pub paid: Mutex<Vec<PayInvoiceRequest>>,
    pub address_payments: Mutex<Vec<(String, u64)>>,
    pub withdrawals: Mutex<Vec<WithdrawRequest>>,
    transactions: Mutex<Vec<TransactionRecord>>,
    fail_pay: AtomicBool,
    push: Mutex<Option<mpsc::Receiver<PaymentReceived>>>,
}

impl MockProvider {
    pub fn new(id: &str, kind: WalletKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            state: ConnectionCell::default(),
            balance: AtomicU64::new(0),
            lookups: Mutex::new(VecDeque::new()),
            lookup_calls: AtomicU32::new(0),
            paid: Mutex::new(Vec::new()),
            address_payments: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            fail_pay: AtomicBool::new(false),
            push: Mutex::new(None),
        }
    }

    pub fn with_balance(self, sats: u64) -> Self {
        self.balance.store(sats, Ordering::SeqCst);
        self
    }

    /// Lookups answer from this script in order, then "not paid" forever.
    pub fn with_lookups(self, lookups: Vec<InvoiceLookup>) -> Self {
        *lock(&self.lookups) = lookups.into();
        self
    }

    pub fn with_transactions(self, txs: Vec<TransactionRecord>) -> Self {
        *lock(&self.transactions) = txs;
        self
    }

    pub fn with_push(self, rx: mpsc::Receiver<PaymentReceived>) -> Self {
        *lock(&self.push) = Some(rx);
        self
    }

    pub fn failing_payments(self) -> Self {
        self.fail_pay.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_balance(&self, sats: u64) {
        self.balance.store(sats, Ordering::SeqCst);
    }

    pub fn lookups_made(&self) -> u32 {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletProvider for MockProvider {
    fn wallet_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> WalletKind {
        self.kind
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.state.status()
    }

    async fn connect(&self) -> WalletResult<()> {
        self.state.set_connected();
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.set_disconnected();
    }

    async fn get_balance(&self) -> WalletResult<Balance> {
        Ok(Balance { balance: self.balance.load(Ordering::SeqCst), pending: 0 })
    }

    async fn get_info(&self) -> WalletResult<WalletInfo> {
        Ok(WalletInfo { alias: Some("Mock".into()), ..Default::default() })
    }

    async fn create_invoice(&self, request: CreateInvoiceRequest) -> WalletResult<Invoice> {
        Ok(Invoice {
            payment_request: format!("lnbc{}n1mock", request.amount),
            payment_hash: "ab".repeat(32),
            id: None,
            expires_at: None,
            amount: request.amount,
        })
    }

    async fn pay_invoice(&self, request: PayInvoiceRequest) -> WalletResult<Payment> {
        if self.fail_pay.load(Ordering::SeqCst) {
            return Err(WalletError::backend("insufficient balance"));
        }
        lock(&self.paid).push(request);
        Ok(Payment {
            id: None,
            payment_hash: Some(format!("hash-{}", lock(&self.paid).len())),
            preimage: Some("00".repeat(32)),
            fee: 1,
            status: PaymentStatus::Completed,
        })
    }

    async fn lookup_invoice(&self, _payment_hash: &str) -> InvoiceLookup {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.lookups).pop_front().unwrap_or_else(InvoiceLookup::not_paid)
    }

    async fn get_transactions(&self, page: Page) -> Vec<TransactionRecord> {
        lock(&self.transactions).iter().skip(page.offset).take(page.limit).cloned().collect()
    }

    fn onchain(&self) -> Option<&dyn OnchainWallet> {
        (self.kind == WalletKind::Spark).then_some(self as &dyn OnchainWallet)
    }

    fn spark_transfers(&self) -> Option<&dyn SparkTransfers> {
        (self.kind == WalletKind::Spark).then_some(self as &dyn SparkTransfers)
    }

    fn notifications(&self) -> Option<&dyn PaymentNotifications> {
        lock(&self.push).is_some().then_some(self as &dyn PaymentNotifications)
    }
}

#[async_trait]
impl SparkTransfers for MockProvider {
    async fn spark_address(&self) -> WalletResult<String> {
        Ok("sp1mockaddress".into())
    }

    async fn transfer_to_spark_address(&self, address: &str, amount: u64) -> WalletResult<Payment> {
        lock(&self.address_payments).push((address.to_string(), amount));
        Ok(Payment { id: Some("transfer-1".into()), payment_hash: None, preimage: None, fee: 0, status: PaymentStatus::Completed })
    }

    async fn pay_lightning_address(&self, address: &str, amount: u64, _comment: Option<&str>) -> WalletResult<Payment> {
        if self.fail_pay.load(Ordering::SeqCst) {
            return Err(WalletError::backend("route not found"));
        }
        lock(&self.address_payments).push((address.to_string(), amount));
        Ok(Payment { id: Some("spark-pay-1".into()), payment_hash: None, preimage: None, fee: 2, status: PaymentStatus::Completed })
    }
}

#[async_trait]
impl OnchainWallet for MockProvider {
    async fn deposit_address(&self) -> WalletResult<String> {
        Ok("bc1qmockdeposit".into())
    }

    async fn pending_deposits(&self) -> WalletResult<Vec<DepositUtxo>> {
        Ok(Vec::new())
    }

    async fn quote_deposit_claim(&self, _txid: &str, _vout: u32) -> WalletResult<ClaimQuote> {
        Err(WalletError::Unsupported("claims".into()))
    }

    async fn claim_deposit(&self, _quote: &ClaimQuote) -> WalletResult<ClaimOutcome> {
        Err(WalletError::Unsupported("claims".into()))
    }

    async fn withdrawal_fee_quote(&self, _address: &str, amount: u64) -> WalletResult<WithdrawalQuote> {
        let tier = |total: u64, fee_rate: u64| TierQuote { service_fee: 0, network_fee: total, total, fee_rate };
        Ok(WithdrawalQuote {
            id: "quote-1".into(),
            amount,
            expires_at: None,
            slow: tier(150, 2),
            medium: tier(300, 5),
            fast: tier(600, 12),
        })
    }

    async fn withdraw(&self, request: WithdrawRequest) -> WalletResult<Withdrawal> {
        lock(&self.withdrawals).push(request);
        Ok(Withdrawal { id: "withdrawal-1".into(), status: PaymentStatus::Pending })
    }
}

#[async_trait]
impl PaymentNotifications for MockProvider {
    async fn subscribe_payment_received(&self) -> WalletResult<mpsc::Receiver<PaymentReceived>> {
        lock(&self.push).take().ok_or_else(|| WalletError::Unsupported("payment notifications".into()))
    }
}

// =============================================================================
// LNURL resolver
// =============================================================================

#[derive(Default)]
pub struct MockResolver {
    pub requests: Mutex<Vec<(String, u64)>>,
    pub lnurl_requests: Mutex<Vec<(String, u64)>>,
    fail: AtomicBool,
    /// Hand back an invoice for this many sats instead of the requested amount
    wrong_amount: Mutex<Option<u64>>,
}

impl MockResolver {
    pub fn failing() -> Self {
        let resolver = Self::default();
        resolver.fail.store(true, Ordering::SeqCst);
        resolver
    }

    pub fn with_wrong_amount(self, sats: u64) -> Self {
        *lock(&self.wrong_amount) = Some(sats);
        self
    }

    fn invoice(&self, amount_sats: u64) -> WalletResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WalletError::backend("Lightning address service unreachable"));
        }
        Ok(signed_invoice(Some(lock(&self.wrong_amount).unwrap_or(amount_sats))))
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl LightningAddressResolver for MockResolver {
    async fn request_invoice(&self, address: &str, amount_sats: u64, _comment: Option<&str>) -> WalletResult<String> {
        let invoice = self.invoice(amount_sats)?;
        lock(&self.requests).push((address.to_string(), amount_sats));
        Ok(invoice)
    }

    async fn request_lnurl_invoice(&self, lnurl: &str, amount_sats: u64, _comment: Option<&str>) -> WalletResult<String> {
        let invoice = self.invoice(amount_sats)?;
        lock(&self.lnurl_requests).push((lnurl.to_string(), amount_sats));
        Ok(invoice)
    }
}

// =============================================================================
// Wallet directory
// =============================================================================

#[derive(Default)]
pub struct MockDirectory {
    wallets: Mutex<HashMap<String, WalletConfig>>,
    providers: Mutex<HashMap<String, Arc<dyn WalletProvider>>>,
}

impl MockDirectory {
    pub fn with(self, wallet: WalletConfig, provider: Arc<dyn WalletProvider>) -> Self {
        lock(&self.providers).insert(wallet.id.clone(), provider);
        lock(&self.wallets).insert(wallet.id.clone(), wallet);
        self
    }
}

impl WalletDirectory for MockDirectory {
    fn wallet(&self, id: &str) -> Option<WalletConfig> {
        lock(&self.wallets).get(id).cloned()
    }

    fn provider(&self, id: &str) -> Option<Arc<dyn WalletProvider>> {
        lock(&self.providers).get(id).cloned()
    }
}

// =============================================================================
// In-memory NWC wallet service
// =============================================================================

pub struct MockNwcWallet {
    pub info: Mutex<NwcInfo>,
    pub balance_msat: AtomicU64,
    pub invoices: Mutex<Vec<NwcTransaction>>,
    pub history: Mutex<Vec<NwcTransaction>>,
    pub payments: Mutex<Vec<(String, Option<u64>)>>,
    pub lookup_fails: AtomicBool,
    pub closed: AtomicBool,
}

impl Default for MockNwcWallet {
    fn default() -> Self {
        Self {
            info: Mutex::new(NwcInfo {
                alias: Some("Alby Hub".into()),
                pubkey: Some("02abc".into()),
                network: Some("mainnet".into()),
                methods: ["get_info", "get_balance", "make_invoice", "pay_invoice", "lookup_invoice", "list_transactions"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect(),
                lud16: Some("alice@getalby.com".into()),
                ..Default::default()
            }),
            balance_msat: AtomicU64::new(150_000_000),
            invoices: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            payments: Mutex::new(Vec::new()),
            lookup_fails: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl NwcTransport for MockNwcWallet {
    async fn get_info(&self) -> WalletResult<NwcInfo> {
        Ok(lock(&self.info).clone())
    }

    async fn get_balance(&self) -> WalletResult<u64> {
        Ok(self.balance_msat.load(Ordering::SeqCst))
    }

    async fn make_invoice(&self, amount_msat: u64, description: &str, expiry_secs: u64) -> WalletResult<NwcTransaction> {
        let tx = NwcTransaction {
            kind: Some("incoming".into()),
            invoice: Some(format!("lnbc{}n1nwc", amount_msat / 1000)),
            description: Some(description.to_string()),
            payment_hash: Some(format!("{:064x}", lock(&self.invoices).len() + 1)),
            amount: Some(amount_msat as i64),
            created_at: Some(1_700_000_000),
            expires_at: Some(1_700_000_000 + expiry_secs as i64),
            ..Default::default()
        };
        lock(&self.invoices).push(tx.clone());
        Ok(tx)
    }

    async fn pay_invoice(&self, invoice: &str, amount_msat: Option<u64>) -> WalletResult<NwcPayResult> {
        lock(&self.payments).push((invoice.to_string(), amount_msat));
        Ok(NwcPayResult { preimage: "11".repeat(32), fees_paid: Some(3_000) })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> WalletResult<NwcTransaction> {
        if self.lookup_fails.load(Ordering::SeqCst) {
            return Err(WalletError::backend("NOT_FOUND"));
        }
        lock(&self.invoices)
            .iter()
            .find(|tx| tx.payment_hash.as_deref() == Some(payment_hash))
            .cloned()
            .ok_or_else(|| WalletError::NotFound("invoice".into()))
    }

    async fn list_transactions(&self, query: NwcListQuery) -> WalletResult<Vec<NwcTransaction>> {
        let history = lock(&self.history);
        Ok(history
            .iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn subscribe_notifications(&self) -> WalletResult<mpsc::Receiver<NwcNotification>> {
        Err(WalletError::Unsupported("notifications".into()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one shared wallet; the first `failures` handshakes fail.
pub struct MockNwcConnector {
    pub wallet: Arc<MockNwcWallet>,
    failures: AtomicU32,
    pub opens: AtomicU32,
}

impl MockNwcConnector {
    pub fn new(wallet: Arc<MockNwcWallet>) -> Self {
        Self { wallet, failures: AtomicU32::new(0), opens: AtomicU32::new(0) }
    }

    pub fn failing_first(self, failures: u32) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NwcConnector for MockNwcConnector {
    async fn open(&self, _uri: &NwcUri) -> WalletResult<Arc<dyn NwcTransport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(WalletError::Connection("relay handshake timed out".into()));
        }
        let transport: Arc<dyn NwcTransport> = self.wallet.clone();
        Ok(transport)
    }
}
