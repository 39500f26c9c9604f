//! WalletStore - owns every configured wallet and its live provider
//!
//! ```text
//!   wallets.json ◄── StoreState ──► sorted / default / active views
//!                        │
//!           providers: id → Arc<dyn WalletProvider>   (lazy, per wallet)
//!           spark:     Arc<SparkProvider>             (only while unlocked)
//!                        │
//!   refresh_balance ─────┴──► cached balance ──► AutoWithdraw::check_and_execute
//! ```
//!
//! Locks are synchronous and never held across an `.await`.

mod state;

pub use state::{generate_wallet_id, StoreState, RATES_TTL_MS};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use zeroize::Zeroizing;

use crate::config::{write_json, BuhoConfig};
use crate::contacts::{AddressBook, Contact};
use crate::error::{WalletError, WalletResult};
use crate::factory::{
    create_spark_provider, create_wallet_provider, parse_payment_destination, Backends, DestinationKind,
    ONCHAIN_UNSUPPORTED,
};
use crate::grouping::{group_transactions, HistoryEntry};
use crate::lnurl::check_invoice_amount;
use crate::metadata::TransactionMetadataStore;
use crate::provider::{
    Balance, CreateInvoiceRequest, Invoice, InvoiceLookup, LnbitsProvider, NwcUri, Page, PayInvoiceRequest,
    Payment, SparkNetwork, SparkProvider, TransactionRecord, WalletKind, WalletProvider,
};
use crate::vault;
use crate::wallet_config::{ConnectionData, WalletConfig};
use crate::withdraw::{AutoWithdraw, WalletDirectory};

/// Outcome of one wallet's refresh inside [`WalletStore::refresh_all`].
#[derive(Debug)]
pub struct RefreshReport {
    pub wallet_id: String,
    pub result: WalletResult<Balance>,
}

pub struct WalletStore {
    config: BuhoConfig,
    backends: Backends,
    state: Mutex<StoreState>,
    providers: Mutex<HashMap<String, Arc<dyn WalletProvider>>>,
    spark: Mutex<Option<Arc<SparkProvider>>>,
    metadata: Arc<TransactionMetadataStore>,
    contacts: AddressBook,
    auto_withdraw: AutoWithdraw,
}

impl WalletStore {
    pub fn open(config: BuhoConfig, backends: Backends) -> Self {
        let state: StoreState = crate::config::read_json_or_default(&config.state_path());
        let metadata = Arc::new(TransactionMetadataStore::open(config.metadata_path()));
        let contacts = AddressBook::open(config.address_book_path());
        let auto_withdraw = AutoWithdraw::new(
            config.withdraw.clone(),
            backends.lnurl.clone(),
            metadata.clone(),
            Some(config.auto_withdraw_path()),
        );
        tracing::info!(wallets = state.wallets.len(), data_dir = %config.data_dir.display(), "wallet store opened");
        Self {
            config,
            backends,
            state: Mutex::new(state),
            providers: Mutex::new(HashMap::new()),
            spark: Mutex::new(None),
            metadata,
            contacts,
            auto_withdraw,
        }
    }

    pub fn config(&self) -> &BuhoConfig {
        &self.config
    }

    pub fn auto_withdraw(&self) -> &AutoWithdraw {
        &self.auto_withdraw
    }

    pub fn metadata(&self) -> &TransactionMetadataStore {
        &self.metadata
    }

    pub fn contacts(&self) -> &AddressBook {
        &self.contacts
    }

    /// Deletes the contact and unlinks it from every transaction it annotated.
    pub fn remove_contact(&self, id: &str) -> WalletResult<Contact> {
        let removed = self.contacts.remove(id)?;
        self.metadata.clear_contact(id)?;
        Ok(removed)
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn state(&self) -> StoreState {
        self.lock_state().clone()
    }

    pub fn wallets(&self) -> Vec<WalletConfig> {
        self.lock_state().wallets.clone()
    }

    pub fn wallet(&self, id: &str) -> Option<WalletConfig> {
        self.lock_state().wallet(id).cloned()
    }

    pub fn active_wallet(&self) -> Option<WalletConfig> {
        self.lock_state().active_wallet().cloned()
    }

    pub fn default_wallet(&self) -> Option<WalletConfig> {
        self.lock_state().default_wallet().cloned()
    }

    pub fn sorted_wallets(&self) -> Vec<WalletConfig> {
        self.lock_state().sorted_wallets()
    }

    pub fn total_balance(&self) -> u64 {
        self.lock_state().total_balance()
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_spark().as_ref().is_some_and(|p| p.is_unlocked())
    }

    // =========================================================================
    // Adding wallets
    // =========================================================================

    /// Credentials are checked against the server before anything is stored.
    pub async fn add_lnbits_wallet(
        &self,
        server_url: &str,
        wallet_id: &str,
        admin_key: &str,
        name: Option<&str>,
    ) -> WalletResult<WalletConfig> {
        let validated =
            LnbitsProvider::validate_credentials(&self.backends.http, server_url, wallet_id, admin_key).await?;
        {
            let state = self.lock_state();
            let duplicate = state.wallets.iter().any(|w| {
                w.connection_data.server_url.as_deref() == Some(validated.server_url.as_str())
                    && w.connection_data.wallet_id.as_deref() == Some(validated.wallet_id.as_str())
            });
            if duplicate {
                return Err(WalletError::validation("wallet", "This wallet is already connected"));
            }
        }

        let name = pick_name(name, Some(&validated.name), "LNBits Wallet");
        let mut wallet = WalletConfig::new(generate_wallet_id(), WalletKind::Lnbits, name).with_connection(
            ConnectionData {
                server_url: Some(validated.server_url.clone()),
                admin_key: Some(admin_key.trim().to_string()),
                wallet_id: Some(validated.wallet_id.clone()),
                ..Default::default()
            },
        );
        wallet.metadata.balance = Some(validated.balance);
        wallet.metadata.balance_updated_at = Some(now_ms());

        let provider = create_wallet_provider(&wallet, &self.backends)?;
        provider.connect().await?;
        self.commit_new(wallet, provider)
    }

    /// Connects (with retries) and reads info and balance before storing.
    pub async fn add_nwc_wallet(&self, nwc_url: &str, name: Option<&str>) -> WalletResult<WalletConfig> {
        let uri = NwcUri::parse(nwc_url)?;
        if self
            .lock_state()
            .wallets
            .iter()
            .any(|w| w.connection_data.nwc_url.as_deref() == Some(uri.as_str()))
        {
            return Err(WalletError::validation("nwc_url", "This wallet is already connected"));
        }

        let mut wallet = WalletConfig::new(generate_wallet_id(), WalletKind::Nwc, "").with_connection(ConnectionData {
            nwc_url: Some(uri.as_str().to_string()),
            ..Default::default()
        });
        let provider = create_wallet_provider(&wallet, &self.backends)?;
        provider.connect().await?;
        let info = provider.get_info().await?;
        let balance = provider.get_balance().await?;

        wallet.name = pick_name(name, info.alias.as_deref(), "Lightning Wallet");
        wallet.metadata.alias = Some(info.alias.clone().unwrap_or_else(|| "Unknown".into()));
        wallet.metadata.pubkey = info.pubkey.clone();
        wallet.metadata.network = Some(info.network.clone().unwrap_or_else(|| "mainnet".into()));
        wallet.metadata.methods = info.methods.clone();
        wallet.metadata.lud16 = info.lightning_address.clone();
        wallet.metadata.balance = Some(balance.balance);
        wallet.metadata.balance_updated_at = Some(now_ms());
        self.commit_new(wallet, provider)
    }

    /// Only one self-custodial wallet may exist; its seed is stored sealed under `pin`.
    pub async fn add_spark_wallet(
        &self,
        mnemonic: &str,
        pin: &str,
        network: SparkNetwork,
        name: Option<&str>,
    ) -> WalletResult<WalletConfig> {
        if self.lock_state().spark_wallet().is_some() {
            return Err(WalletError::validation("wallet", "Only one Spark wallet is supported"));
        }
        let phrase = bip39::Mnemonic::parse_normalized(mnemonic.trim())
            .map_err(|_| WalletError::validation("mnemonic", "Invalid recovery phrase"))?;
        let phrase = Zeroizing::new(phrase.to_string());
        let sealed = vault::seal(&phrase, pin)?;

        let mut wallet = WalletConfig::new(generate_wallet_id(), WalletKind::Spark, pick_name(name, None, "Spark Wallet"))
            .with_connection(ConnectionData {
                network: Some(network),
                encrypted_mnemonic: Some(sealed),
                ..Default::default()
            });
        wallet.metadata.network = Some(network.as_str().to_string());

        let provider = create_spark_provider(&wallet, &self.backends)?;
        provider.unlock(phrase).await?;
        if let Some(transfers) = provider.spark_transfers() {
            match transfers.spark_address().await {
                Ok(address) => wallet.metadata.spark_address = Some(address),
                Err(e) => tracing::warn!(error = %e, "spark address unavailable"),
            }
        }
        if let Ok(balance) = provider.get_balance().await {
            wallet.metadata.balance = Some(balance.balance);
            wallet.metadata.balance_updated_at = Some(now_ms());
        }

        *self.lock_spark() = Some(provider.clone());
        self.commit_new(wallet, provider)
    }

    fn commit_new(&self, wallet: WalletConfig, provider: Arc<dyn WalletProvider>) -> WalletResult<WalletConfig> {
        let stored = {
            let mut state = self.lock_state();
            let stored = state.insert(wallet);
            self.persist(&state)?;
            stored
        };
        self.lock_providers().insert(stored.id.clone(), provider);
        tracing::info!(wallet_id = %stored.id, kind = %stored.resolved_kind(), "wallet added");
        Ok(stored)
    }

    // =========================================================================
    // Managing wallets
    // =========================================================================

    /// Disconnects, forgets the provider and the auto-withdraw config, then repairs
    /// the active and default pointers.
    pub async fn remove_wallet(&self, id: &str) -> WalletResult<()> {
        if self.wallet(id).is_none() {
            return Err(WalletError::NotFound("Wallet not found".into()));
        }
        self.disconnect_wallet(id).await;
        self.lock_providers().remove(id);
        if self.lock_state().wallet(id).is_some_and(|w| w.resolved_kind() == WalletKind::Spark) {
            self.lock_spark().take();
        }
        if let Err(e) = self.auto_withdraw.remove_config(id) {
            tracing::warn!(wallet_id = id, error = %e, "removing auto-withdraw config failed");
        }

        let mut state = self.lock_state();
        state.remove(id);
        self.persist(&state)?;
        tracing::info!(wallet_id = id, "wallet removed");
        Ok(())
    }

    pub fn rename_wallet(&self, id: &str, name: &str) -> WalletResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WalletError::validation("name", "Wallet name must not be empty"));
        }
        let mut state = self.lock_state();
        let wallet = state.wallet_mut(id).ok_or_else(|| WalletError::NotFound("Wallet not found".into()))?;
        wallet.name = name.to_string();
        wallet.touch();
        self.persist(&state)
    }

    pub fn set_default_wallet(&self, id: &str) -> WalletResult<()> {
        let mut state = self.lock_state();
        if !state.set_default(id) {
            return Err(WalletError::NotFound("Wallet not found".into()));
        }
        self.persist(&state)
    }

    /// Marks the wallet active and makes sure it is connected.
    pub async fn set_active_wallet(&self, id: &str) -> WalletResult<()> {
        {
            let mut state = self.lock_state();
            if !state.set_active(id) {
                return Err(WalletError::NotFound("Wallet not found".into()));
            }
            self.persist(&state)?;
        }
        if let Err(e) = self.connect_wallet(id).await {
            tracing::warn!(wallet_id = id, error = %e, "active wallet not connected");
        }
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Live provider for `id`, created and connected on demand.
    pub async fn connect_wallet(&self, id: &str) -> WalletResult<Arc<dyn WalletProvider>> {
        let wallet = self.wallet(id).ok_or_else(|| WalletError::NotFound("Wallet not found".into()))?;
        let provider = match self.cached_provider(id) {
            Some(provider) => provider,
            None if wallet.resolved_kind() == WalletKind::Spark => return Err(WalletError::Locked),
            None => {
                let provider = create_wallet_provider(&wallet, &self.backends)?;
                self.lock_providers().insert(id.to_string(), provider.clone());
                provider
            }
        };
        provider.connect().await?;
        Ok(provider)
    }

    pub async fn disconnect_wallet(&self, id: &str) {
        if let Some(provider) = self.cached_provider(id) {
            provider.disconnect().await;
            tracing::info!(wallet_id = id, "wallet disconnected");
        }
    }

    /// Decrypt the self-custodial seed and open its session.
    pub async fn unlock(&self, pin: &str) -> WalletResult<()> {
        let wallet = self
            .lock_state()
            .spark_wallet()
            .cloned()
            .ok_or_else(|| WalletError::NotFound("No Spark wallet configured".into()))?;
        let sealed = wallet
            .connection_data
            .encrypted_mnemonic
            .as_ref()
            .ok_or_else(|| WalletError::Storage("Spark wallet has no stored seed".into()))?;
        let mnemonic = vault::open(sealed, pin)?;

        let cached = self.lock_spark().clone();
        let provider = match cached {
            Some(provider) => provider,
            None => create_spark_provider(&wallet, &self.backends)?,
        };
        provider.unlock(mnemonic).await?;
        *self.lock_spark() = Some(provider.clone());
        self.lock_providers().insert(wallet.id.clone(), provider);
        tracing::info!(wallet_id = %wallet.id, "spark wallet unlocked");
        Ok(())
    }

    /// Tear down the self-custodial session and drop the seed from memory.
    pub async fn lock(&self) {
        let provider = self.lock_spark().take();
        if let Some(provider) = provider {
            provider.disconnect().await;
            self.lock_providers().retain(|_, p| p.kind() != WalletKind::Spark);
            tracing::info!("spark wallet locked");
        }
    }

    // =========================================================================
    // Balances
    // =========================================================================

    /// Fetches, caches and persists the balance, then gives AutoWithdraw a look.
    pub async fn refresh_balance(&self, id: &str) -> WalletResult<Balance> {
        let provider = self.connect_wallet(id).await?;
        let balance = provider.get_balance().await?;
        {
            let mut state = self.lock_state();
            if let Some(wallet) = state.wallet_mut(id) {
                wallet.metadata.balance = Some(balance.balance);
                wallet.metadata.balance_updated_at = Some(now_ms());
            }
            self.persist(&state)?;
        }
        tracing::debug!(wallet_id = id, sats = balance.balance, "balance refreshed");
        self.auto_withdraw.check_and_execute(id, balance.balance, self).await;
        Ok(balance)
    }

    /// Refreshes every wallet concurrently; one failure never blocks the others.
    pub async fn refresh_all(&self) -> Vec<RefreshReport> {
        let ids: Vec<String> = self.lock_state().wallets.iter().map(|w| w.id.clone()).collect();
        let refreshes = ids.into_iter().map(|id| async move {
            let result = self.refresh_balance(&id).await;
            if let Err(e) = &result {
                tracing::warn!(wallet_id = %id, error = %e, "balance refresh failed");
            }
            RefreshReport { wallet_id: id, result }
        });
        futures_util::future::join_all(refreshes).await
    }

    pub fn set_exchange_rates(&self, rates: BTreeMap<String, f64>) -> WalletResult<()> {
        let mut state = self.lock_state();
        for (code, rate) in rates {
            state.exchange_rates.insert(code.to_lowercase(), rate);
        }
        state.rates_updated_at = Some(now_ms());
        self.persist(&state)
    }

    pub fn rates_are_fresh(&self) -> bool {
        self.lock_state().rates_are_fresh(now_ms())
    }

    pub fn set_currency_preferences(&self, fiat: &str, denomination: &str) -> WalletResult<()> {
        let mut state = self.lock_state();
        state.preferred_fiat_currency = fiat.trim().to_uppercase();
        state.denomination = denomination.trim().to_lowercase();
        self.persist(&state)
    }

    // =========================================================================
    // Payments on a wallet (default: active)
    // =========================================================================

    pub async fn create_invoice(&self, id: Option<&str>, request: CreateInvoiceRequest) -> WalletResult<Invoice> {
        let provider = self.resolve(id).await?;
        provider.create_invoice(request).await
    }

    pub async fn lookup_invoice(&self, id: Option<&str>, payment_hash: &str) -> WalletResult<InvoiceLookup> {
        let provider = self.resolve(id).await?;
        Ok(provider.lookup_invoice(payment_hash).await)
    }

    pub async fn transactions(&self, id: Option<&str>, page: Page) -> WalletResult<Vec<TransactionRecord>> {
        let provider = self.resolve(id).await?;
        Ok(provider.get_transactions(page).await)
    }

    pub async fn grouped_history(&self, id: Option<&str>, page: Page) -> WalletResult<Vec<HistoryEntry>> {
        let records = self.transactions(id, page).await?;
        Ok(group_transactions(&records, &self.config.grouping))
    }

    /// Pay whatever `destination` turns out to be.
    pub async fn pay(&self, id: Option<&str>, destination: &str, amount: Option<u64>) -> WalletResult<Payment> {
        let parsed = parse_payment_destination(destination);
        let provider = self.resolve(id).await?;
        match parsed.kind {
            DestinationKind::Invoice => {
                let mut request = PayInvoiceRequest::new(parsed.value);
                if let Some(sats) = amount {
                    request = request.with_amount(sats);
                }
                provider.pay_invoice(request).await
            }
            DestinationKind::Spark => {
                let sats = require_amount(amount)?;
                let transfers = provider
                    .spark_transfers()
                    .ok_or_else(|| WalletError::Unsupported("Spark transfers need a Spark wallet".into()))?;
                transfers.transfer_to_spark_address(&parsed.value, sats).await
            }
            DestinationKind::LightningAddress => {
                let sats = require_amount(amount)?;
                if let Some(transfers) = provider.spark_transfers() {
                    return transfers.pay_lightning_address(&parsed.value, sats, None).await;
                }
                let invoice = self.backends.lnurl.request_invoice(&parsed.value, sats, None).await?;
                check_invoice_amount(&invoice, sats)?;
                provider.pay_invoice(PayInvoiceRequest::new(invoice)).await
            }
            DestinationKind::Lnurl => {
                let sats = require_amount(amount)?;
                let invoice = self.backends.lnurl.request_lnurl_invoice(&parsed.value, sats, None).await?;
                check_invoice_amount(&invoice, sats)?;
                provider.pay_invoice(PayInvoiceRequest::new(invoice)).await
            }
            DestinationKind::Bitcoin => Err(WalletError::Unsupported(ONCHAIN_UNSUPPORTED.into())),
            DestinationKind::Unknown => Err(WalletError::validation("destination", "Unrecognized payment destination")),
        }
    }

    async fn resolve(&self, id: Option<&str>) -> WalletResult<Arc<dyn WalletProvider>> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self
                .lock_state()
                .active_wallet_id
                .clone()
                .ok_or_else(|| WalletError::NotFound("No active wallet".into()))?,
        };
        self.connect_wallet(&id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn cached_provider(&self, id: &str) -> Option<Arc<dyn WalletProvider>> {
        self.lock_providers().get(id).cloned()
    }

    fn persist(&self, state: &StoreState) -> WalletResult<()> {
        write_json(&self.config.state_path(), state).map_err(|e| {
            tracing::warn!(error = %e, "persisting wallet state failed");
            WalletError::Storage(format!("wallet state: {e}"))
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_providers(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn WalletProvider>>> {
        self.providers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_spark(&self) -> MutexGuard<'_, Option<Arc<SparkProvider>>> {
        self.spark.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl WalletDirectory for WalletStore {
    fn wallet(&self, id: &str) -> Option<WalletConfig> {
        WalletStore::wallet(self, id)
    }

    fn provider(&self, id: &str) -> Option<Arc<dyn WalletProvider>> {
        self.cached_provider(id)
    }
}

fn pick_name(given: Option<&str>, reported: Option<&str>, fallback: &str) -> String {
    [given, reported]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn require_amount(amount: Option<u64>) -> WalletResult<u64> {
    amount
        .filter(|a| *a > 0)
        .ok_or_else(|| WalletError::validation("amount", "An amount is required for this destination"))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_precedence() {
        assert_eq!(pick_name(Some(" Mine "), Some("Alby"), "Lightning Wallet"), "Mine");
        assert_eq!(pick_name(Some(""), Some("Alby"), "Lightning Wallet"), "Alby");
        assert_eq!(pick_name(None, None, "Lightning Wallet"), "Lightning Wallet");
    }

    #[test]
    fn amount_required() {
        assert!(require_amount(None).is_err());
        assert!(require_amount(Some(0)).is_err());
        assert_eq!(require_amount(Some(21)).unwrap(), 21);
    }
}
