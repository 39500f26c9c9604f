//! Persisted store state and the pure bookkeeping rules over it.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::provider::WalletKind;
use crate::wallet_config::WalletConfig;

/// Fiat rates older than this are refetched.
pub const RATES_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub wallets: Vec<WalletConfig>,
    #[serde(alias = "activeWalletId")]
    pub active_wallet_id: Option<String>,
    #[serde(alias = "preferredFiatCurrency")]
    pub preferred_fiat_currency: String,
    #[serde(alias = "denominationCurrency")]
    pub denomination: String,
    /// Lowercase currency code → fiat per BTC
    #[serde(alias = "exchangeRates")]
    pub exchange_rates: BTreeMap<String, f64>,
    /// Unix ms
    pub rates_updated_at: Option<i64>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            wallets: Vec::new(),
            active_wallet_id: None,
            preferred_fiat_currency: "USD".into(),
            denomination: "sats".into(),
            exchange_rates: BTreeMap::new(),
            rates_updated_at: None,
        }
    }
}

impl StoreState {
    pub fn wallet(&self, id: &str) -> Option<&WalletConfig> {
        self.wallets.iter().find(|w| w.id == id)
    }

    pub fn wallet_mut(&mut self, id: &str) -> Option<&mut WalletConfig> {
        self.wallets.iter_mut().find(|w| w.id == id)
    }

    pub fn active_wallet(&self) -> Option<&WalletConfig> {
        self.active_wallet_id.as_deref().and_then(|id| self.wallet(id))
    }

    /// The flagged default, else the first wallet.
    pub fn default_wallet(&self) -> Option<&WalletConfig> {
        self.wallets.iter().find(|w| w.is_default).or(self.wallets.first())
    }

    pub fn spark_wallet(&self) -> Option<&WalletConfig> {
        self.wallets.iter().find(|w| w.resolved_kind() == WalletKind::Spark)
    }

    /// Active first, then default, then most recently used.
    pub fn sorted_wallets(&self) -> Vec<WalletConfig> {
        let active = self.active_wallet_id.as_deref();
        let mut sorted = self.wallets.clone();
        sorted.sort_by_key(|w| (Some(w.id.as_str()) != active, !w.is_default, Reverse(w.last_used)));
        sorted
    }

    /// Sum of cached balances, in sats.
    pub fn total_balance(&self) -> u64 {
        self.wallets.iter().filter_map(|w| w.metadata.balance).sum()
    }

    /// The first wallet becomes default and active.
    pub fn insert(&mut self, mut wallet: WalletConfig) -> WalletConfig {
        if self.wallets.is_empty() {
            wallet.is_default = true;
            self.active_wallet_id = Some(wallet.id.clone());
        }
        self.wallets.push(wallet.clone());
        wallet
    }

    /// Drops the wallet and repairs the active and default pointers.
    pub fn remove(&mut self, id: &str) -> Option<WalletConfig> {
        let index = self.wallets.iter().position(|w| w.id == id)?;
        let removed = self.wallets.remove(index);

        if removed.is_default {
            if let Some(first) = self.wallets.first_mut() {
                first.is_default = true;
            }
        }
        if self.active_wallet_id.as_deref() == Some(id) {
            self.active_wallet_id = self.default_wallet().map(|w| w.id.clone());
        }
        Some(removed)
    }

    pub fn set_default(&mut self, id: &str) -> bool {
        if self.wallet(id).is_none() {
            return false;
        }
        for wallet in &mut self.wallets {
            wallet.is_default = wallet.id == id;
        }
        true
    }

    pub fn set_active(&mut self, id: &str) -> bool {
        match self.wallet_mut(id) {
            Some(wallet) => {
                wallet.touch();
                self.active_wallet_id = Some(id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn rates_are_fresh(&self, now_ms: i64) -> bool {
        !self.exchange_rates.is_empty()
            && self.rates_updated_at.is_some_and(|at| now_ms - at < RATES_TTL_MS)
    }
}

/// `wallet-{unix_ms}-{9 lowercase alphanumerics}`
pub fn generate_wallet_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("wallet-{}-{suffix}", chrono::Utc::now().timestamp_millis())
}
