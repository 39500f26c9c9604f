//! AutoWithdraw - sweep a wallet's excess balance to a configured destination
//!
//! Runs after every balance refresh. The guards (enabled, threshold, in-flight,
//! cooldown) are evaluated and the in-flight mark is taken under one
//! synchronous lock, so two concurrent refreshes of the same wallet can never
//! both pass them.
//!
//! | Wallet kind | Payout | Route |
//! |-------------|--------|-------|
//! | Spark | lightning | `SparkTransfers::pay_lightning_address` |
//! | Spark | onchain | `OnchainWallet::withdrawal_fee_quote` → `withdraw` |
//! | NWC / LNBits | lightning | LNURL-pay invoice → `pay_invoice` |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{read_json_or_default, write_json, WithdrawPolicy};
use crate::error::{WalletError, WalletResult};
use crate::lnurl::{check_invoice_amount, LightningAddressResolver};
use crate::metadata::MetadataSink;
use crate::provider::{FeeTier, PayInvoiceRequest, WalletKind, WalletProvider, WithdrawRequest};
use crate::wallet_config::WalletConfig;

pub const AUTO_WITHDRAW_TAG: &str = "auto-withdraw";

/// Lookup surface the control loop needs from the wallet store.
pub trait WalletDirectory: Send + Sync {
    fn wallet(&self, id: &str) -> Option<WalletConfig>;
    fn provider(&self, id: &str) -> Option<Arc<dyn WalletProvider>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutType {
    #[default]
    Lightning,
    Onchain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSpeed {
    Low,
    #[default]
    Medium,
    High,
}

impl FeeSpeed {
    pub fn tier(&self) -> FeeTier {
        match self {
            FeeSpeed::Low => FeeTier::Slow,
            FeeSpeed::Medium => FeeTier::Medium,
            FeeSpeed::High => FeeTier::Fast,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeeSpeed::Low => "Economy",
            FeeSpeed::Medium => "Standard",
            FeeSpeed::High => "Priority",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoWithdrawConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "thresholdSats")]
    pub threshold_sats: u64,
    #[serde(default, alias = "payoutType")]
    pub payout_type: PayoutType,
    #[serde(default, alias = "lightningAddress")]
    pub lightning_address: String,
    #[serde(default, alias = "bitcoinAddress")]
    pub bitcoin_address: String,
    #[serde(default, alias = "feeSpeed")]
    pub fee_speed: FeeSpeed,
    /// Unix ms of the last successful sweep
    #[serde(default, alias = "lastTriggeredAt")]
    pub last_triggered_at: Option<i64>,
}

impl AutoWithdrawConfig {
    pub fn lightning(threshold_sats: u64, address: impl Into<String>) -> Self {
        Self { enabled: true, threshold_sats, lightning_address: address.into(), ..Default::default() }
    }

    pub fn onchain(threshold_sats: u64, address: impl Into<String>, speed: FeeSpeed) -> Self {
        Self {
            enabled: true,
            threshold_sats,
            payout_type: PayoutType::Onchain,
            bitcoin_address: address.into(),
            fee_speed: speed,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WithdrawOutcome {
    Success {
        amount: u64,
        /// Display form, long addresses shortened
        destination: String,
        wallet_name: String,
        /// Quoted on-chain fee, when there was one
        fee: Option<u64>,
    },
    Error {
        message: String,
        wallet_name: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    configs: BTreeMap<String, AutoWithdrawConfig>,
}

#[derive(Default)]
struct Inner {
    configs: BTreeMap<String, AutoWithdrawConfig>,
    in_flight: HashSet<String>,
    last_trigger: HashMap<String, Instant>,
    last_results: HashMap<String, WithdrawOutcome>,
}

pub struct AutoWithdraw {
    policy: WithdrawPolicy,
    resolver: Arc<dyn LightningAddressResolver>,
    metadata: Arc<dyn MetadataSink>,
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

/// Releases the in-flight mark however the payout ends.
struct InFlight<'a> {
    owner: &'a AutoWithdraw,
    wallet_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.owner.lock().in_flight.remove(&self.wallet_id);
    }
}

struct Payout {
    reference: Option<String>,
    destination: String,
    fee: Option<u64>,
}

impl AutoWithdraw {
    pub fn new(
        policy: WithdrawPolicy,
        resolver: Arc<dyn LightningAddressResolver>,
        metadata: Arc<dyn MetadataSink>,
        path: Option<PathBuf>,
    ) -> Self {
        let file = path.as_deref().map(read_json_or_default::<ConfigFile>).unwrap_or_default();
        let inner = Inner { configs: file.configs, ..Default::default() };
        Self { policy, resolver, metadata, path, inner: Mutex::new(inner) }
    }

    pub fn config(&self, wallet_id: &str) -> Option<AutoWithdrawConfig> {
        self.lock().configs.get(wallet_id).cloned()
    }

    pub fn configs(&self) -> BTreeMap<String, AutoWithdrawConfig> {
        self.lock().configs.clone()
    }

    pub fn is_processing(&self, wallet_id: &str) -> bool {
        self.lock().in_flight.contains(wallet_id)
    }

    /// Destinations are checked only when the config is enabled.
    pub fn save_config(&self, wallet_id: &str, mut config: AutoWithdrawConfig) -> WalletResult<()> {
        config.lightning_address = config.lightning_address.trim().to_string();
        config.bitcoin_address = config.bitcoin_address.trim().to_string();
        if config.enabled {
            validate(&config)?;
        }
        let mut inner = self.lock();
        inner.configs.insert(wallet_id.to_string(), config);
        self.persist(&inner)
    }

    /// Also forgets in-flight and cooldown state for the wallet.
    pub fn remove_config(&self, wallet_id: &str) -> WalletResult<()> {
        let mut inner = self.lock();
        inner.in_flight.remove(wallet_id);
        inner.last_trigger.remove(wallet_id);
        inner.last_results.remove(wallet_id);
        if inner.configs.remove(wallet_id).is_some() {
            self.persist(&inner)?;
        }
        Ok(())
    }

    pub fn last_result(&self, wallet_id: &str) -> Option<WithdrawOutcome> {
        self.lock().last_results.get(wallet_id).cloned()
    }

    /// `None` when a guard or the dust floor stopped it; otherwise what happened.
    pub async fn check_and_execute(
        &self,
        wallet_id: &str,
        balance: u64,
        wallets: &dyn WalletDirectory,
    ) -> Option<WithdrawOutcome> {
        let (config, _guard) = self.claim(wallet_id, balance)?;

        let wallet = wallets.wallet(wallet_id)?;
        let amount = balance * self.policy.send_percent / 100;
        if amount < self.policy.min_send_sats {
            tracing::debug!(wallet_id, amount, "auto-withdraw below dust floor");
            return None;
        }

        tracing::info!(wallet_id, amount, payout = ?config.payout_type, "auto-withdraw triggered");
        let outcome = match self.payout(&wallet, amount, &config, wallets).await {
            Ok(payout) => {
                self.annotate(&payout, amount, &config);
                self.mark_triggered(wallet_id);
                tracing::info!(wallet_id, amount, destination = %payout.destination, "auto-withdraw sent");
                WithdrawOutcome::Success {
                    amount,
                    destination: truncate_destination(&payout.destination),
                    wallet_name: wallet.name.clone(),
                    fee: payout.fee,
                }
            }
            Err(e) => {
                tracing::warn!(wallet_id, error = %e, "auto-withdraw failed");
                WithdrawOutcome::Error { message: e.to_string(), wallet_name: wallet.name.clone() }
            }
        };

        self.lock().last_results.insert(wallet_id.to_string(), outcome.clone());
        Some(outcome)
    }

    /// Guards 1-4 plus the in-flight mark, with no suspension point in between.
    fn claim(&self, wallet_id: &str, balance: u64) -> Option<(AutoWithdrawConfig, InFlight<'_>)> {
        let mut inner = self.lock();
        let config = inner.configs.get(wallet_id).filter(|c| c.enabled)?.clone();
        if config.threshold_sats == 0 || balance <= config.threshold_sats {
            return None;
        }
        if inner.in_flight.contains(wallet_id) {
            return None;
        }
        if inner
            .last_trigger
            .get(wallet_id)
            .is_some_and(|at| at.elapsed() < self.policy.cooldown)
        {
            return None;
        }
        inner.in_flight.insert(wallet_id.to_string());
        inner.last_trigger.insert(wallet_id.to_string(), Instant::now());
        Some((config, InFlight { owner: self, wallet_id: wallet_id.to_string() }))
    }

    async fn payout(
        &self,
        wallet: &WalletConfig,
        amount: u64,
        config: &AutoWithdrawConfig,
        wallets: &dyn WalletDirectory,
    ) -> WalletResult<Payout> {
        let provider = wallets
            .provider(&wallet.id)
            .ok_or_else(|| WalletError::NotFound("Wallet provider not available".into()))?;

        if wallet.resolved_kind() == WalletKind::Spark {
            if config.payout_type == PayoutType::Onchain {
                return self.onchain_payout(provider.as_ref(), amount, config).await;
            }
            let address = lightning_destination(config)?;
            let transfers = provider
                .spark_transfers()
                .ok_or_else(|| WalletError::Unsupported("Lightning-address payments".into()))?;
            let payment = transfers.pay_lightning_address(address, amount, None).await?;
            return Ok(Payout {
                reference: payment.reference().map(str::to_string),
                destination: address.to_string(),
                fee: None,
            });
        }

        let address = lightning_destination(config)?;
        let invoice = self.resolver.request_invoice(address, amount, None).await?;
        check_invoice_amount(&invoice, amount)?;
        let payment = provider.pay_invoice(PayInvoiceRequest::new(invoice)).await?;
        let reference = payment
            .payment_hash
            .clone()
            .or(payment.id.clone())
            .or(payment.preimage.clone())
            .filter(|s| !s.is_empty());
        Ok(Payout { reference, destination: address.to_string(), fee: None })
    }

    async fn onchain_payout(
        &self,
        provider: &dyn WalletProvider,
        amount: u64,
        config: &AutoWithdrawConfig,
    ) -> WalletResult<Payout> {
        if config.bitcoin_address.is_empty() {
            return Err(WalletError::validation("bitcoin_address", "No Bitcoin address configured"));
        }
        let onchain = provider
            .onchain()
            .ok_or_else(|| WalletError::Unsupported("On-chain withdrawals".into()))?;
        let tier = config.fee_speed.tier();
        let quote = onchain.withdrawal_fee_quote(&config.bitcoin_address, amount).await?;
        let withdrawal = onchain
            .withdraw(WithdrawRequest {
                address: config.bitcoin_address.clone(),
                amount,
                tier,
                quote_id: quote.id.clone(),
            })
            .await?;
        Ok(Payout {
            reference: Some(withdrawal.id).filter(|id| !id.is_empty()),
            destination: config.bitcoin_address.clone(),
            fee: Some(quote.tier(tier).total),
        })
    }

    /// Tag and note are written independently; failures are logged and otherwise ignored.
    fn annotate(&self, payout: &Payout, amount: u64, config: &AutoWithdrawConfig) {
        let Some(tx_id) = payout.reference.as_deref() else { return };
        let fee_label = match config.payout_type {
            PayoutType::Onchain => format!(" ({} fee)", config.fee_speed.label()),
            PayoutType::Lightning => String::new(),
        };
        let note = format!(
            "Automatic transfer \u{b7} {} sats sent to {}{}",
            group_thousands(amount),
            truncate_destination(&payout.destination),
            fee_label
        );
        if let Err(e) = self.metadata.add_tag(tx_id, AUTO_WITHDRAW_TAG) {
            tracing::warn!(tx_id, error = %e, "tagging auto-withdraw transaction failed");
        }
        if let Err(e) = self.metadata.set_note(tx_id, &note) {
            tracing::warn!(tx_id, error = %e, "noting auto-withdraw transaction failed");
        }
    }

    fn mark_triggered(&self, wallet_id: &str) {
        let mut inner = self.lock();
        if let Some(config) = inner.configs.get_mut(wallet_id) {
            config.last_triggered_at = Some(chrono::Utc::now().timestamp_millis());
        }
        if let Err(e) = self.persist(&inner) {
            tracing::warn!(wallet_id, error = %e, "persisting auto-withdraw config failed");
        }
    }

    fn persist(&self, inner: &Inner) -> WalletResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        write_json(path, &ConfigFile { configs: inner.configs.clone() })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn lightning_destination(config: &AutoWithdrawConfig) -> WalletResult<&str> {
    if config.lightning_address.is_empty() {
        return Err(WalletError::validation("lightning_address", "No Lightning address configured"));
    }
    Ok(&config.lightning_address)
}

fn is_lightning_address(address: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(address))
}

fn validate(config: &AutoWithdrawConfig) -> WalletResult<()> {
    if config.threshold_sats == 0 {
        return Err(WalletError::validation("threshold_sats", "Threshold must be greater than zero"));
    }
    match config.payout_type {
        PayoutType::Lightning if !is_lightning_address(&config.lightning_address) => {
            Err(WalletError::validation("lightning_address", "Enter a valid Lightning address (name@domain)"))
        }
        PayoutType::Onchain => {
            bitcoin::Address::<bitcoin::address::NetworkUnchecked>::from_str(&config.bitcoin_address)
                .map_err(|e| WalletError::validation("bitcoin_address", format!("Invalid Bitcoin address: {e}")))?;
            Ok(())
        }
        PayoutType::Lightning => Ok(()),
    }
}

/// Lightning addresses and short values verbatim; long addresses as `first8...last6`.
pub fn truncate_destination(destination: &str) -> String {
    if destination.is_empty() {
        return "unknown".into();
    }
    if destination.contains('@') || destination.chars().count() <= 20 {
        return destination.to_string();
    }
    let chars: Vec<char> = destination.chars().collect();
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}...{tail}")
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_truncation() {
        assert_eq!(truncate_destination("alice@getalby.com"), "alice@getalby.com");
        assert_eq!(truncate_destination("short"), "short");
        assert_eq!(
            truncate_destination("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"),
            "bc1qar0s...wf5mdq"
        );
        assert_eq!(truncate_destination(""), "unknown");
    }

    #[test]
    fn thousands_separator() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(970), "970");
        assert_eq!(group_thousands(9_700), "9,700");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn speed_maps_to_tier_and_label() {
        assert_eq!(FeeSpeed::Low.tier(), FeeTier::Slow);
        assert_eq!(FeeSpeed::High.tier(), FeeTier::Fast);
        assert_eq!(FeeSpeed::Medium.label(), "Standard");
    }

    #[test]
    fn validation_rules() {
        assert!(validate(&AutoWithdrawConfig::lightning(1_000, "alice@getalby.com")).is_ok());
        assert!(validate(&AutoWithdrawConfig::lightning(1_000, "not-an-address")).is_err());
        assert!(validate(&AutoWithdrawConfig::lightning(0, "alice@getalby.com")).is_err());
        assert!(validate(&AutoWithdrawConfig::onchain(
            1_000,
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
            FeeSpeed::Low
        ))
        .is_ok());
        assert!(validate(&AutoWithdrawConfig::onchain(1_000, "bc1qnotreal", FeeSpeed::Low)).is_err());
    }

    #[test]
    fn legacy_config_file_reads() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"configs":{"w1":{"enabled":true,"thresholdSats":5000,"payoutType":"onchain","bitcoinAddress":"bc1q","feeSpeed":"high","lastTriggeredAt":null}}}"#,
        )
        .unwrap();
        let config = &file.configs["w1"];
        assert_eq!(config.threshold_sats, 5_000);
        assert_eq!(config.payout_type, PayoutType::Onchain);
        assert_eq!(config.fee_speed, FeeSpeed::High);
    }
}
