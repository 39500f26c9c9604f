//! Configuration - every tunable constant, passed down from the binary or embedding app.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration. The binary builds this from env; embedders use the builders.
#[derive(Debug, Clone)]
pub struct BuhoConfig {
    pub data_dir: PathBuf,
    pub explorer_url: Option<String>,
    pub poll_interval: Duration,
    pub monitor: MonitorConfig,
    pub grouping: GroupingOptions,
    pub fees: FeePolicy,
    pub withdraw: WithdrawPolicy,
    pub nwc_retry: RetryPolicy,
    pub payment_wait: PaymentWait,
}

impl Default for BuhoConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            explorer_url: None,
            poll_interval: Duration::from_secs(30),
            monitor: MonitorConfig::default(),
            grouping: GroupingOptions::default(),
            fees: FeePolicy::default(),
            withdraw: WithdrawPolicy::default(),
            nwc_retry: RetryPolicy::default(),
            payment_wait: PaymentWait::default(),
        }
    }
}

impl BuhoConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Defaults overlaid with `BUHO_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_string("BUHO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.explorer_url = env_string("BUHO_EXPLORER_URL");
        if let Some(secs) = env_string("BUHO_POLL_SECS").and_then(|s| s.parse::<u64>().ok()) {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = env_string("BUHO_NWC_RETRIES").and_then(|s| s.parse::<u32>().ok()) {
            config.nwc_retry.attempts = attempts.max(1);
        }
        config
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self { self.data_dir = dir.into(); self }
    pub fn with_explorer_url(mut self, url: impl Into<String>) -> Self { self.explorer_url = Some(url.into()); self }
    pub fn with_poll_interval(mut self, interval: Duration) -> Self { self.poll_interval = interval; self }
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self { self.monitor = monitor; self }
    pub fn with_grouping(mut self, grouping: GroupingOptions) -> Self { self.grouping = grouping; self }
    pub fn with_fees(mut self, fees: FeePolicy) -> Self { self.fees = fees; self }
    pub fn with_withdraw(mut self, withdraw: WithdrawPolicy) -> Self { self.withdraw = withdraw; self }
    pub fn with_nwc_retry(mut self, retry: RetryPolicy) -> Self { self.nwc_retry = retry; self }
    pub fn with_payment_wait(mut self, wait: PaymentWait) -> Self { self.payment_wait = wait; self }

    pub fn state_path(&self) -> PathBuf { self.data_dir.join("wallets.json") }
    pub fn auto_withdraw_path(&self) -> PathBuf { self.data_dir.join("auto_withdraw.json") }
    pub fn metadata_path(&self) -> PathBuf { self.data_dir.join("transaction_metadata.json") }
    pub fn address_book_path(&self) -> PathBuf { self.data_dir.join("address_book.json") }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn default_data_dir() -> PathBuf {
    env_string("BUHO_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("buho"))
}

/// PaymentMonitor polling schedule
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub max_attempts: u32,
    /// Invoices are treated as expired this long before their stated expiry
    pub expiry_buffer: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1500),
            max_interval: Duration::from_millis(6000),
            backoff_multiplier: 1.25,
            max_attempts: 35,
            expiry_buffer: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn with_initial_interval(mut self, d: Duration) -> Self { self.initial_interval = d; self }
    pub fn with_max_interval(mut self, d: Duration) -> Self { self.max_interval = d; self }
    pub fn with_backoff(mut self, multiplier: f64) -> Self { self.backoff_multiplier = multiplier; self }
    pub fn with_max_attempts(mut self, attempts: u32) -> Self { self.max_attempts = attempts; self }
    pub fn with_expiry_buffer(mut self, d: Duration) -> Self { self.expiry_buffer = d; self }
}

/// Transaction grouping heuristics
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingOptions {
    pub time_window_seconds: i64,
    /// Jaccard threshold in 0..=1
    pub description_similarity: f64,
    pub min_group_size: usize,
    pub max_group_size: usize,
    pub enabled: bool,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            time_window_seconds: 3600,
            description_similarity: 0.75,
            min_group_size: 2,
            max_group_size: 50,
            enabled: true,
        }
    }
}

/// Self-custodial fee policy. Historical deployments used (5 sats, 17 bps) and
/// (10 sats, 100 bps); both are just configurations of this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct FeePolicy {
    pub min_fee_sats: u64,
    pub fee_bps: u64,
    /// Safety margin applied to a live backend estimate, in percent
    pub estimate_margin_percent: u64,
    /// Amount used for the fee basis when an invoice carries none
    pub fallback_amount_sats: u64,
    /// Assumed size of a withdrawal transaction
    pub withdraw_vbytes: u64,
    pub min_deposit_confirmations: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_fee_sats: 5,
            fee_bps: 17,
            estimate_margin_percent: 50,
            fallback_amount_sats: 10_000,
            withdraw_vbytes: 141,
            min_deposit_confirmations: 3,
        }
    }
}

impl FeePolicy {
    pub fn legacy() -> Self {
        Self { min_fee_sats: 10, fee_bps: 100, ..Default::default() }
    }
}

/// AutoWithdraw constants
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawPolicy {
    pub cooldown: Duration,
    pub min_send_sats: u64,
    /// Share of the balance swept, leaving headroom for routing fees
    pub send_percent: u64,
}

impl Default for WithdrawPolicy {
    fn default() -> Self {
        Self { cooldown: Duration::from_secs(60), min_send_sats: 10, send_percent: 97 }
    }
}

/// Bounded retry for flaky handshakes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, delay: Duration::from_secs(2) }
    }
}

/// Send-side completion wait (no invoice expiry to anchor on)
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentWait {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PaymentWait {
    fn default() -> Self {
        Self { interval: Duration::from_secs(3), timeout: Duration::from_secs(60) }
    }
}

// =============================================================================
// Persistence helpers
// =============================================================================

/// Read a JSON file; missing or malformed files yield `T::default()`.
pub(crate) fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &std::path::Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "state file unreadable, using defaults");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Pretty JSON, parent directories created on demand.
pub(crate) fn write_json<T: serde::Serialize + ?Sized>(
    path: &std::path::Path,
    value: &T,
) -> crate::error::WalletResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
