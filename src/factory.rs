//! WalletFactory - provider construction and payment-destination classification

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::{BuhoConfig, FeePolicy, PaymentWait, RetryPolicy};
use crate::error::{WalletError, WalletResult};
use crate::explorer::{ChainData, MempoolExplorer};
use crate::lnurl::{LightningAddressResolver, LnurlResolver};
use crate::provider::{
    is_spark_address, LnbitsConnection, LnbitsProvider, NwcConnector, NwcProvider, NwcUri,
    SparkConnection, SparkConnector, SparkProvider, WalletKind, WalletProvider,
};
use crate::wallet_config::WalletConfig;

/// Everything a provider may need beyond its own record.
#[derive(Clone)]
pub struct Backends {
    pub http: reqwest::Client,
    pub nwc: Arc<dyn NwcConnector>,
    /// Absent when no self-custodial SDK is linked in
    pub spark: Option<Arc<dyn SparkConnector>>,
    pub chain: Arc<dyn ChainData>,
    pub lnurl: Arc<dyn LightningAddressResolver>,
    pub fees: FeePolicy,
    pub payment_wait: PaymentWait,
    pub nwc_retry: RetryPolicy,
}

impl Backends {
    /// Explorer and LNURL resolver over `http`, tunables from `config`.
    pub fn new(config: &BuhoConfig, http: reqwest::Client, nwc: Arc<dyn NwcConnector>) -> Self {
        Self {
            chain: Arc::new(MempoolExplorer::new(http.clone(), config.explorer_url.clone())),
            lnurl: Arc::new(LnurlResolver::new(http.clone())),
            http,
            nwc,
            spark: None,
            fees: config.fees.clone(),
            payment_wait: config.payment_wait.clone(),
            nwc_retry: config.nwc_retry.clone(),
        }
    }

    /// Relay-backed NIP-47 sessions and a default HTTP client.
    #[cfg(feature = "nostr")]
    pub fn native(config: &BuhoConfig) -> WalletResult<Self> {
        const HTTP_TIMEOUT_SECS: u64 = 30;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("buho/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::new(config, http, Arc::new(crate::nostr::RelayNwcConnector::new())))
    }

    pub fn with_spark(mut self, connector: Arc<dyn SparkConnector>) -> Self {
        self.spark = Some(connector);
        self
    }

    pub fn with_chain(mut self, chain: Arc<dyn ChainData>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_lnurl(mut self, lnurl: Arc<dyn LightningAddressResolver>) -> Self {
        self.lnurl = lnurl;
        self
    }
}

/// Dispatch on the record's (possibly inferred) type.
pub fn create_wallet_provider(config: &WalletConfig, backends: &Backends) -> WalletResult<Arc<dyn WalletProvider>> {
    check_id(config)?;
    match config.resolved_kind() {
        WalletKind::Spark => {
            let provider: Arc<dyn WalletProvider> = create_spark_provider(config, backends)?;
            Ok(provider)
        }
        WalletKind::Nwc => {
            let url = config
                .connection_data
                .nwc_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| WalletError::validation("nwc_url", "NWC wallet requires nwcUrl"))?;
            let provider = NwcProvider::new(&config.id, NwcUri::parse(url)?, backends.nwc.clone())
                .with_retry(backends.nwc_retry.clone());
            Ok(Arc::new(provider))
        }
        WalletKind::Lnbits => {
            let data = &config.connection_data;
            let (server_url, admin_key) = match (&data.server_url, &data.admin_key) {
                (Some(url), Some(key)) if !url.trim().is_empty() && !key.is_empty() => (url.clone(), key.clone()),
                _ => {
                    return Err(WalletError::validation(
                        "connection_data",
                        "LNBits wallet requires serverUrl and adminKey",
                    ))
                }
            };
            let connection = LnbitsConnection {
                server_url,
                wallet_id: data.wallet_id.clone().unwrap_or_default(),
                admin_key,
            };
            let provider = LnbitsProvider::new(&config.id, connection, backends.http.clone()).with_name(&config.name);
            Ok(Arc::new(provider))
        }
    }
}

/// Concrete self-custodial handle; the store keeps it to unlock and lock the session.
pub fn create_spark_provider(config: &WalletConfig, backends: &Backends) -> WalletResult<Arc<SparkProvider>> {
    check_id(config)?;
    let connector = backends
        .spark
        .clone()
        .ok_or_else(|| WalletError::Unsupported("self-custodial wallets need an SDK connector".into()))?;
    let connection = SparkConnection { network: config.connection_data.network.unwrap_or_default() };
    let provider = SparkProvider::new(&config.id, connection, connector, backends.chain.clone(), backends.lnurl.clone())
        .with_fee_policy(backends.fees.clone())
        .with_payment_wait(backends.payment_wait.clone());
    Ok(Arc::new(provider))
}

fn check_id(config: &WalletConfig) -> WalletResult<()> {
    if config.id.trim().is_empty() {
        return Err(WalletError::validation("id", "Invalid wallet configuration: missing id"));
    }
    Ok(())
}

// =============================================================================
// Destination classification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    #[serde(rename = "spark_address")]
    Spark,
    #[serde(rename = "lightning_invoice")]
    Invoice,
    LightningAddress,
    Lnurl,
    #[serde(rename = "bitcoin_address")]
    Bitcoin,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDestination {
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    /// Input with the URI scheme stripped
    pub value: String,
    pub valid: bool,
    pub supported: bool,
    pub is_zero_fee: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PaymentDestination {
    fn new(kind: DestinationKind, value: impl Into<String>) -> Self {
        Self { kind, value: value.into(), valid: true, supported: true, is_zero_fee: false, message: None }
    }

    fn unknown(value: impl Into<String>) -> Self {
        Self { valid: false, supported: false, ..Self::new(DestinationKind::Unknown, value) }
    }
}

pub const ONCHAIN_UNSUPPORTED: &str = "On-chain Bitcoin addresses are not supported. Use Lightning or Spark addresses.";

const INVOICE_PREFIXES: &[&str] = &["lnbcrt", "lntbs", "lnbc", "lntb"];

fn is_legacy_address(input: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[123mn][a-km-zA-HJ-NP-Z1-9]{25,34}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(input))
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    let head = input.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme).then(|| &input[scheme.len()..])
}

fn is_lightning_address(input: &str) -> bool {
    let mut parts = input.split('@');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(name), Some(domain), None) if !name.is_empty() && domain.contains('.') && !domain.starts_with('.')
    )
}

fn is_bitcoin_address(lower: &str, original: &str) -> bool {
    ["bc1", "tb1", "bcrt1"].iter().any(|p| lower.starts_with(p)) || is_legacy_address(original)
}

/// Shape-based; never fails, never validates checksums.
pub fn parse_payment_destination(input: &str) -> PaymentDestination {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return PaymentDestination::unknown("");
    }

    let (value, bip21) = if let Some(rest) = strip_scheme(trimmed, "lightning:") {
        (rest.trim(), false)
    } else if let Some(rest) = strip_scheme(trimmed, "bitcoin:") {
        (rest.split('?').next().unwrap_or_default().trim(), true)
    } else {
        (trimmed, false)
    };
    let lower = value.to_lowercase();

    if !bip21 && is_spark_address(value) {
        return PaymentDestination { is_zero_fee: true, ..PaymentDestination::new(DestinationKind::Spark, value) };
    }
    if INVOICE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return PaymentDestination::new(DestinationKind::Invoice, value);
    }
    if is_lightning_address(value) {
        return PaymentDestination::new(DestinationKind::LightningAddress, lower);
    }
    if lower.starts_with("lnurl1") {
        return PaymentDestination::new(DestinationKind::Lnurl, value);
    }
    if is_bitcoin_address(&lower, value) {
        return PaymentDestination {
            supported: false,
            message: Some(ONCHAIN_UNSUPPORTED.into()),
            ..PaymentDestination::new(DestinationKind::Bitcoin, value)
        };
    }
    PaymentDestination::unknown(value)
}
