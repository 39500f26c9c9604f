//! Block-explorer / rate collaborator (mempool.space-compatible API)
//!
//! The self-custodial provider needs fee-rate tiers for withdrawal quotes and
//! confirmation counts for deposits. Both come from an explorer whose base URL
//! is derived from the configured rate API; if that host fails the public
//! instance is tried before giving up.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};
use crate::provider::FeeTier;

pub const DEFAULT_API_URL: &str = "https://mempool.space/api/v1";
pub const FALLBACK_EXPLORER_URL: &str = "https://mempool.space/api";

/// sat/vB per confirmation tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub slow: u64,
    pub medium: u64,
    pub fast: u64,
}

impl FeeRates {
    pub fn for_tier(&self, tier: FeeTier) -> u64 {
        match tier {
            FeeTier::Slow => self.slow,
            FeeTier::Medium => self.medium,
            FeeTier::Fast => self.fast,
        }
    }
}

/// Chain observations the self-custodial provider depends on.
#[async_trait]
pub trait ChainData: Send + Sync {
    async fn fee_rates(&self) -> WalletResult<FeeRates>;
    async fn confirmations(&self, txid: &str) -> WalletResult<u32>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: u64,
    half_hour_fee: u64,
    hour_fee: u64,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    #[serde(default)]
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Clone)]
pub struct MempoolExplorer {
    client: reqwest::Client,
    api_url: String,
}

impl MempoolExplorer {
    pub fn new(client: reqwest::Client, api_url: Option<String>) -> Self {
        let api_url = api_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self { client, api_url }
    }

    /// Configured rate API (`.../api/v1`)
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Explorer root derived from the rate API (`.../api`)
    pub fn explorer_base(&self) -> String {
        explorer_base(&self.api_url)
    }

    /// BTC price per fiat currency code.
    pub async fn prices(&self) -> WalletResult<HashMap<String, f64>> {
        let raw: HashMap<String, serde_json::Value> = self.get_json("/v1/prices").await?;
        Ok(raw
            .into_iter()
            .filter_map(|(code, v)| v.as_f64().map(|price| (code, price)))
            .filter(|(code, _)| code != "time")
            .collect())
    }

    async fn tip_height(&self) -> WalletResult<u64> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.trim()
            .parse()
            .map_err(|_| WalletError::backend(format!("unexpected tip height: {text}")))
    }

    fn bases(&self) -> Vec<String> {
        let primary = self.explorer_base();
        if primary == FALLBACK_EXPLORER_URL {
            vec![primary]
        } else {
            vec![primary, FALLBACK_EXPLORER_URL.to_string()]
        }
    }

    async fn get_text(&self, path: &str) -> WalletResult<String> {
        let mut last_err = WalletError::Http("no explorer configured".into());
        for base in self.bases() {
            let url = format!("{base}{path}");
            match self.fetch(&url).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "explorer request failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> WalletResult<T> {
        let text = self.get_text(path).await?;
        serde_json::from_str(&text)
            .map_err(|e| WalletError::backend(format!("explorer response {path}: {e}")))
    }

    async fn fetch(&self, url: &str) -> WalletResult<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Http(format!("{url} returned {status}")));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ChainData for MempoolExplorer {
    async fn fee_rates(&self) -> WalletResult<FeeRates> {
        let fees: RecommendedFees = self.get_json("/v1/fees/recommended").await?;
        Ok(FeeRates { slow: fees.hour_fee, medium: fees.half_hour_fee, fast: fees.fastest_fee })
    }

    async fn confirmations(&self, txid: &str) -> WalletResult<u32> {
        let status: TxStatus = self.get_json(&format!("/tx/{txid}/status")).await?;
        let height = match (status.confirmed, status.block_height) {
            (true, Some(height)) => height,
            _ => return Ok(0),
        };
        let tip = self.tip_height().await?;
        Ok(tip.saturating_sub(height).saturating_add(1).min(u32::MAX as u64) as u32)
    }
}

fn explorer_base(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
}
