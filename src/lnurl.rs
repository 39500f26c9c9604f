//! Lightning-address and LNURL-pay resolution
//!
//! `name@domain` → `GET /.well-known/lnurlp/name`, or a bech32 `lnurl1…` link
//! decoded to its URL, then the callback with `amount` in msat → BOLT11
//! invoice. Shared by every wallet kind's auto-withdraw payout and by the
//! self-custodial provider's `pay_lightning_address`.
//!
//! Every invoice handed back is decoded and must commit to exactly the
//! requested amount.

use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::bech32;
use lightning_invoice::Bolt11Invoice;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{WalletError, WalletResult};

const DEFAULT_MIN_SENDABLE_MSAT: u64 = 1_000;
const DEFAULT_MAX_SENDABLE_MSAT: u64 = 100_000_000_000;
const PAY_REQUEST_TAG: &str = "payRequest";
const DEFAULT_DESCRIPTION: &str = "LNURL payment";

#[async_trait]
pub trait LightningAddressResolver: Send + Sync {
    /// Invoice for exactly `amount_sats`, payable to `address`.
    async fn request_invoice(
        &self,
        address: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> WalletResult<String>;

    /// Invoice for exactly `amount_sats` from a bech32 `lnurl1…` pay link.
    async fn request_lnurl_invoice(
        &self,
        lnurl: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> WalletResult<String> {
        let _ = (lnurl, amount_sats, comment);
        Err(WalletError::Unsupported("bech32 LNURL strings".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayParams {
    tag: Option<String>,
    callback: Option<String>,
    min_sendable: Option<u64>,
    max_sendable: Option<u64>,
    #[serde(default)]
    comment_allowed: usize,
    #[serde(default)]
    metadata: Value,
    status: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackResponse {
    pr: Option<String>,
    status: Option<String>,
    reason: Option<String>,
}

/// Sendable range in whole sats, rounded inward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendableRange {
    pub min_sats: u64,
    pub max_sats: u64,
}

impl SendableRange {
    fn from_msat(min: Option<u64>, max: Option<u64>) -> Self {
        let min = min.unwrap_or(DEFAULT_MIN_SENDABLE_MSAT);
        let max = max.unwrap_or(DEFAULT_MAX_SENDABLE_MSAT);
        Self { min_sats: min.div_ceil(1000), max_sats: max / 1000 }
    }

    pub fn check(&self, amount_sats: u64) -> WalletResult<()> {
        if amount_sats < self.min_sats || amount_sats > self.max_sats {
            return Err(WalletError::validation(
                "amount",
                format!(
                    "Amount must be between {} and {} sats",
                    self.min_sats, self.max_sats
                ),
            ));
        }
        Ok(())
    }
}

/// Parameters of an LNURL-pay endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PayRequest {
    pub callback: String,
    pub range: SendableRange,
    pub comment_allowed: usize,
    /// `text/plain` entry of the metadata
    pub description: String,
}

#[derive(Clone)]
pub struct LnurlResolver {
    client: reqwest::Client,
}

impl LnurlResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> WalletResult<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Http(format!("{what} returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| WalletError::backend(format!("{what}: {e}")))
    }

    /// Fetch pay parameters from `url`. `require_tag` rejects anything but LNURL-pay.
    pub async fn fetch_pay_request(&self, url: &str, require_tag: bool) -> WalletResult<PayRequest> {
        let params: PayParams = self.get_json(self.client.get(url), "LNURL lookup").await?;
        if params.status.as_deref() == Some("ERROR") {
            return Err(WalletError::backend(
                params.reason.unwrap_or_else(|| "LNURL lookup failed".into()),
            ));
        }
        if require_tag && params.tag.as_deref() != Some(PAY_REQUEST_TAG) {
            return Err(WalletError::Unsupported("LNURL types other than LNURL-pay".into()));
        }
        let callback = params
            .callback
            .filter(|c| !c.is_empty())
            .ok_or_else(|| WalletError::backend("LNURL has no callback"))?;
        Ok(PayRequest {
            callback,
            range: SendableRange::from_msat(params.min_sendable, params.max_sendable),
            comment_allowed: params.comment_allowed,
            description: metadata_description(&params.metadata),
        })
    }

    async fn invoice_from_callback(
        &self,
        pay: &PayRequest,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> WalletResult<String> {
        pay.range.check(amount_sats)?;

        let mut query = vec![("amount", (amount_sats * 1000).to_string())];
        if let Some(comment) = comment.filter(|c| !c.is_empty() && pay.comment_allowed > 0) {
            query.push(("comment", truncate_chars(comment, pay.comment_allowed)));
        }

        let invoice: CallbackResponse = self
            .get_json(self.client.get(&pay.callback).query(&query), "LNURL callback")
            .await?;
        if invoice.status.as_deref() == Some("ERROR") {
            return Err(WalletError::backend(
                invoice.reason.unwrap_or_else(|| "Failed to get invoice".into()),
            ));
        }
        let pr = invoice
            .pr
            .filter(|pr| !pr.is_empty())
            .ok_or_else(|| WalletError::backend("No invoice returned from LNURL callback"))?;
        check_invoice_amount(&pr, amount_sats)?;
        Ok(pr)
    }
}

#[async_trait]
impl LightningAddressResolver for LnurlResolver {
    async fn request_invoice(
        &self,
        address: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> WalletResult<String> {
        let (user, domain) = split_lightning_address(address)?;
        let endpoint = lnurlp_endpoint(&user, &domain);
        tracing::debug!(%endpoint, amount_sats, "resolving lightning address");

        let pay = self.fetch_pay_request(&endpoint, false).await?;
        self.invoice_from_callback(&pay, amount_sats, comment).await
    }

    async fn request_lnurl_invoice(
        &self,
        lnurl: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> WalletResult<String> {
        let url = decode_lnurl(lnurl)?;
        tracing::debug!(%url, amount_sats, "resolving lnurl");

        let pay = self.fetch_pay_request(&url, true).await?;
        self.invoice_from_callback(&pay, amount_sats, comment).await
    }
}

/// Bech32 `lnurl1…` (optionally `lightning:`-prefixed, any case) → URL.
pub fn decode_lnurl(input: &str) -> WalletResult<String> {
    let raw = strip_lightning_scheme(input);
    let invalid = |reason: String| WalletError::validation("lnurl", format!("Failed to decode LNURL: {reason}"));
    let (hrp, data) = bech32::decode(&raw.to_lowercase()).map_err(|e| invalid(e.to_string()))?;
    if !hrp.as_str().eq_ignore_ascii_case("lnurl") {
        return Err(invalid(format!("unexpected prefix {}", hrp.as_str())));
    }
    String::from_utf8(data).map_err(|e| invalid(e.to_string()))
}

/// `text/plain` entry of LNURL metadata, given as a JSON string or array.
pub fn metadata_description(metadata: &Value) -> String {
    let parsed = match metadata {
        Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    parsed
        .as_array()
        .and_then(|entries| {
            entries.iter().find_map(|entry| match entry.as_array().map(Vec::as_slice) {
                Some([kind, text, ..]) if kind.as_str() == Some("text/plain") => text.as_str().map(str::to_string),
                _ => None,
            })
        })
        .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string())
}

/// A BOLT11 invoice handed back for a payout must carry exactly `amount_sats`.
pub fn check_invoice_amount(invoice: &str, amount_sats: u64) -> WalletResult<()> {
    let raw = strip_lightning_scheme(invoice);
    let decoded = Bolt11Invoice::from_str(raw)
        .map_err(|e| WalletError::validation("invoice", format!("Returned invoice could not be decoded: {e}")))?;
    match decoded.amount_milli_satoshis() {
        Some(msat) if msat == amount_sats.saturating_mul(1000) => Ok(()),
        Some(msat) => Err(WalletError::validation(
            "invoice",
            format!("Returned invoice is for {msat} msat, expected {amount_sats} sats"),
        )),
        None => Err(WalletError::validation("invoice", "Returned invoice carries no amount")),
    }
}

/// `name@domain` → (`name`, `domain`), lowercased.
pub fn split_lightning_address(address: &str) -> WalletResult<(String, String)> {
    let address = address.trim().to_lowercase();
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(domain), None) if !user.is_empty() && domain.contains('.') => {
            Ok((user.to_string(), domain.to_string()))
        }
        _ => Err(WalletError::validation("lightning_address", "Invalid lightning address format")),
    }
}

/// Loopback hosts are reached over plain http; everything else over https.
pub fn lnurlp_endpoint(user: &str, domain: &str) -> String {
    let scheme = if is_loopback_host(domain) { "http" } else { "https" };
    format!("{scheme}://{domain}/.well-known/lnurlp/{user}")
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    let host = host.split(['/', ':']).next().unwrap_or_default();
    host == "localhost" || host == "127.0.0.1"
}

fn strip_lightning_scheme(input: &str) -> &str {
    let trimmed = input.trim();
    match trimmed.get(..10) {
        Some(scheme) if scheme.eq_ignore_ascii_case("lightning:") => trimmed[10..].trim(),
        _ => trimmed,
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_lowercases() {
        let (user, domain) = split_lightning_address(" Alice@Wallet.Example ").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(domain, "wallet.example");
        assert!(split_lightning_address("alice@nodot").is_err());
        assert!(split_lightning_address("@domain.com").is_err());
        assert!(split_lightning_address("a@b@c.com").is_err());
    }

    #[test]
    fn endpoint_scheme() {
        assert_eq!(
            lnurlp_endpoint("bob", "getalby.com"),
            "https://getalby.com/.well-known/lnurlp/bob"
        );
        assert_eq!(
            lnurlp_endpoint("bob", "127.0.0.1:3000"),
            "http://127.0.0.1:3000/.well-known/lnurlp/bob"
        );
    }

    #[test]
    fn sendable_range_rounds_inward() {
        let range = SendableRange::from_msat(Some(1_500), Some(2_000_999));
        assert_eq!(range, SendableRange { min_sats: 2, max_sats: 2_000 });
        assert!(range.check(1).is_err());
        assert!(range.check(2).is_ok());
        assert!(range.check(2_001).is_err());

        let defaults = SendableRange::from_msat(None, None);
        assert_eq!(defaults.min_sats, 1);
        assert_eq!(defaults.max_sats, 100_000_000);
    }

    fn signed_invoice(amount_sats: Option<u64>) -> String {
        use bitcoin::hashes::{sha256, Hash};
        use bitcoin::secp256k1::{Secp256k1, SecretKey};
        use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x41; 32]).unwrap();
        let builder = InvoiceBuilder::new(Currency::Bitcoin)
            .description("payout".into())
            .payment_hash(sha256::Hash::hash(b"payout"))
            .payment_secret(PaymentSecret([42; 32]))
            .current_timestamp()
            .min_final_cltv_expiry_delta(144);
        let builder = match amount_sats {
            Some(sats) => builder.amount_milli_satoshis(sats * 1000),
            None => builder,
        };
        builder
            .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key))
            .unwrap()
            .to_string()
    }

    #[test]
    fn invoice_must_match_requested_amount() {
        let invoice = signed_invoice(Some(1_940));
        assert!(check_invoice_amount(&invoice, 1_940).is_ok());
        assert!(check_invoice_amount(&format!("lightning:{invoice}"), 1_940).is_ok());

        let err = check_invoice_amount(&signed_invoice(Some(250_000)), 1_940).unwrap_err();
        assert!(matches!(err, WalletError::Validation { field: "invoice", .. }));
        assert!(check_invoice_amount(&signed_invoice(None), 1_940).is_err());
        assert!(check_invoice_amount("lnbc1940n1garbage", 1_940).is_err());
    }

    #[test]
    fn lnurl_decodes_to_url() {
        let url = "https://service.example/lnurlp/abc?tag=pay";
        let hrp = bech32::Hrp::parse("lnurl").unwrap();
        let encoded = bech32::encode::<bech32::Bech32>(hrp, url.as_bytes()).unwrap();

        assert_eq!(decode_lnurl(&encoded).unwrap(), url);
        assert_eq!(decode_lnurl(&format!("LIGHTNING:{}", encoded.to_uppercase())).unwrap(), url);

        let other = bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("lnbc").unwrap(), b"x").unwrap();
        assert!(decode_lnurl(&other).is_err());
        assert!(decode_lnurl("lnurl1notbech32").is_err());
    }

    #[test]
    fn metadata_text_entry() {
        let raw = Value::String(r#"[["text/identifier","a@b.c"],["text/plain","Tip jar"]]"#.into());
        assert_eq!(metadata_description(&raw), "Tip jar");
        assert_eq!(metadata_description(&serde_json::json!([["text/plain", "Inline"]])), "Inline");
        assert_eq!(metadata_description(&Value::String("not json".into())), "LNURL payment");
        assert_eq!(metadata_description(&Value::Null), "LNURL payment");
    }
}
