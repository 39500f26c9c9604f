//! Persisted wallet records
//!
//! One [`WalletConfig`] per configured wallet. Keys are snake_case on disk;
//! camelCase aliases keep records written by older clients readable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::spark::SparkNetwork;
use crate::provider::WalletKind;
use crate::vault::EncryptedSeed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    pub id: String,
    /// Absent in legacy records; inferred from `connection_data` by the factory.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<WalletKind>,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "isDefault")]
    pub is_default: bool,
    /// Unix ms
    #[serde(default, alias = "createdAt")]
    pub created_at: i64,
    /// Unix ms
    #[serde(default, alias = "lastUsed")]
    pub last_used: i64,
    #[serde(default, alias = "connectionData")]
    pub connection_data: ConnectionData,
    #[serde(default)]
    pub metadata: WalletMetadata,
}

impl WalletConfig {
    pub fn new(id: impl Into<String>, kind: WalletKind, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            kind: Some(kind),
            name: name.into(),
            is_default: false,
            created_at: now,
            last_used: now,
            connection_data: ConnectionData::default(),
            metadata: WalletMetadata::default(),
        }
    }

    pub fn with_connection(mut self, data: ConnectionData) -> Self {
        self.connection_data = data;
        self
    }

    /// Declared type, else inferred from which connection fields are present.
    pub fn resolved_kind(&self) -> WalletKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        let data = &self.connection_data;
        if data.encrypted_mnemonic.is_some() {
            WalletKind::Spark
        } else if data.nwc_url.as_deref().is_some_and(|u| !u.is_empty()) {
            WalletKind::Nwc
        } else if data.server_url.is_some() && data.admin_key.is_some() {
            WalletKind::Lnbits
        } else {
            WalletKind::Nwc
        }
    }

    pub fn touch(&mut self) {
        self.last_used = chrono::Utc::now().timestamp_millis();
    }
}

/// Backend-specific fields; only those of the wallet's own kind are set.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<SparkNetwork>,
    #[serde(default, alias = "encryptedMnemonic", skip_serializing_if = "Option::is_none")]
    pub encrypted_mnemonic: Option<EncryptedSeed>,
    #[serde(default, alias = "nwcUrl", skip_serializing_if = "Option::is_none")]
    pub nwc_url: Option<String>,
    #[serde(default, alias = "serverUrl", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, alias = "adminKey", skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
    /// Hosted backend's own wallet id (distinct from our record id)
    #[serde(default, alias = "walletId", skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
}

impl std::fmt::Debug for ConnectionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionData")
            .field("network", &self.network)
            .field("encrypted_mnemonic", &self.encrypted_mnemonic.as_ref().map(|_| "<sealed>"))
            .field("nwc_url", &self.nwc_url.as_ref().map(|_| "<redacted>"))
            .field("server_url", &self.server_url)
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<redacted>"))
            .field("wallet_id", &self.wallet_id)
            .finish()
    }
}

/// Cached, protocol-reported facts. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    #[serde(default, alias = "sparkAddress", skip_serializing_if = "Option::is_none")]
    pub spark_address: Option<String>,
    /// sats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
    /// Unix ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_record_infers_kind() {
        let record: WalletConfig = serde_json::from_str(
            r#"{"id":"wallet-1","name":"Alby","isDefault":true,"connectionData":{"nwcUrl":"nostr+walletconnect://x"}}"#,
        )
        .unwrap();
        assert!(record.kind.is_none());
        assert!(record.is_default);
        assert_eq!(record.resolved_kind(), WalletKind::Nwc);

        let record: WalletConfig = serde_json::from_str(
            r#"{"id":"w","connection_data":{"server_url":"https://l","admin_key":"k"}}"#,
        )
        .unwrap();
        assert_eq!(record.resolved_kind(), WalletKind::Lnbits);

        let record: WalletConfig = serde_json::from_str(r#"{"id":"w"}"#).unwrap();
        assert_eq!(record.resolved_kind(), WalletKind::Nwc);
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let meta: WalletMetadata =
            serde_json::from_str(r##"{"alias":"node","color":"#fff","balance":21}"##).unwrap();
        assert_eq!(meta.balance, Some(21));
        assert_eq!(meta.extra.get("color"), Some(&Value::from("#fff")));
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["color"], "#fff");
    }

    #[test]
    fn debug_hides_secrets() {
        let data = ConnectionData {
            admin_key: Some("adminsecret".into()),
            nwc_url: Some("nostr+walletconnect://pk?secret=abc".into()),
            ..Default::default()
        };
        let rendered = format!("{data:?}");
        assert!(!rendered.contains("adminsecret"));
        assert!(!rendered.contains("secret=abc"));
    }
}
