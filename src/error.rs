//! Error taxonomy shared by providers, the monitor, auto-withdraw and the store.
//!
//! Every failure is scoped to the operation that raised it. Nothing here is
//! process-fatal; callers decide whether to retry, fall back to cached data,
//! or surface the error.

use serde::Serialize;

use crate::provider::WalletKind;

/// Result type
pub type WalletResult<T> = Result<T, WalletError>;

/// Wallet orchestration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    /// Operation requires a live backend session
    #[error("{0} wallet is not connected")]
    NotConnected(WalletKind),

    /// Backend unreachable or rejected the session
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Self-custodial wallet has no decrypted seed in memory
    #[error("Wallet is locked")]
    Locked,

    /// Bad input, checkable before any network call
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Hosted REST API returned a non-2xx response
    #[error("LNBits API error: {detail}")]
    Api { status: u16, detail: String },

    /// HTTP transport failure (DNS, TLS, body decode)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Opaque backend failure, with a structured code when the backend supplies one
    #[error("{message}")]
    Backend { code: Option<String>, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// A fee or claim quote passed its expiry before it was used
    #[error("Quote expired: {0}")]
    QuoteExpired(String),

    /// Local persistence failure (state file, metadata file, vault)
    #[error("Storage error: {0}")]
    Storage(String),
}

impl WalletError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { field, reason: reason.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { code: None, message: message.into() }
    }

    pub fn backend_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend { code: Some(code.into()), message: message.into() }
    }

    /// Structured backend code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Coarse kind for a presentation layer to turn into friendly text.
    ///
    /// Typed variants classify directly. Opaque backend and HTTP messages fall
    /// back to keyword matching because the backends do not share a vocabulary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected(_) | Self::Connection(_) | Self::Http(_) | Self::Timeout(_) => {
                ErrorCategory::Connectivity
            }
            Self::Locked => ErrorCategory::Locked,
            Self::InsufficientFunds(_) => ErrorCategory::Funds,
            Self::QuoteExpired(_) => ErrorCategory::Fee,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Validation { field, reason } => match *field {
                "address" | "lightning_address" | "bitcoin_address" | "spark_address" => {
                    ErrorCategory::Address
                }
                "amount" => ErrorCategory::Amount,
                "invoice" => classify_message(reason).unwrap_or(ErrorCategory::InvoiceExpired),
                _ => classify_message(reason).unwrap_or(ErrorCategory::Other),
            },
            Self::Api { detail, .. } => classify_message(detail).unwrap_or(ErrorCategory::Other),
            Self::Backend { message, .. } => {
                classify_message(message).unwrap_or(ErrorCategory::Other)
            }
            Self::Unsupported(_) | Self::Storage(_) => ErrorCategory::Other,
        }
    }
}

/// Friendly-message buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Funds,
    Amount,
    Address,
    InvoiceExpired,
    Connectivity,
    Locked,
    NotReady,
    NotConfirmed,
    NotFound,
    Fee,
    Other,
}

/// Ordered keyword table; first match wins.
const MESSAGE_CATEGORIES: &[(&[&str], ErrorCategory)] = &[
    (&["insufficient", "not enough", "balance too low"], ErrorCategory::Funds),
    (&["expired", "expiry"], ErrorCategory::InvoiceExpired),
    (&["address"], ErrorCategory::Address),
    (&["amount", "minimum", "maximum"], ErrorCategory::Amount),
    (&["timeout", "timed out", "network", "connect", "offline", "unreachable"], ErrorCategory::Connectivity),
    (&["locked", "unlock"], ErrorCategory::Locked),
    (&["not initialized", "not ready", "initializing"], ErrorCategory::NotReady),
    (&["confirmation", "unconfirmed", "confirming"], ErrorCategory::NotConfirmed),
    (&["not found", "no route", "unknown"], ErrorCategory::NotFound),
    (&["fee"], ErrorCategory::Fee),
];

fn classify_message(message: &str) -> Option<ErrorCategory> {
    let lower = message.to_lowercase();
    MESSAGE_CATEGORIES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, category)| *category)
}

#[cfg(feature = "native")]
impl From<reqwest::Error> for WalletError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
