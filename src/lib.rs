//! Buho: multi-wallet Lightning orchestration. One trait, three backends.
//!
//! # Architecture
//!
//! ```text
//! WalletStore (entry point, wallets.json)
//!   │
//!   ├── WalletFactory ──► Arc<dyn WalletProvider>
//!   │     ├── SparkProvider   (self-custodial SDK, sealed seed, unlock by PIN)
//!   │     ├── NwcProvider     (NIP-47 over a relay transport, with retries)
//!   │     └── LnbitsProvider  (hosted REST wallet)
//!   │
//!   ├── TransactionMetadataStore (notes, tags, contacts per transaction)
//!   ├── AddressBook (named lightning and Spark addresses)
//!   │
//!   └── AutoWithdraw (threshold sweeps after each balance refresh)
//!         ├── LnurlResolver     (lightning address → invoice)
//!         └── MempoolExplorer   (fee rates, tx status)
//!
//! PaymentMonitor  ── watches one invoice until paid, expired or timed out
//! BalancePoller   ── refresh_all on an interval until shutdown
//! grouping        ── folds micropayment bursts into history groups
//! ```
//!
//! # Provider surface
//!
//! | Operation | Method | Notes |
//! |-----------|--------|-------|
//! | connect | `provider.connect()` | idempotent |
//! | balance | `provider.get_balance()` | sats |
//! | receive | `provider.create_invoice(req)` | bolt11 |
//! | send | `provider.pay_invoice(req)` | fee in sats |
//! | history | `provider.get_transactions(page)` | newest first |
//!
//! # Features
//!
//! - `native` - tokio runtime, filesystem, HTTP backends, CLI
//! - `nostr` - relay-backed NWC transport (NIP-47, NIP-04)
//!
//! # Usage
//!
//! ```ignore
//! use buho::{Backends, BuhoConfig, WalletStore};
//!
//! let config = BuhoConfig::from_env();
//! let store = WalletStore::open(config.clone(), Backends::native(&config)?);
//! let wallet = store.add_nwc_wallet("nostr+walletconnect://...", None).await?;
//! let balance = store.refresh_balance(&wallet.id).await?;
//! ```

// =============================================================================
// Shared modules (compile everywhere)
// =============================================================================
pub mod error;

// =============================================================================
// Native-only modules (network, filesystem, tokio)
// =============================================================================
#[cfg(feature = "native")]
pub mod config;
#[cfg(feature = "native")]
pub mod contacts;
#[cfg(feature = "native")]
pub mod explorer;
#[cfg(feature = "native")]
pub mod factory;
#[cfg(feature = "native")]
pub mod grouping;
#[cfg(feature = "native")]
pub mod lnurl;
#[cfg(feature = "native")]
pub mod logging;
#[cfg(feature = "native")]
pub mod metadata;
#[cfg(feature = "native")]
pub mod monitor;
#[cfg(feature = "native")]
pub mod poller;
#[cfg(feature = "native")]
pub mod provider;
#[cfg(feature = "native")]
pub mod runtime;
#[cfg(feature = "native")]
pub mod store;
#[cfg(feature = "native")]
pub mod vault;
#[cfg(feature = "native")]
pub mod wallet_config;
#[cfg(feature = "native")]
pub mod withdraw;
#[cfg(feature = "nostr")]
pub mod nostr;

// =============================================================================
// Re-exports: Shared
// =============================================================================
pub use error::{ErrorCategory, WalletError, WalletResult};

// =============================================================================
// Re-exports: Native
// =============================================================================
#[cfg(feature = "native")]
pub use config::{BuhoConfig, FeePolicy, GroupingOptions, MonitorConfig, PaymentWait, RetryPolicy, WithdrawPolicy};
#[cfg(feature = "native")]
pub use contacts::{AddressBook, AddressType, Contact, ContactUpdate, NewContact};
#[cfg(feature = "native")]
pub use metadata::{MetadataSink, TransactionMetadata, TransactionMetadataStore};
#[cfg(feature = "native")]
pub use grouping::{group_transactions, HistoryEntry, TransactionGroup};
#[cfg(feature = "native")]
pub use factory::{
    create_spark_provider, create_wallet_provider, parse_payment_destination, Backends, DestinationKind,
    PaymentDestination,
};
#[cfg(feature = "native")]
pub use monitor::{MonitorEvent, MonitorStatus, PaymentMonitor, WatchedInvoice};
#[cfg(feature = "native")]
pub use poller::BalancePoller;
#[cfg(feature = "native")]
pub use provider::{
    Balance, CreateInvoiceRequest, Direction, Invoice, InvoiceLookup, LnbitsProvider, NwcProvider, Page,
    PayInvoiceRequest, Payment, PaymentStatus, SparkProvider, TransactionRecord, WalletInfo, WalletKind,
    WalletProvider,
};
#[cfg(feature = "native")]
pub use runtime::{install_signal_handlers, Shutdown};
#[cfg(feature = "native")]
pub use store::{RefreshReport, StoreState, WalletStore};
#[cfg(feature = "native")]
pub use wallet_config::{ConnectionData, WalletConfig, WalletMetadata};
#[cfg(feature = "native")]
pub use withdraw::{AutoWithdraw, AutoWithdrawConfig, FeeSpeed, PayoutType, WalletDirectory, WithdrawOutcome};

#[cfg(feature = "nostr")]
pub use nostr::{RelayClient, RelayNwcConnector};
