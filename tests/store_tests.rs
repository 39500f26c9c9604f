//! WalletStore orchestration over in-memory NWC wallets, plus the BalancePoller.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use buho::lnurl::check_invoice_amount;
use buho::provider::nwc::NwcTransaction;
use buho::provider::{CreateInvoiceRequest, Page, SparkNetwork, WalletKind};
use buho::{
    AutoWithdrawConfig, BalancePoller, Backends, BuhoConfig, HistoryEntry, NewContact, RetryPolicy, Shutdown,
    StoreState, WalletConfig, WalletError, WalletStore, WithdrawOutcome,
};
use common::{nwc_uri, MockNwcConnector, MockNwcWallet, MockResolver};

const RELAY_A: &str = "wss://relay.getalby.com/v1";
const RELAY_B: &str = "wss://relay.damus.io";

struct Harness {
    _dir: tempfile::TempDir,
    wallet: Arc<MockNwcWallet>,
    resolver: Arc<MockResolver>,
    store: Arc<WalletStore>,
}

fn config(dir: &Path) -> BuhoConfig {
    BuhoConfig::new(dir).with_nwc_retry(RetryPolicy { attempts: 1, delay: Duration::from_millis(1) })
}

fn open(dir: &Path, wallet: Arc<MockNwcWallet>, resolver: Arc<MockResolver>) -> WalletStore {
    let config = config(dir);
    let backends = Backends::new(&config, reqwest::Client::new(), Arc::new(MockNwcConnector::new(wallet)))
        .with_lnurl(resolver);
    WalletStore::open(config, backends)
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MockNwcWallet::default());
    let resolver = Arc::new(MockResolver::default());
    let store = Arc::new(open(dir.path(), wallet.clone(), resolver.clone()));
    Harness { _dir: dir, wallet, resolver, store }
}

// =============================================================================
// Adding and managing wallets
// =============================================================================

/// Test: NWC wallets are named and described from get_info
#[tokio::test]
async fn add_nwc_wallet_reads_info() {
    let h = harness();
    let wallet = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    assert_eq!(wallet.name, "Alby Hub");
    assert_eq!(wallet.resolved_kind(), WalletKind::Nwc);
    assert!(wallet.id.starts_with("wallet-"));
    assert_eq!(wallet.metadata.alias.as_deref(), Some("Alby Hub"));
    assert_eq!(wallet.metadata.lud16.as_deref(), Some("alice@getalby.com"));
    assert_eq!(wallet.metadata.balance, Some(150_000));
    assert_eq!(wallet.metadata.methods.len(), 6);

    // First wallet becomes default and active
    assert!(wallet.is_default);
    assert_eq!(h.store.active_wallet().map(|w| w.id), Some(wallet.id.clone()));
}

/// Test: The same connection string cannot be added twice
#[tokio::test]
async fn duplicate_nwc_rejected() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");

    let err = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), Some("Again")).await.expect_err("duplicate");
    assert!(err.to_string().contains("already connected"));
    assert_eq!(h.store.wallets().len(), 1);
}

/// Test: Malformed connection strings fail before any handshake
#[tokio::test]
async fn malformed_nwc_rejected() {
    let h = harness();
    let err = h.store.add_nwc_wallet("https://not-nwc.example", None).await.expect_err("bad uri");
    assert!(matches!(err, WalletError::Validation { .. }));
    assert!(h.store.wallets().is_empty());
}

/// Test: Later wallets keep the existing default and active wallet
#[tokio::test]
async fn second_wallet_is_not_default() {
    let h = harness();
    let first = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");
    let second = h.store.add_nwc_wallet(&nwc_uri(RELAY_B), Some(" Savings ")).await.expect("second");

    assert_eq!(second.name, "Savings");
    assert!(!second.is_default);
    assert_eq!(h.store.default_wallet().map(|w| w.id), Some(first.id.clone()));
    assert_eq!(h.store.active_wallet().map(|w| w.id), Some(first.id));
    assert_eq!(h.store.total_balance(), 300_000);
}

/// Test: State survives a reopen of the data directory
#[tokio::test]
async fn state_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MockNwcWallet::default());
    let added = {
        let store = open(dir.path(), wallet.clone(), Arc::new(MockResolver::default()));
        let added = store.add_nwc_wallet(&nwc_uri(RELAY_A), Some("Daily")).await.expect("add");
        store.set_currency_preferences("eur", "BTC").expect("prefs");
        added
    };

    let reopened = open(dir.path(), wallet, Arc::new(MockResolver::default()));
    let state = reopened.state();
    assert_eq!(state.wallets.len(), 1);
    assert_eq!(state.wallets[0].name, "Daily");
    assert_eq!(state.active_wallet_id, Some(added.id.clone()));
    assert_eq!(state.preferred_fiat_currency, "EUR");
    assert_eq!(state.denomination, "btc");

    // Providers are rebuilt lazily from the stored record
    let balance = reopened.refresh_balance(&added.id).await.expect("refresh");
    assert_eq!(balance.balance, 150_000);
}

/// Test: Removing the default wallet promotes the next and disconnects it
#[tokio::test]
async fn remove_repairs_pointers() {
    let h = harness();
    let first = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");
    let second = h.store.add_nwc_wallet(&nwc_uri(RELAY_B), Some("Savings")).await.expect("second");
    h.store
        .auto_withdraw()
        .save_config(&first.id, AutoWithdrawConfig::lightning(1_000, "savings@example.com"))
        .expect("save config");

    h.store.remove_wallet(&first.id).await.expect("remove");

    assert!(h.wallet.closed.load(Ordering::SeqCst));
    assert!(h.store.auto_withdraw().config(&first.id).is_none());
    let promoted = h.store.default_wallet().expect("default");
    assert_eq!(promoted.id, second.id);
    assert!(promoted.is_default);
    assert_eq!(h.store.active_wallet().map(|w| w.id), Some(second.id));

    let err = h.store.remove_wallet(&first.id).await.expect_err("already gone");
    assert!(matches!(err, WalletError::NotFound(_)));
}

/// Test: Rename, default and active selection
#[tokio::test]
async fn rename_and_select() {
    let h = harness();
    let first = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");
    let second = h.store.add_nwc_wallet(&nwc_uri(RELAY_B), None).await.expect("second");

    assert!(matches!(h.store.rename_wallet(&first.id, "  "), Err(WalletError::Validation { .. })));
    h.store.rename_wallet(&first.id, "Spending").expect("rename");
    assert_eq!(h.store.wallet(&first.id).map(|w| w.name), Some("Spending".into()));

    h.store.set_default_wallet(&second.id).expect("set default");
    assert!(matches!(h.store.set_default_wallet("nope"), Err(WalletError::NotFound(_))));

    h.store.set_active_wallet(&second.id).await.expect("set active");
    let sorted: Vec<String> = h.store.sorted_wallets().into_iter().map(|w| w.id).collect();
    assert_eq!(sorted, vec![second.id.clone(), first.id.clone()]);

    let first_record = h.store.wallet(&first.id).expect("first");
    assert!(!first_record.is_default);
}

// =============================================================================
// Self-custodial records
// =============================================================================

/// Test: Without an SDK connector a Spark record stays locked
#[tokio::test]
async fn spark_record_is_locked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut state = StoreState::default();
    state.insert(WalletConfig::new("wallet-spark", WalletKind::Spark, "Spark"));
    let json = serde_json::to_string(&state).expect("serialize");
    std::fs::write(config(dir.path()).state_path(), json).expect("write state");

    let store = open(dir.path(), Arc::new(MockNwcWallet::default()), Arc::new(MockResolver::default()));
    assert!(!store.is_unlocked());
    assert!(matches!(store.connect_wallet("wallet-spark").await, Err(WalletError::Locked)));
    assert!(matches!(
        store.create_invoice(None, CreateInvoiceRequest::new(10)).await,
        Err(WalletError::Locked)
    ));

    let reports = store.refresh_all().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].result.is_err());

    // No sealed seed on the record
    assert!(matches!(store.unlock("1234").await, Err(WalletError::Storage(_))));
}

/// Test: Seed phrases are validated before anything is sealed
#[tokio::test]
async fn spark_rejects_bad_mnemonic() {
    let h = harness();
    let err = h
        .store
        .add_spark_wallet("correct horse battery staple", "1234", SparkNetwork::Mainnet, None)
        .await
        .expect_err("not bip39");
    assert!(matches!(err, WalletError::Validation { field: "mnemonic", .. }));
    assert!(h.store.wallets().is_empty());

    assert!(matches!(h.store.unlock("1234").await, Err(WalletError::NotFound(_))));
}

// =============================================================================
// Balances and auto-withdraw
// =============================================================================

/// Test: A balance refresh over threshold sweeps 97% to the lightning address
#[tokio::test]
async fn refresh_triggers_auto_withdraw() {
    let h = harness();
    let wallet = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");
    h.store
        .auto_withdraw()
        .save_config(&wallet.id, AutoWithdrawConfig::lightning(100_000, "savings@example.com"))
        .expect("save config");

    let balance = h.store.refresh_balance(&wallet.id).await.expect("refresh");
    assert_eq!(balance.balance, 150_000);

    assert_eq!(
        h.resolver.requests.lock().expect("requests").clone(),
        vec![("savings@example.com".to_string(), 145_500)]
    );
    let payments = h.wallet.payments.lock().expect("payments").clone();
    assert_eq!(payments.len(), 1);
    check_invoice_amount(&payments[0].0, 145_500).expect("invoice for the swept amount");
    assert_eq!(payments[0].1, None);

    match h.store.auto_withdraw().last_result(&wallet.id) {
        Some(WithdrawOutcome::Success { amount, wallet_name, .. }) => {
            assert_eq!(amount, 145_500);
            assert_eq!(wallet_name, "Alby Hub");
        }
        other => panic!("expected success, got {other:?}"),
    }

    // Cooldown: an immediate second refresh does not sweep again
    h.store.refresh_balance(&wallet.id).await.expect("refresh again");
    assert_eq!(h.resolver.request_count(), 1);
}

/// Test: Below-threshold balances are cached without a sweep
#[tokio::test]
async fn refresh_caches_balance() {
    let h = harness();
    let wallet = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");
    h.store
        .auto_withdraw()
        .save_config(&wallet.id, AutoWithdrawConfig::lightning(500_000, "savings@example.com"))
        .expect("save config");
    h.wallet.balance_msat.store(42_000_000, Ordering::SeqCst);

    h.store.refresh_balance(&wallet.id).await.expect("refresh");
    let cached = h.store.wallet(&wallet.id).expect("wallet").metadata;
    assert_eq!(cached.balance, Some(42_000));
    assert!(cached.balance_updated_at.is_some());
    assert_eq!(h.resolver.request_count(), 0);
}

/// Test: refresh_all reports each wallet separately
#[tokio::test]
async fn refresh_all_reports_each() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");
    h.store.add_nwc_wallet(&nwc_uri(RELAY_B), None).await.expect("second");

    let reports = h.store.refresh_all().await;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.result.as_ref().is_ok_and(|b| b.balance == 150_000)));
}

/// Test: Exchange rates are stored lowercase and considered fresh
#[tokio::test]
async fn exchange_rates_cached() {
    let h = harness();
    assert!(!h.store.rates_are_fresh());

    let rates = BTreeMap::from([("USD".to_string(), 65_000.0), ("EUR".to_string(), 60_000.0)]);
    h.store.set_exchange_rates(rates).expect("rates");
    assert!(h.store.rates_are_fresh());
    assert_eq!(h.store.state().exchange_rates.get("usd"), Some(&65_000.0));
}

// =============================================================================
// Payments and history
// =============================================================================

/// Test: Lightning addresses resolve through LNURL and pay from the active wallet
#[tokio::test]
async fn pay_lightning_address() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    let payment = h.store.pay(None, "Bob@Example.com", Some(21)).await.expect("pay");
    assert_eq!(payment.fee, 3);
    assert_eq!(h.resolver.requests.lock().expect("requests")[0], ("bob@example.com".to_string(), 21));
    check_invoice_amount(&h.wallet.payments.lock().expect("payments")[0].0, 21).expect("21 sat invoice");
}

/// Test: Bech32 LNURL pay links resolve through the LNURL resolver
#[tokio::test]
async fn pay_bech32_lnurl() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    h.store.pay(None, "lightning:LNURL1DP68GURN8GHJ7", Some(1_000)).await.expect("pay");
    assert_eq!(
        h.resolver.lnurl_requests.lock().expect("lnurl requests").clone(),
        vec![("LNURL1DP68GURN8GHJ7".to_string(), 1_000)]
    );
    check_invoice_amount(&h.wallet.payments.lock().expect("payments")[0].0, 1_000).expect("1000 sat invoice");
}

/// Test: A resolved invoice for another amount is refused before paying
#[tokio::test]
async fn pay_refuses_mismatched_invoice() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MockNwcWallet::default());
    let store = open(dir.path(), wallet.clone(), Arc::new(MockResolver::default().with_wrong_amount(250_000)));
    store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    let err = store.pay(None, "bob@example.com", Some(1_940)).await.expect_err("mismatch");
    assert!(matches!(err, WalletError::Validation { field: "invoice", .. }));
    assert!(store.pay(None, "LNURL1DP68GURN8GHJ7", Some(1_940)).await.is_err());
    assert!(wallet.payments.lock().expect("payments").is_empty());
}

/// Test: Destinations the wallet cannot pay are refused up front
#[tokio::test]
async fn pay_rejects_unpayable_destinations() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    let cases = [
        ("bob@example.com", None),
        ("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Some(1_000)),
        ("LNURL1DP68GURN8GHJ7", None),
        ("sp1pgssexampleaddress", Some(1_000)),
        ("definitely not a destination", Some(1_000)),
    ];
    for (destination, amount) in cases {
        assert!(h.store.pay(None, destination, amount).await.is_err(), "{destination}");
    }
    assert!(h.wallet.payments.lock().expect("payments").is_empty());
    assert_eq!(h.resolver.request_count(), 0);
}

/// Test: Invoices pay directly, with an amount only for zero-amount invoices
#[tokio::test]
async fn pay_invoice_directly() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    h.store.pay(None, "lightning:lnbc1zeroamount", Some(50)).await.expect("pay");
    let payments = h.wallet.payments.lock().expect("payments").clone();
    assert_eq!(payments, vec![("lnbc1zeroamount".to_string(), Some(50_000))]);
}

/// Test: Operations without an active wallet report NotFound
#[tokio::test]
async fn no_active_wallet() {
    let h = harness();
    let err = h.store.create_invoice(None, CreateInvoiceRequest::new(10)).await.expect_err("empty store");
    assert!(matches!(err, WalletError::NotFound(_)));
}

/// Test: History from the active wallet groups similar payments
#[tokio::test]
async fn grouped_history_from_wallet() {
    let h = harness();
    {
        let mut history = h.wallet.history.lock().expect("history");
        for (hash, at) in [("z1", 1_000), ("z2", 1_060)] {
            history.push(NwcTransaction {
                kind: Some("incoming".into()),
                state: Some("settled".into()),
                description: Some("Zap from Alice".into()),
                payment_hash: Some(hash.into()),
                amount: Some(21_000),
                created_at: Some(at),
                ..Default::default()
            });
        }
    }
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    let flat = h.store.transactions(None, Page::default()).await.expect("history");
    assert_eq!(flat.len(), 2);

    let grouped = h.store.grouped_history(None, Page::default()).await.expect("grouped");
    assert_eq!(grouped.len(), 1);
    let HistoryEntry::Group(group) = &grouped[0] else { panic!("expected a group") };
    assert_eq!(group.count, 2);
    assert_eq!(group.total_amount, 42);
}

/// Test: Invoices come from the active wallet
#[tokio::test]
async fn invoice_from_active_wallet() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");

    let invoice = h
        .store
        .create_invoice(None, CreateInvoiceRequest::new(2_100).with_description("Coffee"))
        .await
        .expect("invoice");
    assert_eq!(invoice.payment_request, "lnbc2100n1nwc");

    let lookup = h.store.lookup_invoice(None, &invoice.payment_hash).await.expect("lookup");
    assert!(!lookup.paid);
}

// =============================================================================
// Address book
// =============================================================================

/// Test: Contacts persist with the store and removal unlinks annotated transactions
#[tokio::test]
async fn contacts_persist_and_unlink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MockNwcWallet::default());
    let store = open(dir.path(), wallet.clone(), Arc::new(MockResolver::default()));

    let alice = store.contacts().add(NewContact::new("Alice", "alice@example.com")).expect("add");
    store.metadata().set_contact("tx-1", Some(&alice.id)).expect("link");
    assert_eq!(store.metadata().transactions_for_contact(&alice.id), vec!["tx-1".to_string()]);

    let reopened = open(dir.path(), wallet, Arc::new(MockResolver::default()));
    assert_eq!(reopened.contacts().get(&alice.id).map(|c| c.address), Some("alice@example.com".to_string()));

    let removed = reopened.remove_contact(&alice.id).expect("remove");
    assert_eq!(removed.name, "Alice");
    assert!(reopened.contacts().list().is_empty());
    assert_eq!(reopened.metadata().get("tx-1").and_then(|m| m.contact_id), None);
    assert!(matches!(reopened.remove_contact(&alice.id), Err(WalletError::NotFound(_))));
}

// =============================================================================
// BalancePoller
// =============================================================================

/// Test: poll_once counts wallets that refreshed cleanly
#[tokio::test]
async fn poller_single_pass() {
    let h = harness();
    h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("first");
    h.store.add_nwc_wallet(&nwc_uri(RELAY_B), None).await.expect("second");

    let poller = BalancePoller::new(h.store.clone());
    assert_eq!(poller.poll_once().await, 2);
}

/// Test: The spawned poller refreshes on its interval and stops on shutdown
#[tokio::test]
async fn poller_runs_until_shutdown() {
    let h = harness();
    let wallet = h.store.add_nwc_wallet(&nwc_uri(RELAY_A), None).await.expect("add");
    h.wallet.balance_msat.store(7_000_000, Ordering::SeqCst);

    let shutdown = Shutdown::new();
    let handle = BalancePoller::new(h.store.clone())
        .with_interval(Duration::from_millis(10))
        .spawn(shutdown.subscribe());

    let mut refreshed = false;
    for _ in 0..200 {
        if h.store.wallet(&wallet.id).and_then(|w| w.metadata.balance) == Some(7_000) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed, "poller never refreshed the balance");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller stops")
        .expect("poller task");
}
