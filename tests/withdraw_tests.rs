//! AutoWithdraw: guards, payout routes, annotation and persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use buho::config::WithdrawPolicy;
use buho::lnurl::check_invoice_amount;
use buho::metadata::TransactionMetadataStore;
use buho::provider::{FeeTier, WalletKind};
use buho::withdraw::AUTO_WITHDRAW_TAG;
use buho::{AutoWithdraw, AutoWithdrawConfig, FeeSpeed, WalletConfig, WithdrawOutcome};
use common::{MockDirectory, MockProvider, MockResolver};
use tempfile::TempDir;

const ADDRESS: &str = "savings@example.com";
const BTC_ADDRESS: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

struct Harness {
    withdraw: AutoWithdraw,
    resolver: Arc<MockResolver>,
    metadata: Arc<TransactionMetadataStore>,
    provider: Arc<MockProvider>,
    directory: MockDirectory,
}

fn harness(kind: WalletKind, provider: MockProvider, resolver: MockResolver) -> Harness {
    let resolver = Arc::new(resolver);
    let metadata = Arc::new(TransactionMetadataStore::in_memory());
    let withdraw = AutoWithdraw::new(WithdrawPolicy::default(), resolver.clone(), metadata.clone(), None);
    let provider = Arc::new(provider);
    let directory = MockDirectory::default().with(WalletConfig::new("w1", kind, "Main"), provider.clone());
    Harness { withdraw, resolver, metadata, provider, directory }
}

// ============================================================================
// Guards
// ============================================================================

/// Test: Nothing happens at or below the threshold, or when disabled
#[tokio::test]
async fn threshold_and_enabled_guards() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    assert!(h.withdraw.check_and_execute("w1", 1_000_000, &h.directory).await.is_none());

    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");
    assert!(h.withdraw.check_and_execute("w1", 10_000, &h.directory).await.is_none());

    let mut disabled = AutoWithdrawConfig::lightning(10_000, ADDRESS);
    disabled.enabled = false;
    h.withdraw.save_config("w1", disabled).expect("save disabled");
    assert!(h.withdraw.check_and_execute("w1", 50_000, &h.directory).await.is_none());
    assert_eq!(h.resolver.request_count(), 0);
}

/// Test: A second trigger inside the cooldown is ignored
#[tokio::test]
async fn cooldown_blocks_retrigger() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let first = h.withdraw.check_and_execute("w1", 20_000, &h.directory).await;
    assert!(matches!(first, Some(WithdrawOutcome::Success { .. })));
    assert!(h.withdraw.check_and_execute("w1", 20_000, &h.directory).await.is_none());
    assert_eq!(h.resolver.request_count(), 1);
    assert!(!h.withdraw.is_processing("w1"));
}

/// Test: Cooldown is measured on the tokio clock
#[tokio::test(start_paused = true)]
async fn cooldown_expires() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    assert!(h.withdraw.check_and_execute("w1", 20_000, &h.directory).await.is_some());
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(h.withdraw.check_and_execute("w1", 20_000, &h.directory).await.is_some());
    assert_eq!(h.resolver.request_count(), 2);
}

/// Test: Concurrent refreshes of one wallet sweep once
#[tokio::test]
async fn concurrent_checks_sweep_once() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let (a, b) = tokio::join!(
        h.withdraw.check_and_execute("w1", 20_000, &h.directory),
        h.withdraw.check_and_execute("w1", 20_000, &h.directory),
    );
    assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    assert_eq!(h.provider.paid.lock().unwrap().len(), 1);
}

/// Test: Amounts under the dust floor are not sent
#[tokio::test]
async fn dust_is_skipped() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(5, ADDRESS)).expect("save");

    // 97% of 9 sats is 8, below the 10 sat floor
    assert!(h.withdraw.check_and_execute("w1", 9, &h.directory).await.is_none());
    assert_eq!(h.resolver.request_count(), 0);
}

/// Test: Unknown wallets yield nothing
#[tokio::test]
async fn unknown_wallet_is_ignored() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("ghost", AutoWithdrawConfig::lightning(10, ADDRESS)).expect("save");
    assert!(h.withdraw.check_and_execute("ghost", 1_000, &h.directory).await.is_none());
}

// ============================================================================
// Payout routes
// ============================================================================

/// Test: Hosted wallets resolve the address to an invoice and pay it
#[tokio::test]
async fn lightning_payout_via_lnurl() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 100_000, &h.directory).await;
    assert_eq!(
        outcome,
        Some(WithdrawOutcome::Success {
            amount: 97_000,
            destination: ADDRESS.into(),
            wallet_name: "Main".into(),
            fee: None,
        })
    );
    assert_eq!(h.resolver.requests.lock().unwrap()[0], (ADDRESS.to_string(), 97_000));
    let invoice = h.provider.paid.lock().unwrap()[0].invoice.clone();
    check_invoice_amount(&invoice, 97_000).expect("invoice for the swept amount");

    // Tagged and noted under the payment hash
    assert_eq!(h.metadata.tags("hash-1"), vec![AUTO_WITHDRAW_TAG.to_string()]);
    assert_eq!(h.metadata.note("hash-1"), "Automatic transfer \u{b7} 97,000 sats sent to savings@example.com");

    assert!(h.withdraw.config("w1").and_then(|c| c.last_triggered_at).is_some());
    assert_eq!(h.withdraw.last_result("w1"), outcome);
}

/// Test: A transaction already at its tag limit still gets the transfer note
#[tokio::test]
async fn note_survives_full_tags() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), MockResolver::default());
    h.metadata.add_tag("hash-1", "savings").expect("tag");
    h.metadata.add_tag("hash-1", "monthly").expect("tag");
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 100_000, &h.directory).await;
    assert!(matches!(outcome, Some(WithdrawOutcome::Success { amount: 97_000, .. })));
    assert_eq!(h.metadata.tags("hash-1"), vec!["savings".to_string(), "monthly".to_string()]);
    assert_eq!(h.metadata.note("hash-1"), "Automatic transfer \u{b7} 97,000 sats sent to savings@example.com");
}

/// Test: Spark wallets pay lightning addresses natively
#[tokio::test]
async fn spark_lightning_payout() {
    let h = harness(WalletKind::Spark, MockProvider::new("w1", WalletKind::Spark), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(1_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 2_000, &h.directory).await;
    assert!(matches!(outcome, Some(WithdrawOutcome::Success { amount: 1_940, .. })));
    assert_eq!(h.resolver.request_count(), 0);
    assert_eq!(h.provider.address_payments.lock().unwrap()[0], (ADDRESS.to_string(), 1_940));
    assert_eq!(h.metadata.tags("spark-pay-1"), vec![AUTO_WITHDRAW_TAG.to_string()]);
}

/// Test: Spark on-chain sweeps quote first and report the tier fee
#[tokio::test]
async fn spark_onchain_payout() {
    let h = harness(WalletKind::Spark, MockProvider::new("w1", WalletKind::Spark), MockResolver::default());
    h.withdraw
        .save_config("w1", AutoWithdrawConfig::onchain(50_000, BTC_ADDRESS, FeeSpeed::High))
        .expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 100_000, &h.directory).await;
    match outcome {
        Some(WithdrawOutcome::Success { amount, destination, fee, .. }) => {
            assert_eq!(amount, 97_000);
            assert_eq!(destination, "bc1qar0s...wf5mdq");
            assert_eq!(fee, Some(600));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let withdrawals = h.provider.withdrawals.lock().unwrap();
    assert_eq!(withdrawals[0].tier, FeeTier::Fast);
    assert_eq!(withdrawals[0].quote_id, "quote-1");
    assert_eq!(withdrawals[0].address, BTC_ADDRESS);

    let note = h.metadata.note("withdrawal-1");
    assert!(note.ends_with("(Priority fee)"), "{note}");
}

/// Test: Failures become Error outcomes and release the in-flight mark
#[tokio::test]
async fn failure_is_reported() {
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc).failing_payments(), MockResolver::default());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 20_000, &h.directory).await;
    match outcome {
        Some(WithdrawOutcome::Error { message, wallet_name }) => {
            assert!(message.contains("insufficient balance"));
            assert_eq!(wallet_name, "Main");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!h.withdraw.is_processing("w1"));
    assert!(h.withdraw.config("w1").and_then(|c| c.last_triggered_at).is_none());
}

/// Test: Resolver errors surface the same way
#[tokio::test]
async fn resolver_failure_is_reported() {
    let h = harness(WalletKind::Lnbits, MockProvider::new("w1", WalletKind::Lnbits), MockResolver::failing());
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(10_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 20_000, &h.directory).await;
    assert!(matches!(outcome, Some(WithdrawOutcome::Error { .. })));
    assert!(h.provider.paid.lock().unwrap().is_empty());
}

/// Test: An invoice for a different amount than the sweep is never paid
#[tokio::test]
async fn mismatched_invoice_amount_is_refused() {
    let resolver = MockResolver::default().with_wrong_amount(250_000);
    let h = harness(WalletKind::Nwc, MockProvider::new("w1", WalletKind::Nwc), resolver);
    h.withdraw.save_config("w1", AutoWithdrawConfig::lightning(1_000, ADDRESS)).expect("save");

    let outcome = h.withdraw.check_and_execute("w1", 2_000, &h.directory).await;
    match outcome {
        Some(WithdrawOutcome::Error { message, .. }) => assert!(message.contains("expected 1940 sats"), "{message}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(h.provider.paid.lock().unwrap().is_empty());
    assert!(!h.withdraw.is_processing("w1"));
}

// ============================================================================
// Configuration
// ============================================================================

/// Test: Enabled configs must carry a usable destination
#[test]
fn save_validates_destinations() {
    let metadata = Arc::new(TransactionMetadataStore::in_memory());
    let withdraw = AutoWithdraw::new(WithdrawPolicy::default(), Arc::new(MockResolver::default()), metadata, None);

    assert!(withdraw.save_config("w1", AutoWithdrawConfig::lightning(0, ADDRESS)).is_err());
    assert!(withdraw.save_config("w1", AutoWithdrawConfig::lightning(100, "not-an-address")).is_err());
    assert!(withdraw
        .save_config("w1", AutoWithdrawConfig::onchain(100, "bc1notreal", FeeSpeed::Low))
        .is_err());
    assert!(withdraw.config("w1").is_none());

    // Trimmed before validation
    withdraw
        .save_config("w1", AutoWithdrawConfig::lightning(100, format!("  {ADDRESS} ")))
        .expect("trimmed address");
    assert_eq!(withdraw.config("w1").map(|c| c.lightning_address), Some(ADDRESS.to_string()));

    // Disabled configs are stored as-is
    let mut draft = AutoWithdrawConfig::lightning(0, "");
    draft.enabled = false;
    withdraw.save_config("w2", draft).expect("disabled draft");
}

/// Test: Configs survive a restart; removal deletes them
#[test]
fn configs_persist() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("auto_withdraw.json");
    let open = || {
        AutoWithdraw::new(
            WithdrawPolicy::default(),
            Arc::new(MockResolver::default()),
            Arc::new(TransactionMetadataStore::in_memory()),
            Some(path.clone()),
        )
    };

    let first = open();
    first.save_config("w1", AutoWithdrawConfig::lightning(21_000, ADDRESS)).expect("save");
    first
        .save_config("w2", AutoWithdrawConfig::onchain(50_000, BTC_ADDRESS, FeeSpeed::Low))
        .expect("save onchain");

    let second = open();
    assert_eq!(second.configs().len(), 2);
    assert_eq!(second.config("w1").map(|c| c.threshold_sats), Some(21_000));
    assert_eq!(second.config("w2").map(|c| c.fee_speed), Some(FeeSpeed::Low));

    second.remove_config("w1").expect("remove");
    assert!(open().config("w1").is_none());
}

/// Test: Files written by older clients (camelCase) still load
#[test]
fn legacy_file_loads() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("auto_withdraw.json");
    std::fs::write(
        &path,
        r#"{"configs":{"w1":{"enabled":true,"thresholdSats":5000,"lightningAddress":"a@b.co","payoutType":"lightning","feeSpeed":"high"}}}"#,
    )
    .expect("write");

    let withdraw = AutoWithdraw::new(
        WithdrawPolicy::default(),
        Arc::new(MockResolver::default()),
        Arc::new(TransactionMetadataStore::in_memory()),
        Some(path),
    );
    let config = withdraw.config("w1").expect("loaded");
    assert_eq!(config.threshold_sats, 5_000);
    assert_eq!(config.lightning_address, "a@b.co");
    assert_eq!(config.fee_speed, FeeSpeed::High);
}
