//! Environment overlay for BuhoConfig.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use buho::BuhoConfig;
use once_cell::sync::Lazy;

/// Env vars are process-global; serialize the tests that touch them.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const KEYS: &[&str] = &["BUHO_DATA_DIR", "BUHO_EXPLORER_URL", "BUHO_POLL_SECS", "BUHO_NWC_RETRIES"];

fn clear() {
    for key in KEYS {
        std::env::remove_var(key);
    }
}

/// Test: BUHO_* variables override the defaults
#[test]
fn env_overrides_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear();
    std::env::set_var("BUHO_DATA_DIR", "/tmp/buho-test");
    std::env::set_var("BUHO_EXPLORER_URL", "https://mempool.example/api/v1");
    std::env::set_var("BUHO_POLL_SECS", "90");
    std::env::set_var("BUHO_NWC_RETRIES", "5");

    let config = BuhoConfig::from_env();
    clear();

    assert_eq!(config.data_dir, PathBuf::from("/tmp/buho-test"));
    assert_eq!(config.state_path(), PathBuf::from("/tmp/buho-test/wallets.json"));
    assert_eq!(config.explorer_url.as_deref(), Some("https://mempool.example/api/v1"));
    assert_eq!(config.poll_interval, Duration::from_secs(90));
    assert_eq!(config.nwc_retry.attempts, 5);
}

/// Test: Blank or nonsensical values fall back to safe minimums
#[test]
fn env_values_are_clamped() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear();
    std::env::set_var("BUHO_EXPLORER_URL", "   ");
    std::env::set_var("BUHO_POLL_SECS", "0");
    std::env::set_var("BUHO_NWC_RETRIES", "not-a-number");

    let config = BuhoConfig::from_env();
    clear();

    assert_eq!(config.explorer_url, None);
    assert_eq!(config.poll_interval, Duration::from_secs(1));
    assert_eq!(config.nwc_retry.attempts, 3);
    assert!(config.data_dir.ends_with("buho"));
}

/// Test: Builders leave the other defaults alone
#[test]
fn builder_defaults() {
    let config = BuhoConfig::new("/data").with_poll_interval(Duration::from_secs(5));
    assert_eq!(config.poll_interval, Duration::from_secs(5));
    assert_eq!(config.metadata_path(), PathBuf::from("/data/transaction_metadata.json"));
    assert_eq!(config.auto_withdraw_path(), PathBuf::from("/data/auto_withdraw.json"));
    assert_eq!(config.withdraw.send_percent, 97);
    assert_eq!(config.monitor.max_attempts, 35);
}
