//! BalancePoller - background balance refresh
//!
//! Every `poll_interval` it runs [`WalletStore::refresh_all`], which also
//! gives AutoWithdraw its chance per wallet. Stops on the shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::WalletStore;

pub struct BalancePoller {
    store: Arc<WalletStore>,
    interval: Duration,
}

impl BalancePoller {
    pub fn new(store: Arc<WalletStore>) -> Self {
        let interval = store.config().poll_interval;
        Self { store, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass; returns how many wallets refreshed cleanly.
    pub async fn poll_once(&self) -> usize {
        let reports = self.store.refresh_all().await;
        let ok = reports.iter().filter(|r| r.result.is_ok()).count();
        tracing::debug!(ok, failed = reports.len() - ok, "balance poll complete");
        ok
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = self.interval.as_secs(), "balance poller started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("balance poller stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {
                        self.poll_once().await;
                    }
                }
            }
        })
    }
}
