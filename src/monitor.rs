//! PaymentMonitor - watches one invoice until it settles, expires or times out
//!
//! ```text
//!   start ──► PENDING ──(lookup: paid)──────► CONFIRMED
//!                │  ▲
//!                │  └─(lookup: not paid, interval *= backoff, capped)
//!                ├──(expires_at - buffer passed)──► EXPIRED
//!                └──(max_attempts lookups done)───► ERROR
//! ```
//!
//! Lookups are the only source of truth. A push notification, when the
//! provider offers one, just pulls the next lookup forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::error::{WalletError, WalletResult};
use crate::provider::{now_secs, Invoice, PaymentReceived, WalletProvider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedInvoice {
    pub payment_hash: String,
    /// Unix seconds
    pub expires_at: Option<i64>,
    pub amount: Option<u64>,
}

impl From<&Invoice> for WatchedInvoice {
    fn from(invoice: &Invoice) -> Self {
        Self {
            payment_hash: invoice.payment_hash.clone(),
            expires_at: invoice.expires_at,
            amount: Some(invoice.amount).filter(|a| *a > 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Pending,
    Confirmed,
    Expired,
    Error,
}

impl MonitorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MonitorStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorEvent {
    pub status: MonitorStatus,
    pub payment_hash: String,
    pub attempt: u32,
    pub preimage: Option<String>,
    pub amount: Option<u64>,
    /// Delay before the next lookup; set on pending events after a lookup
    pub next_check_in: Option<Duration>,
    pub message: String,
}

struct Session {
    handle: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

pub struct PaymentMonitor {
    config: MonitorConfig,
    session: Mutex<Option<Session>>,
}

impl PaymentMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config, session: Mutex::new(None) }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Begin polling. Any session already running on this monitor is stopped first.
    pub fn start(
        &self,
        invoice: WatchedInvoice,
        provider: Arc<dyn WalletProvider>,
    ) -> WalletResult<mpsc::UnboundedReceiver<MonitorEvent>> {
        self.launch(invoice, provider, None)
    }

    /// Like [`start`](Self::start), also listening on the provider's push stream if it has one.
    pub async fn start_with_notifications(
        &self,
        invoice: WatchedInvoice,
        provider: Arc<dyn WalletProvider>,
    ) -> WalletResult<mpsc::UnboundedReceiver<MonitorEvent>> {
        let push = match provider.notifications() {
            Some(source) => match source.subscribe_payment_received().await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::debug!(error = %e, "push notifications unavailable, polling only");
                    None
                }
            },
            None => None,
        };
        self.launch(invoice, provider, push)
    }

    pub fn stop(&self) {
        if let Some(session) = self.lock().take() {
            session.active.store(false, Ordering::SeqCst);
            session.handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.active.load(Ordering::SeqCst))
    }

    fn launch(
        &self,
        invoice: WatchedInvoice,
        provider: Arc<dyn WalletProvider>,
        push: Option<mpsc::Receiver<PaymentReceived>>,
    ) -> WalletResult<mpsc::UnboundedReceiver<MonitorEvent>> {
        self.stop();
        if invoice.payment_hash.trim().is_empty() {
            return Err(WalletError::validation("payment_hash", "Invoice must have a payment_hash"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(MonitorEvent {
            status: MonitorStatus::Pending,
            payment_hash: invoice.payment_hash.clone(),
            attempt: 0,
            preimage: None,
            amount: None,
            next_check_in: Some(self.config.initial_interval),
            message: "Waiting for payment...".into(),
        });

        let active = Arc::new(AtomicBool::new(true));
        let deadline = expiry_deadline(&invoice, self.config.expiry_buffer);
        let run = Run { config: self.config.clone(), invoice, provider, tx, deadline, push };
        let flag = active.clone();
        let handle = tokio::spawn(async move {
            run.execute().await;
            flag.store(false, Ordering::SeqCst);
        });

        *self.lock() = Some(Session { handle, active });
        Ok(rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for PaymentMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wall-clock expiry mapped onto the tokio clock once, at start.
fn expiry_deadline(invoice: &WatchedInvoice, buffer: Duration) -> Option<Instant> {
    let expires_at = invoice.expires_at?;
    let remaining = expires_at - buffer.as_secs() as i64 - now_secs();
    Some(Instant::now() + Duration::from_secs(remaining.max(0) as u64))
}

const TIMED_OUT: &str = "Payment monitoring timed out";

struct Run {
    config: MonitorConfig,
    invoice: WatchedInvoice,
    provider: Arc<dyn WalletProvider>,
    tx: mpsc::UnboundedSender<MonitorEvent>,
    deadline: Option<Instant>,
    push: Option<mpsc::Receiver<PaymentReceived>>,
}

impl Run {
    async fn execute(mut self) {
        let mut interval = self.config.initial_interval;
        let mut attempts: u32 = 0;

        loop {
            self.wait(interval).await;

            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.emit(MonitorStatus::Expired, attempts, "Invoice has expired");
                return;
            }
            if self.config.max_attempts == 0 {
                self.emit(MonitorStatus::Error, attempts, TIMED_OUT);
                return;
            }

            attempts += 1;
            let lookup = self.provider.lookup_invoice(&self.invoice.payment_hash).await;
            if lookup.paid {
                let event = MonitorEvent {
                    status: MonitorStatus::Confirmed,
                    payment_hash: self.invoice.payment_hash.clone(),
                    attempt: attempts,
                    preimage: lookup.preimage,
                    amount: lookup.amount.filter(|a| *a > 0).or(self.invoice.amount),
                    next_check_in: None,
                    message: "Payment received".into(),
                };
                tracing::info!(payment_hash = %self.invoice.payment_hash, attempts, "payment confirmed");
                let _ = self.tx.send(event);
                return;
            }

            if attempts >= self.config.max_attempts {
                self.emit(MonitorStatus::Error, attempts, TIMED_OUT);
                return;
            }

            interval = interval.mul_f64(self.config.backoff_multiplier).min(self.config.max_interval);
            let pending = MonitorEvent {
                status: MonitorStatus::Pending,
                payment_hash: self.invoice.payment_hash.clone(),
                attempt: attempts,
                preimage: None,
                amount: None,
                next_check_in: Some(interval),
                message: "Waiting for payment...".into(),
            };
            if self.tx.send(pending).is_err() {
                tracing::debug!(payment_hash = %self.invoice.payment_hash, "monitor listener gone");
                return;
            }
        }
    }

    /// Sleep for `interval`, cut short by a push for our hash.
    async fn wait(&mut self, interval: Duration) {
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);
        loop {
            let Some(push) = self.push.as_mut() else {
                sleep.as_mut().await;
                return;
            };
            tokio::select! {
                _ = sleep.as_mut() => return,
                received = push.recv() => match received {
                    Some(p) if p.payment_hash == self.invoice.payment_hash => {
                        tracing::debug!(payment_hash = %p.payment_hash, "push received, checking now");
                        return;
                    }
                    Some(_) => continue,
                    None => self.push = None,
                },
            }
        }
    }

    fn emit(&self, status: MonitorStatus, attempt: u32, message: &str) {
        tracing::info!(payment_hash = %self.invoice.payment_hash, ?status, attempt, "{message}");
        let _ = self.tx.send(MonitorEvent {
            status,
            payment_hash: self.invoice.payment_hash.clone(),
            attempt,
            preimage: None,
            amount: None,
            next_check_in: None,
            message: message.into(),
        });
    }
}
