//! NIP-47 transport over a single relay connection
//!
//! Requests are kind 23194 events addressed to the wallet service (`p` tag),
//! content NIP-04 encrypted with the connection secret. Responses (23195)
//! reference the request id in an `e` tag; notifications (23196) carry no
//! reference. A dispatcher task owns the relay's inbound stream and routes
//! each event to the waiting request or to the notification subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::client::{parse_relay_message, RelayClient, RelayMessage};
use super::kinds;
use crate::error::{WalletError, WalletResult};
use crate::provider::nwc::{
    NwcConnector, NwcInfo, NwcListQuery, NwcNotification, NwcPayResult, NwcTransaction, NwcTransport, NwcUri,
};

const RESPONSE_SUB: &str = "nwc-responses";
const INFO_SUB: &str = "nwc-info";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NOTIFICATION_BUFFER: usize = 32;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;
type Subscribers = Arc<Mutex<Vec<mpsc::Sender<NwcNotification>>>>;

/// Opens NIP-47 sessions against the URI's relays, first reachable relay wins.
#[derive(Debug, Clone)]
pub struct RelayNwcConnector {
    request_timeout: Duration,
}

impl Default for RelayNwcConnector {
    fn default() -> Self {
        Self { request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

impl RelayNwcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl NwcConnector for RelayNwcConnector {
    async fn open(&self, uri: &NwcUri) -> WalletResult<Arc<dyn NwcTransport>> {
        let mut last_err = String::from("no relay in connection string");
        for url in &uri.relays {
            match RelayNwcTransport::connect(url, uri, self.request_timeout).await {
                Ok(transport) => return Ok(Arc::new(transport)),
                Err(e) => {
                    tracing::warn!(relay = %url, error = %e, "nwc relay unavailable");
                    last_err = e.to_string();
                }
            }
        }
        Err(WalletError::Connection(last_err))
    }
}

/// Session keys derived from the connection secret.
struct Session {
    keys: nostr::Keys,
    secret: nostr::SecretKey,
    wallet: nostr::PublicKey,
}

impl Session {
    fn from_uri(uri: &NwcUri) -> WalletResult<Self> {
        let secret = nostr::SecretKey::from_hex(&uri.secret)
            .map_err(|e| WalletError::validation("nwc_url", format!("secret: {e}")))?;
        let keys = nostr::Keys::new(nostr::SecretKey::from_hex(&uri.secret)
            .map_err(|e| WalletError::validation("nwc_url", format!("secret: {e}")))?);
        let wallet = nostr::PublicKey::from_hex(&uri.wallet_pubkey)
            .map_err(|e| WalletError::validation("nwc_url", format!("pubkey: {e}")))?;
        Ok(Self { keys, secret, wallet })
    }

    fn encrypt(&self, plaintext: &str) -> WalletResult<String> {
        nostr::nips::nip04::encrypt(&self.secret, &self.wallet, plaintext)
            .map_err(|e| WalletError::backend(format!("nip04 encrypt: {e}")))
    }

    fn decrypt(&self, ciphertext: &str) -> WalletResult<String> {
        nostr::nips::nip04::decrypt(&self.secret, &self.wallet, ciphertext)
            .map_err(|e| WalletError::backend(format!("nip04 decrypt: {e}")))
    }
}

pub struct RelayNwcTransport {
    relay: RelayClient,
    session: Arc<Session>,
    pending: Pending,
    subscribers: Subscribers,
    advertised: Arc<Mutex<Option<NwcInfo>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl RelayNwcTransport {
    async fn connect(url: &str, uri: &NwcUri, timeout: Duration) -> WalletResult<Self> {
        let session = Arc::new(Session::from_uri(uri)?);
        let relay = RelayClient::new(url);
        let inbound = relay
            .connect()
            .await
            .map_err(|e| WalletError::Connection(format!("{url}: {e}")))?;

        let client_hex = session.keys.public_key().to_hex();
        let wallet_hex = session.wallet.to_hex();
        relay
            .subscribe(
                RESPONSE_SUB,
                vec![json!({
                    "kinds": [kinds::NWC_RESPONSE, kinds::NWC_NOTIFICATION],
                    "authors": [wallet_hex],
                    "#p": [client_hex],
                    "since": chrono::Utc::now().timestamp(),
                })],
            )
            .await
            .map_err(|e| WalletError::Connection(e.to_string()))?;
        relay
            .subscribe(INFO_SUB, vec![json!({ "kinds": [kinds::NWC_INFO], "authors": [wallet_hex], "limit": 1 })])
            .await
            .map_err(|e| WalletError::Connection(e.to_string()))?;

        let transport = Self {
            relay,
            session,
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            advertised: Arc::new(Mutex::new(None)),
            dispatcher: Mutex::new(None),
            timeout,
        };
        let handle = tokio::spawn(dispatch(
            inbound,
            transport.session.clone(),
            transport.pending.clone(),
            transport.subscribers.clone(),
            transport.advertised.clone(),
        ));
        *transport.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        tracing::debug!(relay = %url, "nwc session open");
        Ok(transport)
    }

    async fn request(&self, method: &str, params: Value) -> WalletResult<Value> {
        let content = self.session.encrypt(&json!({ "method": method, "params": params }).to_string())?;
        let tag: Vec<String> = vec!["p".into(), self.session.wallet.to_hex()];
        let tags: Vec<nostr::Tag> = nostr::Tag::parse(&tag).into_iter().collect();
        let event = nostr::UnsignedEvent::new(
            self.session.keys.public_key(),
            nostr::Timestamp::now(),
            nostr::Kind::Custom(kinds::NWC_REQUEST),
            tags,
            content,
        )
        .sign_with_keys(&self.session.keys)
        .map_err(|e| WalletError::backend(format!("sign: {e}")))?;

        let request_id = event.id.to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        if let Err(e) = self.relay.publish(&event).await {
            lock(&self.pending).remove(&request_id);
            return Err(WalletError::Connection(e.to_string()));
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(WalletError::Connection("relay stream closed".into())),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                return Err(WalletError::Timeout(format!("{method} reply")));
            }
        };

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_str).unwrap_or("INTERNAL");
            let message = error.get("message").and_then(Value::as_str).unwrap_or(code);
            return Err(WalletError::backend_code(code, message));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> WalletResult<T> {
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(|e| WalletError::backend(format!("{method} result: {e}")))
    }
}

impl Drop for RelayNwcTransport {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        self.relay.disconnect();
    }
}

#[async_trait]
impl NwcTransport for RelayNwcTransport {
    async fn get_info(&self) -> WalletResult<NwcInfo> {
        match self.call::<NwcInfo>("get_info", json!({})).await {
            Ok(info) => Ok(info),
            Err(e) => lock(&self.advertised).clone().ok_or(e),
        }
    }

    async fn get_balance(&self) -> WalletResult<u64> {
        let result = self.request("get_balance", json!({})).await?;
        result
            .get("balance")
            .and_then(Value::as_u64)
            .ok_or_else(|| WalletError::backend("get_balance result has no balance"))
    }

    async fn make_invoice(&self, amount_msat: u64, description: &str, expiry_secs: u64) -> WalletResult<NwcTransaction> {
        self.call("make_invoice", json!({ "amount": amount_msat, "description": description, "expiry": expiry_secs }))
            .await
    }

    async fn pay_invoice(&self, invoice: &str, amount_msat: Option<u64>) -> WalletResult<NwcPayResult> {
        let mut params = json!({ "invoice": invoice });
        if let Some(amount) = amount_msat {
            params["amount"] = json!(amount);
        }
        self.call("pay_invoice", params).await
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> WalletResult<NwcTransaction> {
        self.call("lookup_invoice", json!({ "payment_hash": payment_hash })).await
    }

    async fn list_transactions(&self, query: NwcListQuery) -> WalletResult<Vec<NwcTransaction>> {
        let params = serde_json::to_value(&query)?;
        let result = self.request("list_transactions", params).await?;
        let list = result.get("transactions").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(list).map_err(|e| WalletError::backend(format!("list_transactions result: {e}")))
    }

    async fn subscribe_notifications(&self) -> WalletResult<mpsc::Receiver<NwcNotification>> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        lock(&self.subscribers).push(tx);
        Ok(rx)
    }

    async fn close(&self) {
        let _ = self.relay.unsubscribe(RESPONSE_SUB).await;
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        lock(&self.pending).clear();
        lock(&self.subscribers).clear();
        self.relay.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

async fn dispatch(
    mut inbound: mpsc::Receiver<String>,
    session: Arc<Session>,
    pending: Pending,
    subscribers: Subscribers,
    advertised: Arc<Mutex<Option<NwcInfo>>>,
) {
    while let Some(frame) = inbound.recv().await {
        let event = match parse_relay_message(&frame) {
            Some(RelayMessage::Event { event, .. }) => event,
            Some(RelayMessage::Ok { accepted: false, event_id, message }) => {
                tracing::warn!(%event_id, message = message.as_deref().unwrap_or_default(), "relay rejected nwc request");
                continue;
            }
            Some(RelayMessage::Closed { sub_id, message }) => {
                tracing::warn!(%sub_id, %message, "relay closed nwc subscription");
                continue;
            }
            Some(RelayMessage::Notice { message }) => {
                tracing::debug!(%message, "relay notice");
                continue;
            }
            _ => continue,
        };
        let view = match serde_json::to_value(&*event) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let kind = view.get("kind").and_then(Value::as_u64).unwrap_or_default() as u16;
        let content = view.get("content").and_then(Value::as_str).unwrap_or_default();

        match kind {
            kinds::NWC_INFO => {
                *lock(&advertised) = Some(info_from_event(content, &view));
            }
            kinds::NWC_RESPONSE => {
                let Some(request_id) = tag_value(&view, "e") else { continue };
                let Some(waiter) = lock(&pending).remove(&request_id) else { continue };
                match session.decrypt(content).and_then(|plain| Ok(serde_json::from_str::<Value>(&plain)?)) {
                    Ok(response) => {
                        let _ = waiter.send(response);
                    }
                    Err(e) => tracing::warn!(%request_id, error = %e, "undecodable nwc response"),
                }
            }
            kinds::NWC_NOTIFICATION => {
                let notification = match session
                    .decrypt(content)
                    .and_then(|plain| Ok(serde_json::from_str::<NwcNotification>(&plain)?))
                {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable nwc notification");
                        continue;
                    }
                };
                lock(&subscribers).retain(|tx| match tx.try_send(notification.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            _ => {}
        }
    }
    tracing::debug!("nwc relay stream ended");
    lock(&pending).clear();
}

/// First value of the first tag named `name`.
fn tag_value(event: &Value, name: &str) -> Option<String> {
    event
        .get("tags")?
        .as_array()?
        .iter()
        .filter_map(Value::as_array)
        .find(|tag| tag.first().and_then(Value::as_str) == Some(name))
        .and_then(|tag| tag.get(1))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Info event: space-separated methods in content, notification types in a tag.
fn info_from_event(content: &str, event: &Value) -> NwcInfo {
    NwcInfo {
        methods: content.split_whitespace().map(str::to_string).collect(),
        notifications: tag_value(event, "notifications")
            .map(|n| n.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        ..Default::default()
    }
}
