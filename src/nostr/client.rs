//! Nostr relay client - tokio-tungstenite WebSocket
//!
//! One socket per relay. Outgoing frames go through a bounded channel to a
//! writer task; incoming text frames are forwarded raw to the caller, who
//! parses them with [`parse_relay_message`].

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

/// Nostr relay client
pub struct RelayClient {
    url: String,
    state: Arc<RwLock<RelayState>>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(RelayState::Disconnected)),
            tx: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> RelayState {
        *self.state.read().await
    }

    /// Connect to relay
    pub async fn connect(&self) -> anyhow::Result<mpsc::Receiver<String>> {
        *self.state.write().await = RelayState::Connecting;

        let (ws, _) = match connect_async(&self.url).await {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.write().await = RelayState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut write, mut read) = ws.split();

        // Outgoing frames
        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        *self.sender_slot() = Some(out_tx);

        // Incoming frames
        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        let state = self.state.clone();
        *state.write().await = RelayState::Connected;

        let state_w = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
            *state_w.write().await = RelayState::Disconnected;
        });

        let state_r = state.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(txt) = msg {
                    if in_tx.send(txt).await.is_err() {
                        break;
                    }
                }
            }
            *state_r.write().await = RelayState::Disconnected;
        });

        Ok(in_rx)
    }

    /// Drops the outgoing channel; the writer closes the socket.
    pub fn disconnect(&self) {
        self.sender_slot().take();
    }

    /// Send raw message
    pub async fn send(&self, msg: &str) -> anyhow::Result<()> {
        let tx = self.sender_slot().clone();
        match tx {
            Some(tx) => {
                tx.send(msg.to_string()).await?;
                Ok(())
            }
            None => anyhow::bail!("Not connected to {}", self.url),
        }
    }

    /// Publish event (NIP-01)
    pub async fn publish(&self, event: &nostr::Event) -> anyhow::Result<()> {
        let msg = json!(["EVENT", event]).to_string();
        self.send(&msg).await
    }

    /// Subscribe (NIP-01)
    pub async fn subscribe(&self, id: &str, filters: Vec<Value>) -> anyhow::Result<()> {
        let mut msg = vec![json!("REQ"), json!(id)];
        msg.extend(filters);
        self.send(&Value::Array(msg).to_string()).await
    }

    /// Unsubscribe (NIP-01)
    pub async fn unsubscribe(&self, id: &str) -> anyhow::Result<()> {
        let msg = json!(["CLOSE", id]).to_string();
        self.send(&msg).await
    }

    fn sender_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Parse relay message
pub fn parse_relay_message(msg: &str) -> Option<RelayMessage> {
    let arr: Vec<Value> = serde_json::from_str(msg).ok()?;
    let cmd = arr.first()?.as_str()?;
    match cmd {
        "EVENT" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            let event: nostr::Event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
            Some(RelayMessage::Event { sub_id, event: Box::new(event) })
        }
        "OK" => {
            let event_id = arr.get(1)?.as_str()?.to_string();
            let accepted = arr.get(2)?.as_bool()?;
            let message = arr.get(3).and_then(|v| v.as_str()).map(String::from);
            Some(RelayMessage::Ok { event_id, accepted, message })
        }
        "EOSE" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            Some(RelayMessage::Eose { sub_id })
        }
        "CLOSED" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Some(RelayMessage::Closed { sub_id, message })
        }
        "NOTICE" => {
            let message = arr.get(1)?.as_str()?.to_string();
            Some(RelayMessage::Notice { message })
        }
        _ => None,
    }
}

/// Relay message types
#[derive(Debug)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<nostr::Event> },
    Ok { event_id: String, accepted: bool, message: Option<String> },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_frames() {
        match parse_relay_message(r#"["OK","abc",false,"blocked: rate limited"]"#) {
            Some(RelayMessage::Ok { event_id, accepted, message }) => {
                assert_eq!(event_id, "abc");
                assert!(!accepted);
                assert_eq!(message.as_deref(), Some("blocked: rate limited"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_relay_message(r#"["EOSE","nwc-info"]"#),
            Some(RelayMessage::Eose { sub_id }) if sub_id == "nwc-info"
        ));
        assert!(matches!(
            parse_relay_message(r#"["CLOSED","nwc-responses","auth-required: x"]"#),
            Some(RelayMessage::Closed { .. })
        ));
        assert!(parse_relay_message("not json").is_none());
        assert!(parse_relay_message(r#"["AUTH","challenge"]"#).is_none());
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let client = RelayClient::new("wss://relay.invalid");
        assert_eq!(client.state().await, RelayState::Disconnected);
        assert!(client.send("[]").await.is_err());
    }
}
