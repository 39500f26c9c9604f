//! Nostr - relay plumbing for remote-control wallets
//!
//! - Relay connections via tokio-tungstenite WebSocket ([`RelayClient`])
//! - NIP-47 request/response over NIP-04 encrypted events ([`RelayNwcConnector`])
//!
//! # Event kinds
//!
//! | Kind | Direction | Meaning |
//! |------|-----------|---------|
//! | 13194 | wallet → relay | Capability advertisement (replaceable) |
//! | 23194 | client → wallet | Encrypted request |
//! | 23195 | wallet → client | Encrypted response, `e`-tagged with the request id |
//! | 23196 | wallet → client | Encrypted notification |

pub mod client;
mod nwc;

pub use client::{parse_relay_message, RelayClient, RelayMessage, RelayState};
pub use nwc::{RelayNwcConnector, RelayNwcTransport};

/// NIP-47 event kinds
pub mod kinds {
    pub const NWC_INFO: u16 = 13194;
    pub const NWC_REQUEST: u16 = 23194;
    pub const NWC_RESPONSE: u16 = 23195;
    pub const NWC_NOTIFICATION: u16 = 23196;
}
