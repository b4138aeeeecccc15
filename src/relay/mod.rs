//! NFC APDU Relay
//!
//! Pairs card-emulating providers with POS receivers in the same account and
//! forwards APDU frames between them.
//!
//! ## Architecture
//!
//! - **RelayHub**: Client directory, provider subscriptions and the session table
//! - **HubDispatcher**: Drains connection events and sweeps idle sessions
//! - **Handler**: WebSocket upgrade and the per-connection read/write pumps
//! - **Protocol**: Client and server envelope formats
//!
//! ## Flow
//!
//! ```text
//! provider: client_auth -> declare_role(provider, online)
//! receiver: client_auth -> declare_role(receiver) -> list_card_providers
//! receiver: select_card_provider -> both sides get session_established
//! apdu_upstream / apdu_downstream are forwarded byte-for-byte
//! end_session, disconnect or inactivity -> session_terminated
//! ```

mod client;
mod error;
mod handler;
mod handlers;
mod hub;
pub mod metrics;
mod peer;
pub mod protocol;
mod session;

pub use client::RelayClient;
pub use error::{RelayError, RelayResult, SendError};
pub use handler::websocket_handler;
pub use hub::{ClientSnapshot, HubDispatcher, HubEvent, RelayHub, TerminationActor};
pub use peer::{ClientId, PeerRef, RelayPeer};
pub use protocol::{ClientMessage, ErrorCode, ProviderInfo, Role, ServerMessage};
pub use session::{Session, SessionId, SessionSnapshot, SessionStatus, TerminationReason};
