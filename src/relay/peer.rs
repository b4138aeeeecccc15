//! Peer capability
//!
//! The hub stores every connected client behind [`RelayPeer`] so that the
//! directory, subscriber registry and sessions can hold WebSocket adapters
//! and test doubles alike.

use std::net::SocketAddr;
use std::sync::Arc;

use super::error::SendError;

/// Unique identifier of a connected client
pub type ClientId = String;

/// Shared handle to a connected peer
pub type PeerRef = Arc<dyn RelayPeer>;

/// What the hub needs from a connected client
pub trait RelayPeer: Send + Sync {
    /// Stable identifier assigned on connect
    fn id(&self) -> &str;

    /// Remote socket address, when known
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Enqueue a text frame without blocking
    fn send(&self, message: String) -> Result<(), SendError>;

    /// Close the outbound queue; later sends fail with [`SendError::Closed`]
    fn close(&self);
}
