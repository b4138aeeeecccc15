//! Connection adapter
//!
//! [`RelayClient`] is the hub-facing half of one WebSocket connection: an
//! identity plus the sending end of a bounded outbound queue. The socket
//! pumps in `handler.rs` own the other half.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::error::SendError;
use super::peer::RelayPeer;

/// One connected WebSocket client
pub struct RelayClient {
    id: String,
    remote_addr: Option<SocketAddr>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
}

impl RelayClient {
    /// Create a client with a fresh ID and a queue of `capacity` frames
    ///
    /// Returns the receiving end for the outbound pump.
    pub fn new(
        remote_addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            outbound: Mutex::new(Some(tx)),
        });
        (client, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

impl RelayPeer for RelayClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn send(&self, message: String) -> Result<(), SendError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(SendError::Closed)?;
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&self) {
        self.outbound.lock().take();
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
