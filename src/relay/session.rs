//! Relay Session
//!
//! Pairing state machine and activity clock for one provider/receiver pair.
//!
//! ```text
//! WaitingForPairing --(second side set)--> Paired --(terminate)--> Terminated
//!         ^                                   |
//!         +------(remove_participant)---------+
//! ```
//!
//! Sessions are owned by the hub's session table and only mutated through
//! hub methods while the hub's write lock is held.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use super::peer::PeerRef;
use super::protocol::ApduDirection;

/// Unique identifier of a relay session
pub type SessionId = String;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    WaitingForPairing,
    Paired,
    Terminated,
}

/// Which end of the relay a participant occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Provider,
    Receiver,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// A participant sent `end_session`
    ClientRequest,
    /// A participant's connection went away
    ClientDisconnect,
    /// No relay activity within the configured timeout
    Timeout,
    /// Forwarding an APDU to the peer failed
    RelayFailure,
    /// Any other server-side reason
    Other(String),
}

impl TerminationReason {
    /// Low-cardinality label for metrics and audit event names
    pub fn label(&self) -> &'static str {
        match self {
            TerminationReason::ClientRequest => "client_request",
            TerminationReason::ClientDisconnect => "client_disconnect",
            TerminationReason::Timeout => "timeout",
            TerminationReason::RelayFailure => "apdu_error",
            TerminationReason::Other(_) => "other",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ClientRequest => f.write_str("client request"),
            TerminationReason::ClientDisconnect => f.write_str("client disconnect"),
            TerminationReason::Timeout => f.write_str("timeout"),
            TerminationReason::RelayFailure => f.write_str("relay failure"),
            TerminationReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Session state machine violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is terminated")]
    Terminated,

    #[error("{0:?} side is already occupied")]
    SideOccupied(Side),
}

/// One relay session between a provider and a receiver
pub struct Session {
    id: SessionId,
    account_id: String,
    provider: Option<PeerRef>,
    receiver: Option<PeerRef>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    terminated_at: Option<DateTime<Utc>>,
    termination_reason: Option<TerminationReason>,
    upstream_apdus: u64,
    downstream_apdus: u64,
}

impl Session {
    /// Create an empty session waiting for both participants
    pub fn new(id: impl Into<SessionId>, account_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            provider: None,
            receiver: None,
            status: SessionStatus::WaitingForPairing,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            terminated_at: None,
            termination_reason: None,
            upstream_apdus: 0,
            downstream_apdus: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Account both participants belong to
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn provider(&self) -> Option<&PeerRef> {
        self.provider.as_ref()
    }

    pub fn receiver(&self) -> Option<&PeerRef> {
        self.receiver.as_ref()
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.id())
    }

    pub fn receiver_id(&self) -> Option<&str> {
        self.receiver.as_ref().map(|p| p.id())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        self.terminated_at
    }

    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.termination_reason.as_ref()
    }

    /// Place a participant on one side
    ///
    /// Returns `true` when this call completed the pairing.
    pub fn set_participant(&mut self, side: Side, peer: PeerRef) -> Result<bool, SessionError> {
        if self.status == SessionStatus::Terminated {
            return Err(SessionError::Terminated);
        }

        let slot = match side {
            Side::Provider => &mut self.provider,
            Side::Receiver => &mut self.receiver,
        };
        if let Some(existing) = slot {
            if existing.id() != peer.id() {
                return Err(SessionError::SideOccupied(side));
            }
        }
        *slot = Some(peer);

        if self.status == SessionStatus::WaitingForPairing
            && self.provider.is_some()
            && self.receiver.is_some()
        {
            self.status = SessionStatus::Paired;
            self.last_activity = Instant::now();
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop one participant without terminating
    ///
    /// A paired session falls back to waiting. Returns `false` if the client
    /// was not a participant.
    pub fn remove_participant(&mut self, client_id: &str) -> bool {
        if self.status == SessionStatus::Terminated {
            return false;
        }

        let removed = if self.provider_id() == Some(client_id) {
            self.provider = None;
            true
        } else if self.receiver_id() == Some(client_id) {
            self.receiver = None;
            true
        } else {
            false
        };

        if removed && self.status == SessionStatus::Paired {
            self.status = SessionStatus::WaitingForPairing;
        }
        removed
    }

    /// Side the client occupies, if any
    pub fn side_of(&self, client_id: &str) -> Option<Side> {
        if self.provider_id() == Some(client_id) {
            Some(Side::Provider)
        } else if self.receiver_id() == Some(client_id) {
            Some(Side::Receiver)
        } else {
            None
        }
    }

    /// The other participant of a paired session
    pub fn peer_of(&self, client_id: &str) -> Option<&PeerRef> {
        if self.status != SessionStatus::Paired {
            return None;
        }
        match self.side_of(client_id)? {
            Side::Provider => self.receiver.as_ref(),
            Side::Receiver => self.provider.as_ref(),
        }
    }

    /// Refresh the activity clock
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Count one relayed APDU and refresh the activity clock
    pub fn record_apdu(&mut self, direction: ApduDirection) {
        match direction {
            ApduDirection::Upstream => self.upstream_apdus += 1,
            ApduDirection::Downstream => self.downstream_apdus += 1,
        }
        self.touch();
    }

    pub fn upstream_apdus(&self) -> u64 {
        self.upstream_apdus
    }

    pub fn downstream_apdus(&self) -> u64 {
        self.downstream_apdus
    }

    /// Whether a paired session has been idle longer than `timeout`
    pub fn is_inactive(&self, timeout: Duration, now: Instant) -> bool {
        self.status == SessionStatus::Paired
            && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Mark the session terminated; later calls keep the first reason
    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        self.status = SessionStatus::Terminated;
        self.terminated_at = Some(Utc::now());
        self.termination_reason = Some(reason);
    }

    pub fn is_terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    /// Serializable view for accessors and health output
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            account_id: self.account_id.clone(),
            provider_id: self.provider_id().map(str::to_string),
            receiver_id: self.receiver_id().map(str::to_string),
            status: self.status,
            created_at: self.created_at,
            idle_secs: self.last_activity.elapsed().as_secs(),
            upstream_apdus: self.upstream_apdus,
            downstream_apdus: self.downstream_apdus,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("provider", &self.provider_id())
            .field("receiver", &self.receiver_id())
            .field("status", &self.status)
            .finish()
    }
}

/// Point-in-time copy of a session's observable state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub account_id: String,
    pub provider_id: Option<String>,
    pub receiver_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub upstream_apdus: u64,
    pub downstream_apdus: u64,
}
