//! Relay Wire Protocol
//!
//! Defines the JSON envelopes exchanged between relay clients (card
//! providers and POS receivers) and the hub. Every envelope carries a
//! `type` discriminator; field names are camelCase on the wire.
//!
//! Inbound decoding happens in two steps so the hub can enforce
//! authentication before it looks at a message body:
//!
//! 1. [`peek_type`] extracts the discriminator only.
//! 2. [`ClientMessage::decode`] parses the typed body for that discriminator.
//!    Unknown discriminators decode to [`ClientMessage::Unknown`].

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const TYPE_CLIENT_AUTH: &str = "client_auth";
pub const TYPE_DECLARE_ROLE: &str = "declare_role";
pub const TYPE_LIST_CARD_PROVIDERS: &str = "list_card_providers";
pub const TYPE_SELECT_CARD_PROVIDER: &str = "select_card_provider";
pub const TYPE_APDU_UPSTREAM: &str = "apdu_upstream";
pub const TYPE_APDU_DOWNSTREAM: &str = "apdu_downstream";
pub const TYPE_END_SESSION: &str = "end_session";
pub const TYPE_STATUS_UPDATE: &str = "status_update_to_server";

/// Role a client declares after authenticating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No role declared yet, or role cleared
    #[default]
    None,
    /// Card emulator offering APDU responses
    Provider,
    /// POS terminal issuing APDU commands
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Provider => "provider",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Role::None),
            "provider" => Ok(Role::Provider),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Relay direction of an APDU envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduDirection {
    /// Receiver (POS) to provider (card)
    Upstream,
    /// Provider (card) to receiver (POS)
    Downstream,
}

impl ApduDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApduDirection::Upstream => "upstream",
            ApduDirection::Downstream => "downstream",
        }
    }
}

/// Client-visible numeric error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    AuthRequired,
    AuthFailed,
    PermissionDenied,
    NotFound,
    ProviderNotFound,
    Conflict,
    SessionConflict,
    ProviderBusy,
    ReceiverBusy,
    SelectSelf,
    ProviderUnavailable,
    UnsupportedType,
    InternalError,
}

impl ErrorCode {
    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::BadRequest => 40001,
            ErrorCode::AuthRequired => 40101,
            ErrorCode::AuthFailed => 40102,
            ErrorCode::PermissionDenied => 40301,
            ErrorCode::NotFound => 40401,
            ErrorCode::ProviderNotFound => 40402,
            ErrorCode::Conflict => 40901,
            ErrorCode::SessionConflict => 40902,
            ErrorCode::ProviderBusy => 40903,
            ErrorCode::ReceiverBusy => 40904,
            ErrorCode::SelectSelf => 40905,
            ErrorCode::ProviderUnavailable => 40906,
            ErrorCode::UnsupportedType => 41501,
            ErrorCode::InternalError => 50001,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Discriminator-only view of an inbound envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Extract the `type` discriminator without decoding the body
pub fn peek_type(raw: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str::<Envelope>(raw).map(|e| e.kind)
}

/// Messages sent from client to hub
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection with a bearer token
    ClientAuth {
        #[serde(default)]
        token: String,
    },
    /// Declare role, availability and (for providers) a display name
    #[serde(rename_all = "camelCase")]
    DeclareRole {
        role: String,
        #[serde(default)]
        online: bool,
        #[serde(default)]
        provider_name: String,
    },
    /// Request the provider directory for the caller's account
    ListCardProviders,
    /// Pair with a listed provider
    #[serde(rename_all = "camelCase")]
    SelectCardProvider {
        #[serde(default)]
        provider_id: String,
    },
    /// APDU command from the receiver
    #[serde(rename_all = "camelCase")]
    ApduUpstream {
        #[serde(default)]
        session_id: String,
        apdu: String,
    },
    /// APDU response from the provider
    #[serde(rename_all = "camelCase")]
    ApduDownstream {
        #[serde(default)]
        session_id: String,
        apdu: String,
    },
    /// End the caller's current session
    #[serde(rename_all = "camelCase")]
    EndSession {
        #[serde(default)]
        session_id: String,
    },
    /// Device status to forward to the session peer
    #[serde(rename = "status_update_to_server", rename_all = "camelCase")]
    StatusUpdate {
        #[serde(default)]
        session_id: String,
        status: String,
        #[serde(default)]
        details: Option<String>,
    },
    /// Any discriminator the hub does not handle
    #[serde(skip)]
    Unknown { kind: String },
}

impl ClientMessage {
    /// Decode the typed body for an already-peeked discriminator
    pub fn decode(kind: &str, raw: &str) -> Result<Self, serde_json::Error> {
        if !is_known_type(kind) {
            return Ok(ClientMessage::Unknown {
                kind: kind.to_string(),
            });
        }
        serde_json::from_str(raw)
    }

    /// Wire discriminator of this message
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::ClientAuth { .. } => TYPE_CLIENT_AUTH,
            ClientMessage::DeclareRole { .. } => TYPE_DECLARE_ROLE,
            ClientMessage::ListCardProviders => TYPE_LIST_CARD_PROVIDERS,
            ClientMessage::SelectCardProvider { .. } => TYPE_SELECT_CARD_PROVIDER,
            ClientMessage::ApduUpstream { .. } => TYPE_APDU_UPSTREAM,
            ClientMessage::ApduDownstream { .. } => TYPE_APDU_DOWNSTREAM,
            ClientMessage::EndSession { .. } => TYPE_END_SESSION,
            ClientMessage::StatusUpdate { .. } => TYPE_STATUS_UPDATE,
            ClientMessage::Unknown { kind } => kind,
        }
    }

    /// Session the message refers to, if it names one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::ApduUpstream { session_id, .. }
            | ClientMessage::ApduDownstream { session_id, .. }
            | ClientMessage::EndSession { session_id }
            | ClientMessage::StatusUpdate { session_id, .. } => {
                Some(session_id.as_str()).filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }
}

fn is_known_type(kind: &str) -> bool {
    matches!(
        kind,
        TYPE_CLIENT_AUTH
            | TYPE_DECLARE_ROLE
            | TYPE_LIST_CARD_PROVIDERS
            | TYPE_SELECT_CARD_PROVIDER
            | TYPE_APDU_UPSTREAM
            | TYPE_APDU_DOWNSTREAM
            | TYPE_END_SESSION
            | TYPE_STATUS_UPDATE
    )
}

/// One entry of the provider directory as shown to receivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub provider_id: String,
    pub provider_name: String,
    pub user_id: String,
    pub is_busy: bool,
}

/// Messages sent from hub to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of `client_auth`
    #[serde(rename_all = "camelCase")]
    ServerAuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Result of `declare_role`
    RoleDeclaredResponse {
        success: bool,
        role: Role,
        online: bool,
    },
    /// Provider directory snapshot for the caller's account
    CardProvidersList { providers: Vec<ProviderInfo> },
    /// Pairing completed
    #[serde(rename_all = "camelCase")]
    SessionEstablished {
        session_id: String,
        peer_id: String,
        peer_role: Role,
    },
    /// Session ended
    #[serde(rename_all = "camelCase")]
    SessionTerminated { session_id: String, reason: String },
    /// Status pushed by the session peer
    #[serde(rename_all = "camelCase")]
    PeerStatusUpdate {
        session_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Protocol error
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ServerMessage {
    /// Serialize to the wire representation
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
