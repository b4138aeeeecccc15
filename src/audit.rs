//! Audit Trail
//!
//! Security-relevant hub events (pairing, termination, rejected requests)
//! are recorded as [`AuditEvent`]s through an [`AuditSink`]. The default
//! sink writes them as structured `tracing` events at target `audit`, so
//! they can be routed separately by the subscriber's filter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

/// One structured audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_initiator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_responder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            session_id: None,
            client_id_initiator: None,
            client_id_responder: None,
            source_ip: None,
            user_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn initiator(mut self, client_id: impl Into<String>) -> Self {
        self.client_id_initiator = Some(client_id.into());
        self
    }

    pub fn responder(mut self, client_id: impl Into<String>) -> Self {
        self.client_id_responder = Some(client_id.into());
        self
    }

    pub fn source(mut self, addr: Option<SocketAddr>) -> Self {
        self.source_ip = addr.map(|a| a.ip().to_string());
        self
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.filter(|u| !u.is_empty()).map(str::to_string);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit records to the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(
                target: "audit",
                event_type = %event.event_type,
                session_id = event.session_id.as_deref().unwrap_or(""),
                user_id = event.user_id.as_deref().unwrap_or(""),
                event = %json,
                "audit event"
            ),
            Err(e) => tracing::error!(
                target: "audit",
                event_type = %event.event_type,
                error = %e,
                "Failed to serialize audit event"
            ),
        }
    }
}
