//! Relay metrics
//!
//! Name constants for everything the hub records through the `metrics`
//! facade, plus the Prometheus recorder used by `/metrics`. Without an
//! installed recorder every macro call is a no-op.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Connected WebSocket clients (gauge)
pub const ACTIVE_CONNECTIONS: &str = "nfc_relay_active_connections";
/// Live relay sessions (gauge)
pub const ACTIVE_SESSIONS: &str = "nfc_relay_active_sessions";
/// APDUs forwarded to a peer (counter, labels: direction)
pub const APDU_RELAYED_TOTAL: &str = "nfc_relay_apdu_relayed_total";
/// APDU forwards that failed (counter, labels: direction)
pub const APDU_RELAY_ERRORS_TOTAL: &str = "nfc_relay_apdu_relay_errors_total";
/// Sessions ended (counter, labels: reason)
pub const SESSION_TERMINATIONS_TOTAL: &str = "nfc_relay_session_terminations_total";
/// Error envelopes sent to clients (counter, labels: code)
pub const HUB_ERRORS_TOTAL: &str = "nfc_relay_hub_errors_total";
/// Authentication attempts (counter, labels: outcome)
pub const AUTH_EVENTS_TOTAL: &str = "nfc_relay_auth_events_total";

/// Install the global Prometheus recorder
///
/// Call once at startup, before the hub records anything.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}
