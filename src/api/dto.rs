//! Response bodies for the HTTP endpoints

use serde::Serialize;

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, stopping
    pub status: String,
    /// Connected WebSocket clients
    pub connections: usize,
    /// Live relay sessions
    pub sessions: usize,
    /// Online card providers across all accounts
    pub providers: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
