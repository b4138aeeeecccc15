//! # NFC Relay
//!
//! WebSocket hub that relays NFC APDU traffic between a phone emulating a
//! card (the provider) and a POS terminal (the receiver).
//!
//! ## Modules
//!
//! - [`relay`]: Hub, sessions, wire protocol and WebSocket pumps
//! - [`auth`]: Token validation for `client_auth`
//! - [`audit`]: Structured audit records
//! - [`config`]: TOML configuration with environment overrides
//! - [`api`]: Axum server exposing `/ws`, health and metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nfc_relay::{serve, AppState, Config, JwtValidator, RelayHub, TracingAuditSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let validator = Arc::new(JwtValidator::new(&config.auth.jwt_secret));
//!     let (hub, dispatcher) =
//!         RelayHub::new(config.relay.clone(), validator, Arc::new(TracingAuditSink));
//!     tokio::spawn(dispatcher.run());
//!
//!     serve(AppState::new(hub, config)).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod relay;

pub use api::{build_router, serve, ApiError, AppState};

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};

pub use auth::{AuthError, Identity, JwtValidator, TokenValidator};

pub use config::{
    AuthConfig, Config, ConfigError, LoggingConfig, RelayConfig, ServerConfig,
};

pub use relay::{
    ClientMessage, HubDispatcher, RelayError, RelayHub, ServerMessage, SessionSnapshot,
    SessionStatus, TerminationReason,
};
