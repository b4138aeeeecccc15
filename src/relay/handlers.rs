//! Protocol handlers
//!
//! One method per client message type. Each returns `RelayResult<()>`; the
//! dispatcher in `hub.rs` turns an `Err` into an `error` envelope.

use metrics::{counter, gauge};
use uuid::Uuid;

use super::error::{RelayError, RelayResult};
use super::hub::{default_provider_name, deliver, RelayHub, TerminationActor};
use super::metrics::{
    ACTIVE_SESSIONS, APDU_RELAYED_TOTAL, APDU_RELAY_ERRORS_TOTAL, AUTH_EVENTS_TOTAL,
};
use super::peer::PeerRef;
use super::protocol::{ApduDirection, Role, ServerMessage};
use super::session::{Session, Side, TerminationReason};
use crate::audit::AuditEvent;

const SESSION_ENDED_BY_REQUEST: &str = "session ended by request";

impl RelayHub {
    pub(super) async fn handle_client_auth(&self, peer: &PeerRef, token: String) -> RelayResult<()> {
        let client_id = peer.id();
        if token.trim().is_empty() {
            counter!(AUTH_EVENTS_TOTAL, "outcome" => "failure").increment(1);
            return Err(RelayError::AuthFailed("Token is missing".to_string()));
        }

        let identity = match self.inner.validator.validate(&token).await {
            Ok(identity) => identity,
            Err(e) => {
                counter!(AUTH_EVENTS_TOTAL, "outcome" => "failure").increment(1);
                tracing::warn!(client_id = %client_id, reason = e.reason(), "Token validation failed");
                return Err(RelayError::AuthFailed(e.to_string()));
            }
        };

        {
            let mut state = self.inner.state.write().await;
            let Some(record) = state.clients.get_mut(client_id) else {
                return Ok(());
            };
            if let Some(existing) = &record.account_id {
                if existing != &identity.user_id {
                    return Err(RelayError::PermissionDenied(
                        "Connection is already authenticated as another user".to_string(),
                    ));
                }
            }
            record.authenticated = true;
            record.account_id = Some(identity.user_id.clone());
        }

        counter!(AUTH_EVENTS_TOTAL, "outcome" => "success").increment(1);
        tracing::info!(client_id = %client_id, user_id = %identity.user_id, "Client authenticated");

        let reply = ServerMessage::ServerAuthResponse {
            success: true,
            user_id: Some(identity.user_id),
            message: None,
        };
        if let Err(e) = deliver(peer, &reply) {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to send auth response");
        }
        Ok(())
    }

    pub(super) async fn handle_declare_role(
        &self,
        peer: &PeerRef,
        role: &str,
        online: bool,
        provider_name: &str,
    ) -> RelayResult<()> {
        let client_id = peer.id();
        let role: Role = role
            .parse()
            .map_err(|_| RelayError::BadRequest("Invalid role specified".to_string()))?;
        let provider_name = provider_name.trim();

        let (directory_changed, account_id) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(record) = state.clients.get_mut(client_id) else {
                return Ok(());
            };
            let listed = state.providers.contains(client_id);

            record.role = role;
            record.online = online;
            let mut changed = false;
            match role {
                Role::Provider => {
                    if !provider_name.is_empty() {
                        record.display_name = Some(provider_name.to_string());
                    }
                    if online && !listed {
                        if record.display_name.is_none() {
                            record.display_name = Some(default_provider_name(client_id));
                        }
                        state.providers.insert(client_id.to_string());
                        changed = true;
                    } else if !online && listed {
                        state.providers.remove(client_id);
                        changed = true;
                    }
                }
                Role::Receiver | Role::None => {
                    record.display_name = None;
                    if listed {
                        state.providers.remove(client_id);
                        changed = true;
                    }
                }
            }
            (changed, record.account_id.clone())
        };

        tracing::info!(
            client_id = %client_id,
            role = %role,
            online,
            directory_changed,
            "Role declared"
        );

        if directory_changed {
            if let Some(account_id) = account_id {
                self.spawn_notify(account_id);
            }
        }

        let reply = ServerMessage::RoleDeclaredResponse {
            success: true,
            role,
            online,
        };
        if let Err(e) = deliver(peer, &reply) {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to send role response");
        }
        Ok(())
    }

    pub(super) async fn handle_list_card_providers(&self, peer: &PeerRef) -> RelayResult<()> {
        let client_id = peer.id();
        let providers = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(record) = state.clients.get(client_id) else {
                return Ok(());
            };
            if record.role == Role::Provider {
                return Err(RelayError::PermissionDenied(
                    "Card providers cannot list providers".to_string(),
                ));
            }
            let account_id = record.account_id.clone().ok_or(RelayError::AuthRequired)?;
            state
                .subscribers
                .entry(account_id.clone())
                .or_default()
                .insert(client_id.to_string());
            state.provider_list(&account_id)
        };

        tracing::debug!(client_id = %client_id, count = providers.len(), "Provider list requested");
        if let Err(e) = deliver(peer, &ServerMessage::CardProvidersList { providers }) {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to send provider list");
        }
        Ok(())
    }

    pub(super) async fn handle_select_card_provider(
        &self,
        peer: &PeerRef,
        provider_id: &str,
    ) -> RelayResult<()> {
        let provider_id = provider_id.trim();
        if !self.check_selection(peer.id(), provider_id).await? {
            return Ok(());
        }
        self.commit_selection(peer, provider_id).await
    }

    /// Pairing preconditions under the read lock
    ///
    /// Returns `false` if the caller is no longer registered.
    pub(super) async fn check_selection(
        &self,
        receiver_id: &str,
        provider_id: &str,
    ) -> RelayResult<bool> {
        let state = self.inner.state.read().await;
        let Some(receiver) = state.clients.get(receiver_id) else {
            return Ok(false);
        };
        if receiver.role != Role::Receiver {
            return Err(RelayError::PermissionDenied(
                "Only receivers can select a card provider".to_string(),
            ));
        }
        if provider_id.is_empty() {
            return Err(RelayError::BadRequest("providerId is required".to_string()));
        }
        let provider = state
            .providers
            .get(provider_id)
            .and_then(|id| state.clients.get(id))
            .ok_or_else(|| {
                RelayError::ProviderNotFound("Card provider not found or offline".to_string())
            })?;
        if provider.account_id != receiver.account_id {
            return Err(RelayError::PermissionDenied(
                "Card provider belongs to another account".to_string(),
            ));
        }
        if provider_id == receiver_id {
            return Err(RelayError::SelectSelf);
        }
        if state.is_sessioned(receiver) {
            return Err(RelayError::ReceiverBusy);
        }
        if state.is_sessioned(provider) {
            return Err(RelayError::ProviderBusy);
        }
        Ok(true)
    }

    /// Re-validate under the write lock, then create the session and notify
    pub(super) async fn commit_selection(
        &self,
        peer: &PeerRef,
        provider_id: &str,
    ) -> RelayResult<()> {
        let receiver_id = peer.id();
        let (session_id, provider_peer, account_id) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let unavailable =
                || RelayError::ProviderUnavailable("Card provider is no longer available".to_string());

            if !state.providers.contains(provider_id) {
                return Err(unavailable());
            }
            let provider = state.clients.get(provider_id).ok_or_else(unavailable)?;
            let receiver = state
                .clients
                .get(receiver_id)
                .ok_or_else(|| RelayError::Internal("Receiver is no longer connected".to_string()))?;
            if provider.account_id != receiver.account_id || provider_id == receiver_id {
                return Err(unavailable());
            }
            if state.is_sessioned(provider) || state.is_sessioned(receiver) {
                return Err(RelayError::SessionConflict(
                    "Pairing state changed, please retry".to_string(),
                ));
            }
            let account_id = receiver.account_id.clone().ok_or(RelayError::AuthRequired)?;
            let provider_peer = provider.peer.clone();

            let session_id = Uuid::new_v4().to_string();
            let mut session = Session::new(session_id.clone(), account_id.clone());
            session
                .set_participant(Side::Provider, provider_peer.clone())
                .and_then(|_| session.set_participant(Side::Receiver, peer.clone()))
                .map_err(|e| RelayError::Internal(e.to_string()))?;
            state.sessions.insert(session_id.clone(), session);

            for id in [provider_id, receiver_id] {
                if let Some(record) = state.clients.get_mut(id) {
                    record.session_id = Some(session_id.clone());
                }
            }
            (session_id, provider_peer, account_id)
        };

        gauge!(ACTIVE_SESSIONS).increment(1.0);
        tracing::info!(
            session_id = %session_id,
            provider_id = %provider_id,
            receiver_id = %receiver_id,
            user_id = %account_id,
            "Session established"
        );

        let to_provider = ServerMessage::SessionEstablished {
            session_id: session_id.clone(),
            peer_id: receiver_id.to_string(),
            peer_role: Role::Receiver,
        };
        if let Err(e) = deliver(&provider_peer, &to_provider) {
            tracing::warn!(client_id = %provider_id, session_id = %session_id, error = %e, "Failed to notify provider");
        }
        let to_receiver = ServerMessage::SessionEstablished {
            session_id: session_id.clone(),
            peer_id: provider_id.to_string(),
            peer_role: Role::Provider,
        };
        if let Err(e) = deliver(peer, &to_receiver) {
            tracing::warn!(client_id = %receiver_id, session_id = %session_id, error = %e, "Failed to notify receiver");
        }

        self.inner.audit.record(
            AuditEvent::new("session_established")
                .session(session_id)
                .initiator(receiver_id)
                .responder(provider_id)
                .source(peer.remote_addr())
                .user(Some(account_id.as_str())),
        );
        self.spawn_notify(account_id);
        Ok(())
    }

    pub(super) async fn handle_apdu(
        &self,
        peer: &PeerRef,
        direction: ApduDirection,
        raw: &str,
    ) -> RelayResult<()> {
        let client_id = peer.id();

        let (session_id, target, user_id) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(record) = state.clients.get_mut(client_id) else {
                return Ok(());
            };
            let user_id = record.account_id.clone();
            let Some(session_id) = record.session_id.clone() else {
                return Err(RelayError::BadRequest(
                    "Not in a relay session, cannot send APDU".to_string(),
                ));
            };
            let Some(session) = state.sessions.get_mut(&session_id) else {
                record.session_id = None;
                return Err(RelayError::SessionConflict(
                    "Relay session is no longer valid".to_string(),
                ));
            };
            session.record_apdu(direction);
            let target = session.peer_of(client_id).cloned().ok_or_else(|| {
                RelayError::ProviderNotFound("Session peer is not connected".to_string())
            })?;
            (session_id, target, user_id)
        };

        if let Err(e) = target.send(raw.to_string()) {
            counter!(APDU_RELAY_ERRORS_TOTAL, "direction" => direction.as_str()).increment(1);
            tracing::error!(
                session_id = %session_id,
                client_id = %client_id,
                target_id = %target.id(),
                direction = direction.as_str(),
                error = %e,
                "APDU forward failed"
            );

            let failure = RelayError::Internal(format!("Failed to forward APDU to peer: {}", e));
            if let Err(send_err) = deliver(peer, &failure.to_message(Some(session_id.clone()))) {
                tracing::debug!(client_id = %client_id, error = %send_err, "Failed to report relay failure");
            }
            self.inner.audit.record(
                AuditEvent::new("apdu_relay_failure")
                    .session(session_id.clone())
                    .initiator(client_id)
                    .responder(target.id())
                    .user(user_id.as_deref())
                    .details(serde_json::json!({
                        "direction": direction.as_str(),
                        "error": e.to_string(),
                    })),
            );

            let actor = TerminationActor::Client {
                client_id: client_id.to_string(),
                user_id,
            };
            self.terminate_session(&session_id, TerminationReason::RelayFailure, actor)
                .await;
            return Ok(());
        }

        counter!(APDU_RELAYED_TOTAL, "direction" => direction.as_str()).increment(1);
        tracing::debug!(
            session_id = %session_id,
            from = %client_id,
            to = %target.id(),
            direction = direction.as_str(),
            len = raw.len(),
            "APDU relayed"
        );
        Ok(())
    }

    pub(super) async fn handle_end_session(&self, peer: &PeerRef, session_id: &str) -> RelayResult<()> {
        let client_id = peer.id();
        let (current, user_id) = {
            let state = self.inner.state.read().await;
            match state.clients.get(client_id) {
                Some(record) => (record.session_id.clone(), record.account_id.clone()),
                None => return Ok(()),
            }
        };

        if session_id.is_empty() || current.as_deref() != Some(session_id) {
            return Err(RelayError::PermissionDenied(
                "Cannot end session: ID mismatch or invalid".to_string(),
            ));
        }

        let actor = TerminationActor::Client {
            client_id: client_id.to_string(),
            user_id,
        };
        let terminated = self
            .terminate_session(session_id, TerminationReason::ClientRequest, actor)
            .await;
        if !terminated {
            // already ended elsewhere; that path sent its own notice
            tracing::debug!(client_id = %client_id, session_id = %session_id, "Session already gone");
            return Ok(());
        }

        let confirmation = ServerMessage::SessionTerminated {
            session_id: session_id.to_string(),
            reason: SESSION_ENDED_BY_REQUEST.to_string(),
        };
        if let Err(e) = deliver(peer, &confirmation) {
            tracing::debug!(client_id = %client_id, error = %e, "Failed to confirm end of session");
        }
        Ok(())
    }

    pub(super) async fn handle_status_update(
        &self,
        peer: &PeerRef,
        session_id: &str,
        status: String,
        details: Option<String>,
    ) -> RelayResult<()> {
        let client_id = peer.id();
        let target = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(record) = state.clients.get(client_id) else {
                return Ok(());
            };
            if session_id.is_empty() || record.session_id.as_deref() != Some(session_id) {
                return Err(RelayError::PermissionDenied(
                    "Not a participant of this session".to_string(),
                ));
            }
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Err(RelayError::SessionConflict(
                    "Relay session is no longer valid".to_string(),
                ));
            };
            session.touch();
            session.peer_of(client_id).cloned()
        };

        let Some(target) = target else {
            tracing::debug!(client_id = %client_id, session_id = %session_id, "Status update with no peer");
            return Ok(());
        };

        tracing::info!(
            session_id = %session_id,
            client_id = %client_id,
            status = %status,
            "Forwarding status update"
        );
        let update = ServerMessage::PeerStatusUpdate {
            session_id: session_id.to_string(),
            status,
            details,
        };
        if let Err(e) = deliver(&target, &update) {
            tracing::warn!(client_id = %target.id(), session_id = %session_id, error = %e, "Failed to forward status update");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::MemoryAuditSink;
    use crate::auth::testing::StaticValidator;
    use crate::config::RelayConfig;
    use crate::relay::hub::HubEvent;
    use crate::relay::peer::mock::MockPeer;
    use crate::relay::peer::RelayPeer;
    use crate::relay::protocol::ErrorCode;
    use crate::relay::session::SessionStatus;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        hub: RelayHub,
        audit: Arc<MemoryAuditSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(RelayConfig::default())
        }

        fn with_config(config: RelayConfig) -> Self {
            let audit = Arc::new(MemoryAuditSink::default());
            let (hub, _dispatcher) = RelayHub::new(config, Arc::new(StaticValidator), audit.clone());
            Self { hub, audit }
        }

        async fn connect(&self, id: &str) -> Arc<MockPeer> {
            let peer = MockPeer::new(id);
            self.hub.handle_event(HubEvent::Register(peer.clone())).await;
            peer
        }

        async fn send(&self, peer: &MockPeer, payload: Value) {
            self.send_raw(peer, payload.to_string()).await;
        }

        async fn send_raw(&self, peer: &MockPeer, payload: String) {
            self.hub
                .handle_event(HubEvent::Inbound {
                    client_id: peer.id().to_string(),
                    payload,
                })
                .await;
        }

        async fn disconnect(&self, peer: &MockPeer) {
            self.hub
                .handle_event(HubEvent::Unregister(peer.id().to_string()))
                .await;
        }

        async fn authed(&self, id: &str, account: &str) -> Arc<MockPeer> {
            let peer = self.connect(id).await;
            self.send(&peer, json!({ "type": "client_auth", "token": format!("valid:{account}") }))
                .await;
            peer
        }

        async fn provider(&self, id: &str, account: &str, name: &str) -> Arc<MockPeer> {
            let peer = self.authed(id, account).await;
            self.send(
                &peer,
                json!({ "type": "declare_role", "role": "provider", "online": true, "providerName": name }),
            )
            .await;
            self.hub.wait_background().await;
            peer.clear();
            peer
        }

        async fn receiver(&self, id: &str, account: &str) -> Arc<MockPeer> {
            let peer = self.authed(id, account).await;
            self.send(&peer, json!({ "type": "declare_role", "role": "receiver", "online": true }))
                .await;
            peer.clear();
            peer
        }

        /// Pair and return the session ID
        async fn pair(&self, receiver: &MockPeer, provider: &MockPeer) -> String {
            self.send(
                receiver,
                json!({ "type": "select_card_provider", "providerId": provider.id() }),
            )
            .await;
            self.hub.wait_background().await;
            let established = receiver
                .sent_of_type("session_established")
                .pop()
                .expect("receiver was not paired");
            receiver.clear();
            provider.clear();
            established["sessionId"].as_str().unwrap().to_string()
        }

        async fn listing(&self, receiver: &MockPeer) -> Vec<Value> {
            receiver.clear();
            self.send(receiver, json!({ "type": "list_card_providers" })).await;
            let reply = receiver.last_json().expect("no provider list");
            assert_eq!(reply["type"], "card_providers_list");
            receiver.clear();
            reply["providers"].as_array().cloned().unwrap_or_default()
        }
    }

    fn error_code(peer: &MockPeer) -> Option<u64> {
        peer.sent_of_type("error")
            .last()
            .and_then(|e| e["code"].as_u64())
    }

    #[tokio::test]
    async fn test_auth_success() {
        let h = Harness::new();
        let peer = h.authed("c1", "acct1").await;

        let reply = peer.last_json().unwrap();
        assert_eq!(reply["type"], "server_auth_response");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["userId"], "acct1");

        let snapshot = h.hub.client_snapshot("c1").await.unwrap();
        assert!(snapshot.authenticated);
        assert_eq!(snapshot.user_id.as_deref(), Some("acct1"));
    }

    #[tokio::test]
    async fn test_auth_missing_token() {
        let h = Harness::new();
        let peer = h.connect("c1").await;
        h.send(&peer, json!({ "type": "client_auth", "token": "" })).await;

        let reply = peer.last_json().unwrap();
        assert_eq!(reply["code"], ErrorCode::AuthFailed.as_u32());
        assert_eq!(reply["message"], "Token is missing");
        assert!(!h.hub.client_snapshot("c1").await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_auth_failure_message() {
        let h = Harness::new();
        let peer = h.connect("c1").await;
        h.send(&peer, json!({ "type": "client_auth", "token": "expired" })).await;

        let reply = peer.last_json().unwrap();
        assert_eq!(reply["code"], 40102);
        assert_eq!(reply["message"], "Token has expired");
        assert_eq!(h.audit.of_type("auth_failure").len(), 1);
    }

    #[tokio::test]
    async fn test_reauth_as_other_user_rejected() {
        let h = Harness::new();
        let peer = h.authed("c1", "acct1").await;
        h.send(&peer, json!({ "type": "client_auth", "token": "valid:acct2" })).await;

        assert_eq!(error_code(&peer), Some(40301));
        let snapshot = h.hub.client_snapshot("c1").await.unwrap();
        assert_eq!(snapshot.user_id.as_deref(), Some("acct1"));
    }

    #[tokio::test]
    async fn test_declare_invalid_role() {
        let h = Harness::new();
        let peer = h.authed("c1", "acct1").await;
        h.send(&peer, json!({ "type": "declare_role", "role": "admin", "online": true }))
            .await;

        let reply = peer.last_json().unwrap();
        assert_eq!(reply["code"], 40001);
        assert_eq!(reply["message"], "Invalid role specified");
    }

    #[tokio::test]
    async fn test_provider_listed_with_name() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;

        let providers = h.listing(&pos).await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0]["providerId"], card.id());
        assert_eq!(providers[0]["providerName"], "CardX");
        assert_eq!(providers[0]["userId"], "acct1");
        assert_eq!(providers[0]["isBusy"], false);
    }

    #[tokio::test]
    async fn test_role_response_sent() {
        let h = Harness::new();
        let peer = h.authed("c1", "acct1").await;
        peer.clear();
        h.send(&peer, json!({ "type": "declare_role", "role": "provider", "online": true }))
            .await;

        let reply = peer.last_json().unwrap();
        assert_eq!(reply["type"], "role_declared_response");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["role"], "provider");
        assert_eq!(reply["online"], true);
    }

    #[tokio::test]
    async fn test_default_provider_name_and_name_rules() {
        let h = Harness::new();
        let card = h.provider("0123456789abcdef", "acct1", "").await;
        let pos = h.receiver("pos", "acct1").await;
        assert_eq!(h.listing(&pos).await[0]["providerName"], "Provider 01234567");

        // supplied name replaces the current one
        h.send(&card, json!({ "type": "declare_role", "role": "provider", "online": true, "providerName": "Renamed" }))
            .await;
        assert_eq!(h.listing(&pos).await[0]["providerName"], "Renamed");

        // empty name keeps the existing one
        h.send(&card, json!({ "type": "declare_role", "role": "provider", "online": true }))
            .await;
        assert_eq!(h.listing(&pos).await[0]["providerName"], "Renamed");
    }

    #[tokio::test]
    async fn test_provider_offline_and_role_change_remove_listing() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;

        h.send(&card, json!({ "type": "declare_role", "role": "provider", "online": false }))
            .await;
        assert!(h.listing(&pos).await.is_empty());

        h.send(&card, json!({ "type": "declare_role", "role": "provider", "online": true }))
            .await;
        assert_eq!(h.listing(&pos).await.len(), 1);

        h.send(&card, json!({ "type": "declare_role", "role": "receiver", "online": true }))
            .await;
        assert!(h.listing(&pos).await.is_empty());
        assert_eq!(h.hub.client_snapshot("card").await.unwrap().display_name, None);
    }

    #[tokio::test]
    async fn test_listing_is_scoped_by_account_and_sorted() {
        let h = Harness::new();
        h.provider("b-card", "acct1", "Bravo").await;
        h.provider("a-card", "acct1", "Alpha").await;
        h.provider("z-card", "acct1", "Alpha").await;
        h.provider("other", "acct2", "Foreign").await;
        let pos = h.receiver("pos", "acct1").await;

        let providers = h.listing(&pos).await;
        let ids: Vec<&str> = providers
            .iter()
            .map(|p| p["providerId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a-card", "z-card", "b-card"]);
        assert_eq!(h.hub.provider_count().await, 4);
    }

    #[tokio::test]
    async fn test_provider_cannot_list() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        h.send(&card, json!({ "type": "list_card_providers" })).await;
        assert_eq!(error_code(&card), Some(40301));
    }

    #[tokio::test]
    async fn test_unroled_client_may_list_and_is_subscribed() {
        let h = Harness::new();
        let watcher = h.authed("watcher", "acct1").await;
        let providers = h.listing(&watcher).await;
        assert!(providers.is_empty());

        h.provider("card", "acct1", "CardX").await;
        let pushed = watcher.sent_of_type("card_providers_list");
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["providers"][0]["providerName"], "CardX");
    }

    #[tokio::test]
    async fn test_name_only_update_does_not_notify() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        h.listing(&pos).await;

        h.send(&card, json!({ "type": "declare_role", "role": "provider", "online": true, "providerName": "CardY" }))
            .await;
        h.hub.wait_background().await;
        assert!(pos.sent_of_type("card_providers_list").is_empty());
    }

    #[tokio::test]
    async fn test_pairing_scenario() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;

        h.send(&pos, json!({ "type": "select_card_provider", "providerId": "card" }))
            .await;
        h.hub.wait_background().await;

        let to_pos = pos.sent_of_type("session_established");
        let to_card = card.sent_of_type("session_established");
        assert_eq!(to_pos.len(), 1);
        assert_eq!(to_card.len(), 1);
        assert_eq!(to_pos[0]["sessionId"], to_card[0]["sessionId"]);
        assert_eq!(to_pos[0]["peerId"], "card");
        assert_eq!(to_pos[0]["peerRole"], "provider");
        assert_eq!(to_card[0]["peerId"], "pos");
        assert_eq!(to_card[0]["peerRole"], "receiver");

        let session_id = to_pos[0]["sessionId"].as_str().unwrap();
        let snapshot = h.hub.session_snapshot(session_id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Paired);
        assert_eq!(snapshot.provider_id.as_deref(), Some("card"));
        assert_eq!(snapshot.receiver_id.as_deref(), Some("pos"));
        assert_eq!(
            h.hub.client_snapshot("card").await.unwrap().session_id.as_deref(),
            Some(session_id)
        );

        assert_eq!(h.listing(&pos).await[0]["isBusy"], true);
        assert_eq!(h.audit.of_type("session_established").len(), 1);
    }

    #[tokio::test]
    async fn test_select_validation_errors() {
        let h = Harness::new();
        h.provider("card", "acct1", "CardX").await;
        h.provider("foreign", "acct2", "Foreign").await;
        let pos = h.receiver("pos", "acct1").await;
        let unroled = h.authed("unroled", "acct1").await;

        h.send(&unroled, json!({ "type": "select_card_provider", "providerId": "card" }))
            .await;
        assert_eq!(error_code(&unroled), Some(40301));

        h.send(&pos, json!({ "type": "select_card_provider", "providerId": "" }))
            .await;
        assert_eq!(error_code(&pos), Some(40001));

        h.send(&pos, json!({ "type": "select_card_provider", "providerId": "nobody" }))
            .await;
        assert_eq!(error_code(&pos), Some(40402));

        h.send(&pos, json!({ "type": "select_card_provider", "providerId": "foreign" }))
            .await;
        assert_eq!(error_code(&pos), Some(40301));
        assert_eq!(h.hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_busy_provider_and_busy_receiver() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let card2 = h.provider("card2", "acct1", "CardY").await;
        let pos = h.receiver("pos", "acct1").await;
        let pos2 = h.receiver("pos2", "acct1").await;
        h.pair(&pos, &card).await;

        h.send(&pos2, json!({ "type": "select_card_provider", "providerId": "card" }))
            .await;
        assert_eq!(error_code(&pos2), Some(ErrorCode::ProviderBusy.as_u32() as u64));

        h.send(&pos, json!({ "type": "select_card_provider", "providerId": card2.id() }))
            .await;
        assert_eq!(error_code(&pos), Some(ErrorCode::ReceiverBusy.as_u32() as u64));
        assert_eq!(h.hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_selection_yields_one_session() {
        let h = Harness::new();
        h.provider("card", "acct1", "CardX").await;
        let pos1 = h.receiver("pos1", "acct1").await;
        let pos2 = h.receiver("pos2", "acct1").await;

        let select = |peer: &Arc<MockPeer>| HubEvent::Inbound {
            client_id: peer.id().to_string(),
            payload: json!({ "type": "select_card_provider", "providerId": "card" }).to_string(),
        };
        tokio::join!(
            h.hub.handle_event(select(&pos1)),
            h.hub.handle_event(select(&pos2)),
        );
        h.hub.wait_background().await;

        assert_eq!(h.hub.session_count().await, 1);
        let established = pos1.sent_of_type("session_established").len()
            + pos2.sent_of_type("session_established").len();
        assert_eq!(established, 1);

        let errors: Vec<u64> = [error_code(&pos1), error_code(&pos2)]
            .into_iter()
            .flatten()
            .collect();
        // the loser is rejected by the read-lock checks
        assert_eq!(errors, vec![ErrorCode::ProviderBusy.as_u32() as u64]);
    }

    #[tokio::test]
    async fn test_provider_offline_between_checks_is_unavailable() {
        let h = Harness::new();
        h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let caller: PeerRef = pos.clone();

        assert!(h.hub.check_selection("pos", "card").await.unwrap());
        h.hub.inner.state.write().await.providers.remove("card");

        let err = h.hub.commit_selection(&caller, "card").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProviderUnavailable);
        assert_eq!(err.code().as_u32(), 40906);
        assert_eq!(h.hub.session_count().await, 0);
        assert!(h.hub.client_snapshot("pos").await.unwrap().session_id.is_none());
        assert!(pos.sent_of_type("session_established").is_empty());
    }

    #[tokio::test]
    async fn test_provider_paired_between_checks_is_conflict() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos1 = h.receiver("pos1", "acct1").await;
        let pos2 = h.receiver("pos2", "acct1").await;
        let caller: PeerRef = pos1.clone();

        assert!(h.hub.check_selection("pos1", "card").await.unwrap());
        let session_id = h.pair(&pos2, &card).await;

        let err = h.hub.commit_selection(&caller, "card").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionConflict);
        assert_eq!(err.code().as_u32(), 40902);

        assert_eq!(h.hub.session_count().await, 1);
        let snapshot = h.hub.session_snapshot(&session_id).await.unwrap();
        assert_eq!(snapshot.receiver_id.as_deref(), Some("pos2"));
        assert!(h.hub.client_snapshot("pos1").await.unwrap().session_id.is_none());
        assert!(pos1.sent_of_type("session_established").is_empty());
    }

    #[tokio::test]
    async fn test_check_selection_for_unregistered_caller() {
        let h = Harness::new();
        h.provider("card", "acct1", "CardX").await;
        assert!(!h.hub.check_selection("ghost", "card").await.unwrap());
    }

    #[tokio::test]
    async fn test_apdu_relayed_verbatim() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        let upstream = json!({ "type": "apdu_upstream", "sessionId": session_id, "apdu": "00A4040007" })
            .to_string();
        h.send_raw(&pos, upstream.clone()).await;
        assert_eq!(card.sent(), vec![upstream]);

        let downstream = json!({ "type": "apdu_downstream", "sessionId": session_id, "apdu": "9000" })
            .to_string();
        h.send_raw(&card, downstream.clone()).await;
        assert_eq!(pos.sent(), vec![downstream]);

        let snapshot = h.hub.session_snapshot(&session_id).await.unwrap();
        assert_eq!(snapshot.upstream_apdus, 1);
        assert_eq!(snapshot.downstream_apdus, 1);
    }

    #[tokio::test]
    async fn test_apdu_without_session() {
        let h = Harness::new();
        let pos = h.receiver("pos", "acct1").await;
        h.send(&pos, json!({ "type": "apdu_upstream", "sessionId": "s1", "apdu": "00" }))
            .await;
        assert_eq!(error_code(&pos), Some(40001));
    }

    #[tokio::test]
    async fn test_apdu_with_stale_session_id() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;
        h.hub.inner.state.write().await.sessions.remove(&session_id);

        h.send(&pos, json!({ "type": "apdu_upstream", "sessionId": session_id, "apdu": "00" }))
            .await;

        assert_eq!(error_code(&pos), Some(ErrorCode::SessionConflict.as_u32() as u64));
        assert!(h.hub.client_snapshot("pos").await.unwrap().session_id.is_none());
        assert!(card.sent().is_empty());
    }

    #[tokio::test]
    async fn test_apdu_with_missing_peer() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;
        h.hub
            .inner
            .state
            .write()
            .await
            .sessions
            .get_mut(&session_id)
            .unwrap()
            .remove_participant("card");

        h.send(&pos, json!({ "type": "apdu_upstream", "sessionId": session_id, "apdu": "00" }))
            .await;
        h.hub.wait_background().await;

        assert_eq!(error_code(&pos), Some(ErrorCode::ProviderNotFound.as_u32() as u64));
        assert_eq!(h.hub.session_count().await, 1);
        assert_eq!(
            h.hub.client_snapshot("pos").await.unwrap().session_id.as_deref(),
            Some(session_id.as_str())
        );
        assert!(pos.sent_of_type("session_terminated").is_empty());
        assert!(card.sent().is_empty());
        assert!(h.audit.of_type("apdu_relay_failure").is_empty());
        assert!(h
            .audit
            .events()
            .iter()
            .all(|e| !e.event_type.starts_with("session_terminated")));
    }

    #[tokio::test]
    async fn test_apdu_forward_failure_terminates_session() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        card.set_fail_sends(true);
        h.send(&pos, json!({ "type": "apdu_upstream", "sessionId": session_id, "apdu": "00A4" }))
            .await;
        h.hub.wait_background().await;

        let error = pos.sent_of_type("error").pop().unwrap();
        assert_eq!(error["code"], ErrorCode::InternalError.as_u32());
        assert_eq!(error["sessionId"], session_id.as_str());

        let terminated = pos.sent_of_type("session_terminated");
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0]["sessionId"], session_id.as_str());
        assert_eq!(terminated[0]["reason"], "relay failure");

        assert_eq!(h.hub.session_count().await, 0);
        assert!(h.hub.client_snapshot("pos").await.unwrap().session_id.is_none());
        assert!(h.hub.client_snapshot("card").await.unwrap().session_id.is_none());
        assert_eq!(h.audit.of_type("apdu_relay_failure").len(), 1);
        assert_eq!(h.audit.of_type("session_terminated_by_apdu_error").len(), 1);
    }

    #[tokio::test]
    async fn test_end_session() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        h.send(&pos, json!({ "type": "end_session", "sessionId": "wrong" })).await;
        assert_eq!(error_code(&pos), Some(40301));
        assert_eq!(h.hub.session_count().await, 1);
        pos.clear();

        h.send(&pos, json!({ "type": "end_session", "sessionId": session_id })).await;
        h.hub.wait_background().await;

        let to_pos = pos.sent_of_type("session_terminated");
        assert_eq!(to_pos.len(), 2);
        assert_eq!(to_pos[0]["reason"], "client request");
        assert_eq!(to_pos[1]["reason"], "session ended by request");

        let to_card = card.sent_of_type("session_terminated");
        assert_eq!(to_card.len(), 1);
        assert_eq!(to_card[0]["sessionId"], session_id.as_str());

        assert_eq!(h.hub.session_count().await, 0);
        assert_eq!(h.audit.of_type("session_terminated_by_client_request").len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_already_terminated_sends_no_confirmation() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;
        // session leaves the table while the caller still points at it
        h.hub.inner.state.write().await.sessions.remove(&session_id);

        h.send(&pos, json!({ "type": "end_session", "sessionId": session_id })).await;
        h.hub.wait_background().await;

        assert!(pos.sent_of_type("session_terminated").is_empty());
        assert!(pos.sent_of_type("error").is_empty());
        assert!(card.sent_of_type("session_terminated").is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_mid_session() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let watcher = h.receiver("watcher", "acct1").await;
        h.listing(&watcher).await;
        h.pair(&pos, &card).await;
        h.hub.wait_background().await;
        watcher.clear();

        h.disconnect(&pos).await;
        h.hub.wait_background().await;

        let terminated = card.sent_of_type("session_terminated");
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0]["reason"], "client disconnect");
        assert!(pos.is_closed());

        let pushed = watcher.sent_of_type("card_providers_list");
        assert_eq!(pushed.last().unwrap()["providers"][0]["isBusy"], false);
        assert_eq!(h.listing(&watcher).await[0]["isBusy"], false);
        assert_eq!(h.audit.of_type("session_terminated_by_client_disconnect").len(), 1);
    }

    #[tokio::test]
    async fn test_provider_disconnect_removes_listing_and_notifies() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let watcher = h.receiver("watcher", "acct1").await;
        h.listing(&watcher).await;

        h.disconnect(&card).await;
        h.hub.wait_background().await;

        let pushed = watcher.sent_of_type("card_providers_list");
        assert_eq!(pushed.len(), 1);
        assert!(pushed[0]["providers"].as_array().unwrap().is_empty());
        assert_eq!(h.hub.provider_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_pruned() {
        let h = Harness::new();
        let watcher = h.receiver("watcher", "acct1").await;
        h.listing(&watcher).await;
        h.disconnect(&watcher).await;

        let state = h.hub.inner.state.read().await;
        assert!(state.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_status_update_forwarded() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        h.send(
            &card,
            json!({ "type": "status_update_to_server", "sessionId": session_id, "status": "CARD_REMOVED", "details": "lifted" }),
        )
        .await;

        let update = pos.last_json().unwrap();
        assert_eq!(update["type"], "peer_status_update");
        assert_eq!(update["sessionId"], session_id.as_str());
        assert_eq!(update["status"], "CARD_REMOVED");
        assert_eq!(update["details"], "lifted");

        h.send(
            &card,
            json!({ "type": "status_update_to_server", "sessionId": "other", "status": "X" }),
        )
        .await;
        assert_eq!(error_code(&card), Some(40301));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_terminates_idle_sessions() {
        let h = Harness::with_config(RelayConfig {
            session_timeout_secs: 30,
            ..RelayConfig::default()
        });
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(h.hub.sweep_inactive().await, 0);

        h.send(&pos, json!({ "type": "apdu_upstream", "sessionId": session_id, "apdu": "00" }))
            .await;
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(h.hub.sweep_inactive().await, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(h.hub.sweep_inactive().await, 1);
        h.hub.wait_background().await;

        assert_eq!(h.hub.session_count().await, 0);
        let terminated = pos.sent_of_type("session_terminated");
        assert_eq!(terminated[0]["reason"], "timeout");
        let audit = h.audit.of_type("session_terminated_by_timeout");
        assert_eq!(audit.len(), 1);
        assert!(audit[0].client_id_initiator.is_none());
    }

    #[tokio::test]
    async fn test_terminate_clears_both_sides_and_frees_provider() {
        let h = Harness::new();
        let card = h.provider("card", "acct1", "CardX").await;
        let pos = h.receiver("pos", "acct1").await;
        let session_id = h.pair(&pos, &card).await;

        let terminated = h
            .hub
            .terminate_session(
                &session_id,
                TerminationReason::Other("maintenance".to_string()),
                TerminationActor::System,
            )
            .await;
        h.hub.wait_background().await;

        assert!(terminated);
        assert!(h.hub.session_snapshot(&session_id).await.is_none());
        assert_eq!(card.sent_of_type("session_terminated")[0]["reason"], "maintenance");
        assert_eq!(h.audit.of_type("session_terminated_by_system").len(), 1);

        // provider can be selected again
        let again = h.pair(&pos, &card).await;
        assert_ne!(again, session_id);
    }
}
