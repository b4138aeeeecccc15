//! Relay Hub
//!
//! The single coordinator of the relay. It owns the connected clients, the
//! per-account provider directory, the subscriber registry and the session
//! table, all behind one `RwLock`. Connection pumps feed it through a bounded
//! event queue drained by [`HubDispatcher`]; notifications and terminations
//! caused by an event run as tracked background tasks.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::{RelayError, RelayResult, SendError};
use super::metrics::{
    ACTIVE_CONNECTIONS, ACTIVE_SESSIONS, HUB_ERRORS_TOTAL, SESSION_TERMINATIONS_TOTAL,
};
use super::peer::{ClientId, PeerRef};
use super::protocol::{
    peek_type, ApduDirection, ClientMessage, ProviderInfo, Role, ServerMessage, TYPE_CLIENT_AUTH,
};
use super::session::{Session, SessionId, SessionSnapshot, TerminationReason};
use crate::audit::{AuditEvent, AuditSink};
use crate::auth::TokenValidator;
use crate::config::RelayConfig;

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Work item for the dispatcher
pub enum HubEvent {
    /// A connection finished its upgrade
    Register(PeerRef),
    /// A connection's inbound pump exited
    Unregister(ClientId),
    /// A text frame received from a client
    Inbound { client_id: ClientId, payload: String },
}

/// Who caused a session to end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationActor {
    Client {
        client_id: ClientId,
        user_id: Option<String>,
    },
    System,
}

/// Per-connection state owned by the hub
pub(super) struct ClientRecord {
    pub(super) peer: PeerRef,
    pub(super) authenticated: bool,
    pub(super) account_id: Option<String>,
    pub(super) role: Role,
    pub(super) online: bool,
    pub(super) display_name: Option<String>,
    pub(super) session_id: Option<SessionId>,
    pub(super) connected_at: DateTime<Utc>,
}

impl ClientRecord {
    fn new(peer: PeerRef) -> Self {
        Self {
            peer,
            authenticated: false,
            account_id: None,
            role: Role::None,
            online: false,
            display_name: None,
            session_id: None,
            connected_at: Utc::now(),
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            client_id: self.peer.id().to_string(),
            remote_addr: self.peer.remote_addr().map(|a| a.to_string()),
            authenticated: self.authenticated,
            user_id: self.account_id.clone(),
            role: self.role,
            online: self.online,
            display_name: self.display_name.clone(),
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Point-in-time copy of a client's hub-side state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub client_id: String,
    pub remote_addr: Option<String>,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub role: Role,
    pub online: bool,
    pub display_name: Option<String>,
    pub session_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Everything guarded by the hub lock
#[derive(Default)]
pub(super) struct HubState {
    pub(super) clients: HashMap<ClientId, ClientRecord>,
    /// Online providers; scoped by each record's account
    pub(super) providers: HashSet<ClientId>,
    /// Account -> clients that listed its providers
    pub(super) subscribers: HashMap<String, HashSet<ClientId>>,
    pub(super) sessions: HashMap<SessionId, Session>,
}

impl HubState {
    /// Whether the client's session ID resolves to a live session
    pub(super) fn is_sessioned(&self, record: &ClientRecord) -> bool {
        record
            .session_id
            .as_ref()
            .is_some_and(|id| self.sessions.contains_key(id))
    }

    /// Directory view for one account, ordered by name then ID
    pub(super) fn provider_list(&self, account_id: &str) -> Vec<ProviderInfo> {
        let mut list: Vec<ProviderInfo> = self
            .providers
            .iter()
            .filter_map(|id| self.clients.get(id).map(|record| (id, record)))
            .filter(|(_, record)| record.account_id.as_deref() == Some(account_id))
            .map(|(id, record)| ProviderInfo {
                provider_id: id.clone(),
                provider_name: record
                    .display_name
                    .clone()
                    .unwrap_or_else(|| default_provider_name(id)),
                user_id: account_id.to_string(),
                is_busy: self.is_sessioned(record),
            })
            .collect();
        list.sort_by(|a, b| {
            a.provider_name
                .cmp(&b.provider_name)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        list
    }
}

/// Display name for providers that did not supply one
pub(super) fn default_provider_name(client_id: &str) -> String {
    let prefix: String = client_id.chars().take(8).collect();
    format!("Provider {}", prefix)
}

pub(super) struct HubInner {
    pub(super) state: RwLock<HubState>,
    pub(super) config: RelayConfig,
    pub(super) validator: Arc<dyn TokenValidator>,
    pub(super) audit: Arc<dyn AuditSink>,
    background: TaskTracker,
    events: mpsc::Sender<HubEvent>,
    shutdown: CancellationToken,
}

/// Handle to the relay hub; cheap to clone
#[derive(Clone)]
pub struct RelayHub {
    pub(super) inner: Arc<HubInner>,
}

/// Drains the hub's event queue and runs the inactivity sweep
pub struct HubDispatcher {
    hub: RelayHub,
    events: mpsc::Receiver<HubEvent>,
}

impl RelayHub {
    /// Create a hub and the dispatcher that must be spawned to drive it
    pub fn new(
        config: RelayConfig,
        validator: Arc<dyn TokenValidator>,
        audit: Arc<dyn AuditSink>,
    ) -> (Self, HubDispatcher) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let hub = Self {
            inner: Arc::new(HubInner {
                state: RwLock::new(HubState::default()),
                config,
                validator,
                audit,
                background: TaskTracker::new(),
                events: events_tx,
                shutdown: CancellationToken::new(),
            }),
        };
        let dispatcher = HubDispatcher {
            hub: hub.clone(),
            events: events_rx,
        };
        (hub, dispatcher)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Queue a newly connected client
    pub async fn register(&self, peer: PeerRef) {
        self.enqueue(HubEvent::Register(peer)).await;
    }

    /// Queue removal of a client
    pub async fn unregister(&self, client_id: ClientId) {
        self.enqueue(HubEvent::Unregister(client_id)).await;
    }

    /// Queue an inbound text frame
    pub async fn submit(&self, client_id: ClientId, payload: String) {
        self.enqueue(HubEvent::Inbound { client_id, payload }).await;
    }

    async fn enqueue(&self, event: HubEvent) {
        if self.inner.events.send(event).await.is_err() {
            tracing::warn!("Hub dispatcher is not running, dropping event");
        }
    }

    /// Stop the dispatcher and close every client's outbound queue
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let state = self.inner.state.read().await;
        for record in state.clients.values() {
            record.peer.close();
        }
    }

    /// Whether the dispatcher is still accepting events
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Process one event immediately
    pub async fn handle_event(&self, event: HubEvent) {
        match event {
            HubEvent::Register(peer) => self.connect(peer).await,
            HubEvent::Unregister(client_id) => self.disconnect(&client_id).await,
            HubEvent::Inbound { client_id, payload } => self.dispatch(&client_id, payload).await,
        }
    }

    async fn connect(&self, peer: PeerRef) {
        let client_id = peer.id().to_string();
        let remote_addr = peer.remote_addr();
        self.inner
            .state
            .write()
            .await
            .clients
            .insert(client_id.clone(), ClientRecord::new(peer));

        gauge!(ACTIVE_CONNECTIONS).increment(1.0);
        tracing::info!(client_id = %client_id, remote_addr = ?remote_addr, "Client connected");
    }

    async fn disconnect(&self, client_id: &str) {
        let (record, was_listed) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(record) = state.clients.remove(client_id) else {
                return;
            };
            let was_listed = state.providers.remove(client_id);
            state.subscribers.retain(|_, members| {
                members.remove(client_id);
                !members.is_empty()
            });
            (record, was_listed)
        };

        record.peer.close();
        gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
        tracing::info!(
            client_id = %client_id,
            user_id = record.account_id.as_deref().unwrap_or(""),
            "Client disconnected"
        );

        if let Some(session_id) = record.session_id {
            let hub = self.clone();
            let actor = TerminationActor::Client {
                client_id: client_id.to_string(),
                user_id: record.account_id.clone(),
            };
            self.inner.background.spawn(async move {
                hub.terminate_session(&session_id, TerminationReason::ClientDisconnect, actor)
                    .await;
            });
        }

        if was_listed {
            if let Some(account_id) = record.account_id {
                self.spawn_notify(account_id);
            }
        }
    }

    async fn dispatch(&self, client_id: &str, raw: String) {
        let caller = {
            let state = self.inner.state.read().await;
            state
                .clients
                .get(client_id)
                .map(|r| (r.peer.clone(), r.authenticated, r.account_id.clone()))
        };
        let Some((peer, authenticated, account_id)) = caller else {
            tracing::debug!(client_id = %client_id, "Message from unregistered client ignored");
            return;
        };

        let (kind, session_id, result) = self.route(&peer, authenticated, &raw).await;
        if let Err(err) = result {
            self.report_error(&peer, account_id.as_deref(), &kind, session_id, err);
        }
    }

    /// Decode and run one inbound envelope
    async fn route(
        &self,
        peer: &PeerRef,
        authenticated: bool,
        raw: &str,
    ) -> (String, Option<String>, RelayResult<()>) {
        let kind = match peek_type(raw) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!(client_id = %peer.id(), error = %e, "Unreadable envelope");
                return (
                    String::new(),
                    None,
                    Err(RelayError::BadRequest("Invalid message format".to_string())),
                );
            }
        };

        if kind != TYPE_CLIENT_AUTH && !authenticated {
            return (kind, None, Err(RelayError::AuthRequired));
        }

        let message = match ClientMessage::decode(&kind, raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(client_id = %peer.id(), kind = %kind, error = %e, "Invalid message body");
                let err = RelayError::BadRequest(format!("Invalid {} message format", kind));
                return (kind, None, Err(err));
            }
        };
        let session_id = message.session_id().map(str::to_string);

        let result = match message {
            ClientMessage::ClientAuth { token } => self.handle_client_auth(peer, token).await,
            ClientMessage::DeclareRole {
                role,
                online,
                provider_name,
            } => {
                self.handle_declare_role(peer, &role, online, &provider_name)
                    .await
            }
            ClientMessage::ListCardProviders => self.handle_list_card_providers(peer).await,
            ClientMessage::SelectCardProvider { provider_id } => {
                self.handle_select_card_provider(peer, &provider_id).await
            }
            ClientMessage::ApduUpstream { .. } => {
                self.handle_apdu(peer, ApduDirection::Upstream, raw).await
            }
            ClientMessage::ApduDownstream { .. } => {
                self.handle_apdu(peer, ApduDirection::Downstream, raw).await
            }
            ClientMessage::EndSession { session_id } => {
                self.handle_end_session(peer, &session_id).await
            }
            ClientMessage::StatusUpdate {
                session_id,
                status,
                details,
            } => {
                self.handle_status_update(peer, &session_id, status, details)
                    .await
            }
            ClientMessage::Unknown { kind } => Err(RelayError::UnsupportedType(kind)),
        };
        (kind, session_id, result)
    }

    fn report_error(
        &self,
        peer: &PeerRef,
        user_id: Option<&str>,
        kind: &str,
        session_id: Option<String>,
        err: RelayError,
    ) {
        let code = err.code();
        counter!(HUB_ERRORS_TOTAL, "code" => code.to_string()).increment(1);
        tracing::warn!(
            client_id = %peer.id(),
            code = code.as_u32(),
            kind = %kind,
            error = %err,
            "Request rejected"
        );

        let mut event = AuditEvent::new(audit_event_type(&err))
            .initiator(peer.id())
            .source(peer.remote_addr())
            .user(user_id)
            .details(serde_json::json!({
                "code": code.as_u32(),
                "message": err.to_string(),
                "messageType": kind,
            }));
        if let Some(id) = &session_id {
            event = event.session(id.clone());
        }
        self.inner.audit.record(event);

        if let Err(e) = deliver(peer, &err.to_message(session_id)) {
            tracing::debug!(client_id = %peer.id(), error = %e, "Failed to deliver error");
        }
    }

    /// Schedule a provider-list push to the account's subscribers
    pub(super) fn spawn_notify(&self, account_id: String) {
        let hub = self.clone();
        self.inner.background.spawn(async move {
            hub.notify_subscribers(&account_id).await;
        });
    }

    /// Push the current provider list to every subscriber of the account
    pub async fn notify_subscribers(&self, account_id: &str) {
        let (providers, targets) = {
            let state = self.inner.state.read().await;
            let Some(members) = state.subscribers.get(account_id) else {
                return;
            };
            let targets: Vec<PeerRef> = members
                .iter()
                .filter_map(|id| state.clients.get(id).map(|r| r.peer.clone()))
                .collect();
            (state.provider_list(account_id), targets)
        };
        if targets.is_empty() {
            return;
        }

        let message = ServerMessage::CardProvidersList { providers };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode provider list");
                return;
            }
        };
        for peer in targets {
            if let Err(e) = peer.send(json.clone()) {
                tracing::debug!(client_id = %peer.id(), error = %e, "Provider list push failed");
            }
        }
        tracing::debug!(user_id = %account_id, "Provider list pushed to subscribers");
    }

    /// End a session and tell both sides
    ///
    /// Returns `false` if no session with this ID exists.
    pub async fn terminate_session(
        &self,
        session_id: &str,
        reason: TerminationReason,
        actor: TerminationActor,
    ) -> bool {
        let (session, live_peers) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let Some(mut session) = state.sessions.remove(session_id) else {
                tracing::warn!(session_id = %session_id, "Terminate requested for unknown session");
                return false;
            };
            session.terminate(reason.clone());

            let participants: Vec<String> = [session.provider_id(), session.receiver_id()]
                .into_iter()
                .flatten()
                .map(str::to_string)
                .collect();
            let mut live_peers = Vec::new();
            for id in &participants {
                if let Some(record) = state.clients.get_mut(id) {
                    if record.session_id.as_deref() == Some(session_id) {
                        record.session_id = None;
                    }
                    live_peers.push(record.peer.clone());
                }
            }
            (session, live_peers)
        };

        let notice = ServerMessage::SessionTerminated {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        };
        for peer in &live_peers {
            if let Err(e) = deliver(peer, &notice) {
                tracing::debug!(
                    client_id = %peer.id(),
                    session_id = %session_id,
                    error = %e,
                    "Failed to deliver termination notice"
                );
            }
        }

        gauge!(ACTIVE_SESSIONS).decrement(1.0);
        counter!(SESSION_TERMINATIONS_TOTAL, "reason" => reason.label()).increment(1);

        let mut event = AuditEvent::new(termination_event_type(&reason, &actor))
            .session(session_id)
            .user(Some(session.account_id()))
            .details(serde_json::json!({
                "reason": reason.to_string(),
                "providerId": session.provider_id(),
                "receiverId": session.receiver_id(),
                "upstreamApdus": session.upstream_apdus(),
                "downstreamApdus": session.downstream_apdus(),
            }));
        if let TerminationActor::Client { client_id, .. } = &actor {
            event = event.initiator(client_id.clone());
        }
        self.inner.audit.record(event);

        tracing::info!(
            session_id = %session_id,
            reason = %reason,
            actor = ?actor,
            "Session terminated"
        );

        self.spawn_notify(session.account_id().to_string());
        true
    }

    /// Terminate paired sessions idle past the configured timeout
    ///
    /// Terminations run in the background; returns how many were scheduled.
    pub async fn sweep_inactive(&self) -> usize {
        let timeout = self.inner.config.session_timeout();
        let now = Instant::now();
        let expired: Vec<SessionId> = {
            let state = self.inner.state.read().await;
            state
                .sessions
                .values()
                .filter(|s| s.is_inactive(timeout, now))
                .map(|s| s.id().to_string())
                .collect()
        };

        for session_id in &expired {
            tracing::info!(session_id = %session_id, "Session idle past timeout");
            let hub = self.clone();
            let session_id = session_id.clone();
            self.inner.background.spawn(async move {
                hub.terminate_session(&session_id, TerminationReason::Timeout, TerminationActor::System)
                    .await;
            });
        }
        expired.len()
    }

    /// Wait until all background notifications and terminations finish
    pub async fn wait_background(&self) {
        let tracker = &self.inner.background;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.state.read().await.clients.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.read().await.sessions.len()
    }

    /// Online providers across all accounts
    pub async fn provider_count(&self) -> usize {
        self.inner.state.read().await.providers.len()
    }

    pub async fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.inner
            .state
            .read()
            .await
            .sessions
            .get(session_id)
            .map(Session::snapshot)
    }

    pub async fn client_snapshot(&self, client_id: &str) -> Option<ClientSnapshot> {
        self.inner
            .state
            .read()
            .await
            .clients
            .get(client_id)
            .map(ClientRecord::snapshot)
    }

    /// All live sessions, oldest first
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let state = self.inner.state.read().await;
        let mut sessions: Vec<SessionSnapshot> =
            state.sessions.values().map(Session::snapshot).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Provider directory as a receiver of the account would see it
    pub async fn providers_for(&self, account_id: &str) -> Vec<ProviderInfo> {
        self.inner.state.read().await.provider_list(account_id)
    }
}

impl HubDispatcher {
    /// Run until the hub shuts down
    pub async fn run(mut self) {
        let period = self.hub.inner.config.sweep_interval();
        let mut sweep = time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = self.hub.inner.shutdown.clone();

        tracing::info!(sweep_interval = ?period, "Relay hub started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.hub.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let expired = self.hub.sweep_inactive().await;
                    if expired > 0 {
                        tracing::info!(expired, "Inactivity sweep finished");
                    }
                }
            }
        }
        tracing::info!("Relay hub stopped");
    }
}

/// Encode and enqueue one envelope
pub(super) fn deliver(peer: &PeerRef, message: &ServerMessage) -> Result<(), SendError> {
    let json = message.to_json().map_err(|e| {
        tracing::error!(error = %e, "Failed to encode server message");
        SendError::Encode
    })?;
    peer.send(json)
}

fn audit_event_type(err: &RelayError) -> &'static str {
    match err {
        RelayError::BadRequest(_) => "bad_request",
        RelayError::AuthRequired => "auth_required",
        RelayError::AuthFailed(_) => "auth_failure",
        RelayError::PermissionDenied(_) => "permission_denied",
        RelayError::UnsupportedType(_) => "unsupported_message_type",
        RelayError::ProviderNotFound(_)
        | RelayError::ProviderBusy
        | RelayError::ReceiverBusy
        | RelayError::SelectSelf
        | RelayError::ProviderUnavailable(_)
        | RelayError::SessionConflict(_) => "pairing_rejected",
        RelayError::Internal(_) => "internal_error",
    }
}

fn termination_event_type(reason: &TerminationReason, actor: &TerminationActor) -> &'static str {
    match (reason, actor) {
        (TerminationReason::ClientRequest, TerminationActor::Client { .. }) => {
            "session_terminated_by_client_request"
        }
        (TerminationReason::ClientDisconnect, _) => "session_terminated_by_client_disconnect",
        (TerminationReason::Timeout, _) => "session_terminated_by_timeout",
        (TerminationReason::RelayFailure, _) => "session_terminated_by_apdu_error",
        _ => "session_terminated_by_system",
    }
}
