//! WebSocket Handler
//!
//! Upgrades `/ws` requests and runs the two pumps of a relay connection.
//!
//! - The inbound pump reads frames under a pong-reset deadline and hands text
//!   to the hub. It is the only place a client is unregistered.
//! - The outbound pump drains the client's queue in batches and pings on a
//!   timer. It exits when the hub closes the queue or a write fails.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::client::RelayClient;
use super::hub::RelayHub;
use super::peer::{PeerRef, RelayPeer};
use crate::api::AppState;
use crate::config::RelayConfig;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = state.hub.clone();
    let config = state.config.relay.clone();
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    ws.max_message_size(config.max_message_bytes())
        .on_upgrade(move |socket| handle_socket(socket, hub, config, remote_addr))
}

/// Run one relay connection until either pump stops
async fn handle_socket(
    socket: WebSocket,
    hub: RelayHub,
    config: RelayConfig,
    remote_addr: Option<SocketAddr>,
) {
    let (sink, stream) = socket.split();
    let (client, queue) = RelayClient::new(remote_addr, config.outbound_queue_capacity());
    let client_id = client.id().to_string();
    let peer: PeerRef = client.clone();

    hub.register(peer).await;

    let writer_done = CancellationToken::new();
    let outbound = tokio::spawn(write_pump(
        sink,
        queue,
        config.clone(),
        client_id.clone(),
        writer_done.clone(),
    ));

    read_pump(stream, &hub, &config, &client_id, &writer_done).await;

    hub.unregister(client_id.clone()).await;
    client.close();
    if let Err(e) = outbound.await {
        tracing::debug!(client_id = %client_id, error = %e, "Outbound pump ended abnormally");
    }
    tracing::debug!(client_id = %client_id, "Connection closed");
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: &RelayHub,
    config: &RelayConfig,
    client_id: &str,
    writer_done: &CancellationToken,
) {
    let pong_wait = config.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = writer_done.cancelled() => {
                tracing::debug!(client_id = %client_id, "Outbound pump stopped, closing reader");
                break;
            }
            frame = time::timeout_at(deadline, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                tracing::info!(client_id = %client_id, "Read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let text = text.replace('\n', " ");
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                hub.submit(client_id.to_string(), text.to_string()).await;
            }
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
            }
            Message::Ping(_) => {
                // axum answers pings itself
            }
            Message::Binary(data) => {
                tracing::debug!(client_id = %client_id, len = data.len(), "Dropping binary frame");
            }
            Message::Close(_) => {
                tracing::debug!(client_id = %client_id, "Client sent close frame");
                break;
            }
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<String>,
    config: RelayConfig,
    client_id: String,
    done: CancellationToken,
) {
    let write_wait = config.write_wait();
    let ping_period = config.ping_period();
    let mut ping = time::interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    let _ = time::timeout(write_wait, sink.send(Message::Close(None))).await;
                    break;
                };
                let batch = async {
                    sink.feed(Message::Text(first)).await?;
                    while let Ok(more) = queue.try_recv() {
                        sink.feed(Message::Text(more)).await?;
                    }
                    sink.flush().await
                };
                match time::timeout(write_wait, batch).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(client_id = %client_id, error = %e, "WebSocket write failed");
                        break;
                    }
                    Err(_) => {
                        tracing::info!(client_id = %client_id, "WebSocket write timed out");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                match time::timeout(write_wait, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::debug!(client_id = %client_id, "Ping failed");
                        break;
                    }
                }
            }
        }
    }

    done.cancel();
}
