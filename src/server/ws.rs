//! WebSocket relay endpoints.
//!
//! `/ws` serves browser clients, `/ws/agent` serves agents. Each accepted
//! socket gets its own handler task; outbound frames go through a
//! per-connection unbounded channel drained by a dedicated sender task, so a
//! slow peer can never stall a broadcast to the others.
//!
//! The identity gate runs on the upgrade headers. A rejected connection is
//! upgraded only to be closed with a policy-violation code; it never touches
//! the registry.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthError, Identity};
use crate::registry::{Connection, Role};
use crate::relay::Relay;
use crate::server::RelayState;

/// WebSocket close code for policy violations (RFC 6455).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

enum Inbound {
    Text(String),
    /// Binary frame on a text-only channel.
    NotText,
    Control,
    Close,
}

fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(text) => Inbound::Text(text),
        Message::Binary(_) => Inbound::NotText,
        Message::Ping(_) | Message::Pong(_) => Inbound::Control,
        Message::Close(_) => Inbound::Close,
    }
}

async fn close_with_policy_violation(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

fn reject_reason(err: AuthError) -> &'static str {
    match err {
        AuthError::MissingToken => "missing access token",
        AuthError::MalformedToken => "malformed access token",
        AuthError::InvalidToken => "invalid or expired token",
        AuthError::InsufficientRole => "insufficient privileges",
    }
}

/// Split the socket and spawn the sender task draining the outbound channel.
fn start_sender(
    socket: WebSocket,
) -> (
    futures_util::stream::SplitStream<WebSocket>,
    mpsc::UnboundedSender<String>,
    tokio::task::JoinHandle<()>,
) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
    (stream, tx, send_task)
}

pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let gate = auth::authenticate_client(
        &headers,
        state.identity.as_ref(),
        state.allow_anonymous_clients,
    );
    ws.on_upgrade(move |socket| async move {
        match gate {
            Ok(identity) => handle_client_socket(socket, state, identity).await,
            Err(err) => {
                warn!(error = %err, "client connection rejected");
                close_with_policy_violation(socket, reject_reason(err)).await;
            }
        }
    })
}

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let gate = auth::authenticate_agent(&headers, state.identity.as_ref());
    ws.on_upgrade(move |socket| async move {
        match gate {
            Ok(identity) => handle_agent_socket(socket, state, identity).await,
            Err(err) => {
                warn!(error = %err, "agent connection rejected");
                close_with_policy_violation(socket, reject_reason(err)).await;
            }
        }
    })
}

async fn handle_client_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    identity: Option<Identity>,
) {
    let (mut stream, tx, send_task) = start_sender(socket);

    let conn = Connection::new(Role::Client, identity, tx.clone());
    let conn_id = conn.id.clone();
    state.relay.registry().admit(conn);
    info!(conn_id = %conn_id, "client connected");

    // Tell the new client whether an agent is currently available.
    let connected = state.relay.registry().count(Role::Agent) > 0;
    state.relay.registry().send_to(
        Role::Client,
        &conn_id,
        &crate::protocol::Envelope::AgentStatus { connected },
    );

    read_loop(&mut stream, &state.relay, &conn_id, Role::Client).await;

    state.relay.registry().remove(Role::Client, &conn_id);
    info!(conn_id = %conn_id, "client disconnected");
    drop(tx);
    let _ = send_task.await;
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<RelayState>, identity: Identity) {
    let (mut stream, tx, send_task) = start_sender(socket);

    let subject = identity.subject.clone();
    let conn = Connection::new(Role::Agent, Some(identity), tx.clone());
    let conn_id = conn.id.clone();
    state.relay.registry().admit(conn);
    info!(conn_id = %conn_id, subject = %subject, "agent connected");
    state.relay.broadcast_agent_status(true);

    read_loop(&mut stream, &state.relay, &conn_id, Role::Agent).await;

    // Idempotent remove guards against double notification: only the call
    // that actually evicts the entry broadcasts the disconnect.
    if state.relay.registry().remove(Role::Agent, &conn_id) {
        info!(conn_id = %conn_id, subject = %subject, "agent disconnected");
        state.relay.broadcast_agent_status(false);
    }
    drop(tx);
    let _ = send_task.await;
}

/// Pump inbound frames into the relay until the connection ends. A bad frame
/// is answered locally and the loop continues; only transport errors and
/// close frames end it.
async fn read_loop(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    relay: &Relay,
    conn_id: &str,
    origin: Role,
) {
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                debug!(conn_id = %conn_id, error = %err, "websocket read error");
                break;
            }
        };
        match classify(msg) {
            Inbound::Text(text) => {
                match origin {
                    Role::Client => relay.route_from_client(conn_id, &text),
                    Role::Agent => relay.route_from_agent(conn_id, &text),
                };
            }
            Inbound::NotText => {
                // Text-only channel; report and keep reading.
                relay.registry().send_to(
                    origin,
                    conn_id,
                    &crate::protocol::Envelope::error("Invalid JSON message"),
                );
            }
            Inbound::Control => continue,
            Inbound::Close => break,
        }
    }
}
