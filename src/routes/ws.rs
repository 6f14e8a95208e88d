//! WebSocket handler: one hub session per connection.
//!
//! DESIGN
//! ======
//! On upgrade, generates a session ID, registers an outbound channel with
//! the hub, and enters a `select!` loop:
//! - Incoming client frames → parse → submit to the hub sequencer
//! - Hub messages on the session channel → forward to client
//! - Ping ticker → liveness check + ping
//!
//! The handler never mutates map state itself; every command goes through
//! the hub so all sessions observe one order. A malformed frame is logged
//! and dropped and the session stays open.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `Connecting`
//! 2. Hub join queues the bootstrap `mapChange` → `Active`
//! 3. Close frame, transport error, missed pongs, eviction, or hub
//!    shutdown → `Closed` → hub leave

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{HubError, SessionId};
use crate::protocol::{self, ErrorCode, ServerMessage};
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("websocket transport failed: {0}")]
    Transport(#[source] axum::Error),
    #[error("no pong within {0:?}")]
    PongTimeout(Duration),
    #[error("socket write exceeded {0:?}")]
    WriteTimeout(Duration),
    #[error("session removed by the hub")]
    Evicted,
    #[error("sync hub closed")]
    HubClosed,
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        "E_SESSION_TRANSPORT"
    }
}

struct Session {
    id: SessionId,
    phase: SessionPhase,
}

impl Session {
    fn advance(&mut self, next: SessionPhase) {
        debug!(session_id = %self.id, from = ?self.phase, to = ?next, "ws: session phase");
        self.phase = next;
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let mut session = Session { id: Uuid::new_v4(), phase: SessionPhase::Connecting };
    let session_id = session.id;

    // Per-connection channel for messages fanned out by the hub.
    let (client_tx, mut client_rx) = mpsc::channel::<ServerMessage>(state.session.queue_depth);
    if let Err(e) = state.hub.join(session_id, client_tx).await {
        warn!(%session_id, error = %e, "ws: hub join failed");
        return;
    }
    session.advance(SessionPhase::Active);
    info!(%session_id, "ws: client connected");

    let result = session_loop(&mut socket, &state, session_id, &mut client_rx).await;
    session.advance(SessionPhase::Closed);

    match &result {
        Ok(()) => info!(%session_id, "ws: client disconnected"),
        Err(e @ (SessionError::Evicted | SessionError::HubClosed)) => {
            info!(%session_id, reason = %e, "ws: session closed by hub");
        }
        Err(e) => warn!(%session_id, error = %e, code = e.error_code(), "ws: session closed"),
    }

    if !matches!(result, Ok(()) | Err(SessionError::Transport(_))) {
        let _ = timeout(state.session.write_timeout, socket.send(Message::Close(None))).await;
    }

    // Already gone if the hub evicted us or shut down.
    let _ = state.hub.leave(session_id).await;
}

async fn session_loop(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: SessionId,
    client_rx: &mut mpsc::Receiver<ServerMessage>,
) -> Result<(), SessionError> {
    let settings = state.session;
    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { return Ok(()) };
                let msg = msg.map_err(SessionError::Transport)?;
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => process_inbound_text(state, session_id, text.as_str()).await?,
                    Message::Close(_) => return Ok(()),
                    // Pings are answered by the transport; binary frames are not part of the protocol.
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            outbound = client_rx.recv() => {
                let Some(msg) = outbound else { return Err(SessionError::Evicted) };
                send_message(socket, &msg, settings.write_timeout).await?;
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > settings.pong_timeout {
                    return Err(SessionError::PongTimeout(settings.pong_timeout));
                }
                send_raw(socket, Message::Ping(Bytes::new()), settings.write_timeout).await?;
            }
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Parse one inbound text frame and hand it to the hub. Malformed frames are
/// dropped without a reply.
async fn process_inbound_text(state: &AppState, session_id: SessionId, text: &str) -> Result<(), SessionError> {
    match protocol::parse_command(text) {
        Ok(command) => {
            debug!(%session_id, kind = command.kind(), "ws: recv command");
            match state.hub.submit(session_id, command).await {
                Ok(()) => Ok(()),
                Err(HubError::Closed) => Err(SessionError::HubClosed),
                Err(e @ HubError::Rejected(_)) => {
                    warn!(%session_id, error = %e, code = e.error_code(), "ws: command rejected by hub");
                    Ok(())
                }
            }
        }
        Err(e) => {
            warn!(%session_id, error = %e, code = e.error_code(), "ws: malformed command dropped");
            Ok(())
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_message(socket: &mut WebSocket, msg: &ServerMessage, limit: Duration) -> Result<(), SessionError> {
    let json = match msg.to_json() {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize message");
            return Ok(());
        }
    };
    send_raw(socket, Message::Text(json.into()), limit).await
}

async fn send_raw(socket: &mut WebSocket, msg: Message, limit: Duration) -> Result<(), SessionError> {
    match timeout(limit, socket.send(msg)).await {
        Ok(result) => result.map_err(SessionError::Transport),
        Err(_) => Err(SessionError::WriteTimeout(limit)),
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
