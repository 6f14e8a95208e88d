//! Sync hub: authoritative map view plus fan-out to connected sessions.
//!
//! DESIGN
//! ======
//! One sequencer task owns the `MapViewState` and the session registry and
//! drains a bounded request queue. `SyncHub` is a cloneable handle onto that
//! queue; sessions, HTTP handlers, and tests all talk to the hub through it.
//! A command is applied and fanned out before the next request is read, so
//! every session observes mutations in one global order.
//!
//! Delivery is `try_send` on each session's bounded outbound queue. The
//! sequencer never awaits a session: a full queue or a dropped receiver
//! evicts that session, and the remaining sessions get a fresh
//! `clientCountUpdate`.
//!
//! LIFECYCLE
//! =========
//! 1. `join` registers the session, queues its bootstrap `mapChange`, then
//!    broadcasts `clientCountUpdate` to everyone
//! 2. `submit` applies a command and broadcasts per its `Outcome`
//! 3. `leave` (or eviction) removes the session and rebroadcasts the count
//! 4. `shutdown` drops every session sender; outbound receivers close

pub mod view;

use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{Command, ErrorCode, MalformedCommand, ServerMessage};
use view::{MapViewState, Outcome, ViewLimits};

pub type SessionId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("sync hub is closed")]
    Closed,
    #[error("command rejected: {0}")]
    Rejected(#[from] MalformedCommand),
}

impl ErrorCode for HubError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_HUB_CLOSED",
            Self::Rejected(e) => e.error_code(),
        }
    }
}

/// Registry entry for one connected viewer.
struct ClientSession {
    tx: mpsc::Sender<ServerMessage>,
    joined_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// Point-in-time view of the hub, taken on the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubSnapshot {
    pub state: MapViewState,
    /// Live sessions, oldest first.
    pub sessions: Vec<SessionInfo>,
}

impl HubSnapshot {
    #[must_use]
    pub fn clients(&self) -> usize {
        self.sessions.len()
    }
}

enum HubRequest {
    Join {
        session_id: SessionId,
        tx: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<()>,
    },
    Leave {
        session_id: SessionId,
    },
    Command {
        origin: Option<SessionId>,
        command: Command,
        reply: Option<oneshot::Sender<MapViewState>>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    Shutdown,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle onto the hub sequencer.
#[derive(Clone)]
pub struct SyncHub {
    tx: mpsc::Sender<HubRequest>,
}

impl SyncHub {
    /// Spawn the sequencer task. The task exits after `shutdown` or once
    /// every handle has been dropped.
    #[must_use]
    pub fn spawn(initial: MapViewState, limits: ViewLimits, queue_depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let sequencer = Sequencer { state: initial, limits, sessions: HashMap::new() };
        let handle = tokio::spawn(sequencer.run(rx));
        (Self { tx }, handle)
    }

    /// Register a session. Returns once its bootstrap message is queued on
    /// `tx`, at which point the session is active.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the sequencer has stopped.
    pub async fn join(&self, session_id: SessionId, tx: mpsc::Sender<ServerMessage>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.request(HubRequest::Join { session_id, tx, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a session. Unknown or already-evicted sessions are ignored.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the sequencer has stopped.
    pub async fn leave(&self, session_id: SessionId) -> Result<(), HubError> {
        self.request(HubRequest::Leave { session_id }).await
    }

    /// Queue a command from a session. "Other sessions" excludes `origin`.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Rejected` for non-finite coordinates and
    /// `HubError::Closed` if the sequencer has stopped.
    pub async fn submit(&self, origin: SessionId, command: Command) -> Result<(), HubError> {
        command.check_finite()?;
        self.request(HubRequest::Command { origin: Some(origin), command, reply: None }).await
    }

    /// Apply a command that has no originating session and return the
    /// resulting state. Every session receives the broadcast.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Rejected` for non-finite coordinates and
    /// `HubError::Closed` if the sequencer has stopped.
    pub async fn submit_external(&self, command: Command) -> Result<MapViewState, HubError> {
        command.check_finite()?;
        let (reply, rx) = oneshot::channel();
        self.request(HubRequest::Command { origin: None, command, reply: Some(reply) }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// # Errors
    ///
    /// Returns `HubError::Closed` if the sequencer has stopped.
    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        let (reply, rx) = oneshot::channel();
        self.request(HubRequest::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the sequencer. Requests already queued behind this one are
    /// dropped and their callers see `HubError::Closed`.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the sequencer has already stopped.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.request(HubRequest::Shutdown).await
    }

    async fn request(&self, req: HubRequest) -> Result<(), HubError> {
        self.tx.send(req).await.map_err(|_| HubError::Closed)
    }
}

// =============================================================================
// SEQUENCER
// =============================================================================

struct Sequencer {
    state: MapViewState,
    limits: ViewLimits,
    sessions: HashMap<SessionId, ClientSession>,
}

impl Sequencer {
    async fn run(mut self, mut rx: mpsc::Receiver<HubRequest>) {
        info!(map = %self.state.map_name, "hub: sequencer started");

        while let Some(req) = rx.recv().await {
            match req {
                HubRequest::Join { session_id, tx, reply } => {
                    self.join(session_id, tx);
                    let _ = reply.send(());
                }
                HubRequest::Leave { session_id } => {
                    if self.sessions.remove(&session_id).is_some() {
                        info!(%session_id, clients = self.sessions.len(), "hub: session left");
                        self.broadcast_client_count();
                    }
                }
                HubRequest::Command { origin, command, reply } => {
                    let kind = command.kind();
                    let outcome = self.state.apply(command, &self.limits);
                    debug!(kind, origin = ?origin, version = ?outcome.message().version(), "hub: command applied");
                    match outcome {
                        Outcome::Broadcast(msg) => self.broadcast(&msg, None),
                        Outcome::BroadcastExcludeSender(msg) => self.broadcast(&msg, origin),
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(self.state.clone());
                    }
                }
                HubRequest::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                HubRequest::Shutdown => break,
            }
        }

        info!(clients = self.sessions.len(), version = self.state.version, "hub: sequencer stopped");
    }

    fn join(&mut self, session_id: SessionId, tx: mpsc::Sender<ServerMessage>) {
        // A fresh queue always has room for the bootstrap; failure means the
        // receiver is already gone.
        if let Err(e) = tx.try_send(ServerMessage::map_change(&self.state)) {
            warn!(%session_id, error = %e, "hub: bootstrap undeliverable; session not registered");
            return;
        }

        let session = ClientSession { tx, joined_at: OffsetDateTime::now_utc() };
        if self.sessions.insert(session_id, session).is_some() {
            warn!(%session_id, "hub: session id rejoined; replacing previous sender");
        }
        info!(%session_id, clients = self.sessions.len(), version = self.state.version, "hub: session joined");
        self.broadcast_client_count();
    }

    fn snapshot(&self) -> HubSnapshot {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo { id: *id, joined_at: s.joined_at })
            .collect();
        sessions.sort_by_key(|s| (s.joined_at, s.id));
        HubSnapshot { state: self.state.clone(), sessions }
    }

    fn broadcast_client_count(&mut self) {
        let msg = ServerMessage::ClientCountUpdate { count: self.sessions.len() };
        self.broadcast(&msg, None);
    }

    /// Fan `msg` out to every session except `exclude`. Evictions trigger a
    /// count update, which may itself evict further sessions.
    fn broadcast(&mut self, msg: &ServerMessage, exclude: Option<SessionId>) {
        let mut evicted = self.fan_out(msg, exclude);
        while !evicted.is_empty() {
            for (session_id, reason) in evicted {
                self.sessions.remove(&session_id);
                info!(%session_id, reason, clients = self.sessions.len(), "hub: session evicted");
            }
            let count = ServerMessage::ClientCountUpdate { count: self.sessions.len() };
            evicted = self.fan_out(&count, None);
        }
    }

    fn fan_out(&self, msg: &ServerMessage, exclude: Option<SessionId>) -> Vec<(SessionId, &'static str)> {
        let mut evicted = Vec::new();
        for (session_id, session) in &self.sessions {
            if exclude == Some(*session_id) {
                continue;
            }
            match session.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => evicted.push((*session_id, "outbound queue full")),
                Err(TrySendError::Closed(_)) => evicted.push((*session_id, "receiver dropped")),
            }
        }
        evicted
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
