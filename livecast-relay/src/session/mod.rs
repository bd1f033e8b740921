//! Session management: one independent state machine per destination
//! server, each with its own serialized control path.
//!
//! The registry hands out [`SessionHandle`]s keyed by server id;
//! everything stateful happens inside the session's actor task.

mod actor;
mod state;

pub use state::SessionState;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use livecast_core::config::SessionConfig;
use livecast_core::models::{Destination, EncodeProfile, PlaybackRequest};
use livecast_core::{Error, Result};

use crate::pipeline::PipelineRunner;
use crate::status::{StatusReporter, StatusSink};
use crate::transport::{Transport, TransportEvent};

use actor::{SessionActor, SessionMessage};

/// Command/event channel depth per session. Commands block briefly when
/// the loop is saturated instead of growing without bound.
const SESSION_MAILBOX: usize = 64;

/// Reply to an enqueue that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The session was idle; the request was promoted immediately and
    /// the connect sequence is under way.
    Started,
    /// Appended behind the current playback (1-based position).
    Queued { position: usize },
}

/// Observable session state, mainly for status surfaces and tests.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub current_title: Option<String>,
    pub current_channel: Option<String>,
    pub queued_titles: Vec<String>,
    pub volume_percent: u32,
    pub has_pipeline: bool,
}

/// Cheap, cloneable handle to one destination server's session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMessage>,
}

impl SessionHandle {
    /// Submit a playback request. Idle sessions start immediately; busy
    /// sessions append to the queue or reject with [`Error::Busy`] when
    /// the request targets a different channel.
    pub async fn enqueue(&self, request: PlaybackRequest) -> Result<EnqueueOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::Enqueue { request, reply }).await?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Explicit stop/disconnect: discards the queue, interrupts an
    /// in-flight connect, short-circuits any grace delay. Returns true
    /// when there was something to stop.
    pub async fn stop(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::Stop { reply }).await?;
        rx.await.map_err(|_| session_gone())
    }

    /// Update the volume percent (clamped). Audible immediately while
    /// playing; stored for the next playback otherwise.
    pub async fn set_volume(&self, percent: u32) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::SetVolume { percent, reply }).await?;
        rx.await.map_err(|_| session_gone())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| session_gone())
    }

    async fn send(&self, msg: SessionMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| session_gone())
    }
}

fn session_gone() -> Error {
    Error::Internal("session terminated".to_string())
}

/// Registry of independent sessions, one per destination server.
pub struct SessionManager<T: Transport, P: PipelineRunner, S: StatusSink> {
    transport: Arc<T>,
    runner: Arc<P>,
    sink: Arc<S>,
    session_config: SessionConfig,
    profile: EncodeProfile,
    sessions: DashMap<String, SessionHandle>,
}

impl<T: Transport, P: PipelineRunner, S: StatusSink> SessionManager<T, P, S> {
    pub fn new(
        transport: Arc<T>,
        runner: Arc<P>,
        sink: Arc<S>,
        session_config: SessionConfig,
        profile: EncodeProfile,
    ) -> Self {
        Self {
            transport,
            runner,
            sink,
            session_config,
            profile,
            sessions: DashMap::new(),
        }
    }

    /// Handle for `server_id`, spawning the session actor on first use.
    /// The actor stays alive afterwards so per-destination volume
    /// survives between playbacks.
    pub fn session(&self, server_id: &str) -> SessionHandle {
        if let Some(existing) = self.sessions.get(server_id) {
            return existing.clone();
        }

        let entry = self
            .sessions
            .entry(server_id.to_string())
            .or_insert_with(|| self.spawn_session(server_id));
        entry.clone()
    }

    /// Convenience: enqueue straight to the destination's session.
    pub async fn enqueue(
        &self,
        destination: &Destination,
        request: PlaybackRequest,
    ) -> Result<EnqueueOutcome> {
        debug_assert_eq!(destination.channel_id, request.channel_id);
        self.session(&destination.server_id).enqueue(request).await
    }

    /// Stop every live session (process shutdown).
    pub async fn stop_all(&self) {
        for entry in &self.sessions {
            let _ = entry.value().stop().await;
        }
    }

    fn spawn_session(&self, server_id: &str) -> SessionHandle {
        debug!(server_id, "Spawning session actor");
        let (tx, rx) = mpsc::channel(SESSION_MAILBOX);

        let actor = SessionActor::new(
            server_id.to_string(),
            self.session_config.clone(),
            self.profile.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.runner),
            StatusReporter::new(Arc::clone(&self.sink)),
            rx,
            tx.clone(),
        );
        tokio::spawn(actor.run());

        // Forward external-disconnect notifications into the loop.
        let mut events = self.transport.events();
        let event_tx = tx.clone();
        let server = server_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Disconnected { server_id }) if server_id == server => {
                        if event_tx.send(SessionMessage::ExternalDisconnect).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(server_id = %server, skipped, "Transport event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        SessionHandle { tx }
    }
}
