//! The per-destination session event loop.
//!
//! Single logical owner of all session state: commands from handles and
//! internal lifecycle events are serialized through one mpsc channel, so
//! `current`/`queue`/`state` never observe a torn intermediate value.
//! Each playback attempt carries a generation number; events from a
//! superseded attempt are dropped on arrival.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livecast_core::config::SessionConfig;
use livecast_core::models::{Destination, EncodeProfile, PlaybackRequest, SourceKind};
use livecast_core::volume::VolumeControl;
use livecast_core::{Error, Result};

use crate::connection::ConnectionManager;
use crate::pipeline::{PipelineHandle, PipelineJob, PipelineOutcome, PipelineRunner, PipelineStopper};
use crate::session::state::SessionState;
use crate::session::{EnqueueOutcome, SessionSnapshot};
use crate::status::{StatusReporter, StatusSink};
use crate::transport::Transport;

pub(crate) enum SessionMessage {
    Enqueue {
        request: PlaybackRequest,
        reply: oneshot::Sender<Result<EnqueueOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    SetVolume {
        percent: u32,
        reply: oneshot::Sender<u32>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
    ConnectFinished {
        generation: u64,
        outcome: ConnectOutcome,
    },
    PipelineFinished {
        generation: u64,
        outcome: PipelineOutcome,
    },
    GraceElapsed {
        generation: u64,
    },
    TeardownFinished {
        generation: u64,
    },
    ExternalDisconnect,
}

pub(crate) enum ConnectOutcome {
    Ready(PipelineHandle),
    Failed(Error),
    Cancelled,
}

/// Metadata snapshot of the promoted request (the locator moved into the
/// pipeline when playback began).
struct CurrentTrack {
    title: String,
    kind: SourceKind,
    channel_id: String,
    enqueued_at: DateTime<Utc>,
}

pub(crate) struct SessionActor<T: Transport, P: PipelineRunner, S: StatusSink> {
    server_id: String,
    session_config: SessionConfig,
    profile: EncodeProfile,
    connection: Arc<Mutex<ConnectionManager<T>>>,
    runner: Arc<P>,
    reporter: StatusReporter<S>,
    volume: Arc<VolumeControl>,
    rx: mpsc::Receiver<SessionMessage>,
    self_tx: mpsc::Sender<SessionMessage>,

    state: SessionState,
    current: Option<CurrentTrack>,
    queue: VecDeque<PlaybackRequest>,
    generation: u64,
    connect_cancel: Option<CancellationToken>,
    pipeline: Option<PipelineStopper>,
    grace_cancel: Option<CancellationToken>,
    teardown_running: bool,
}

impl<T: Transport, P: PipelineRunner, S: StatusSink> SessionActor<T, P, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server_id: String,
        session_config: SessionConfig,
        profile: EncodeProfile,
        transport: Arc<T>,
        runner: Arc<P>,
        reporter: StatusReporter<S>,
        rx: mpsc::Receiver<SessionMessage>,
        self_tx: mpsc::Sender<SessionMessage>,
    ) -> Self {
        let connection = Arc::new(Mutex::new(ConnectionManager::new(
            transport,
            server_id.clone(),
            session_config.connect_timeout(),
        )));
        Self {
            server_id,
            session_config,
            profile,
            connection,
            runner,
            reporter,
            volume: Arc::new(VolumeControl::default()),
            rx,
            self_tx,
            state: SessionState::Idle,
            current: None,
            queue: VecDeque::new(),
            generation: 0,
            connect_cancel: None,
            pipeline: None,
            grace_cancel: None,
            teardown_running: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(server_id = %self.server_id, "Session started");
        self.reporter.idle().await;

        while let Some(msg) = self.rx.recv().await {
            let shutdown = matches!(msg, SessionMessage::Shutdown);
            self.handle(msg).await;
            self.check_invariants();
            if shutdown {
                break;
            }
        }

        // Release everything still held; the channel is gone, so events
        // from these tasks land nowhere and that is fine.
        if let Some(token) = self.connect_cancel.take() {
            token.cancel();
        }
        if let Some(token) = self.grace_cancel.take() {
            token.cancel();
        }
        if let Some(stopper) = self.pipeline.take() {
            stopper.stop();
        }
        self.connection.lock().await.teardown().await;
        info!(server_id = %self.server_id, "Session terminated");
    }

    async fn handle(&mut self, msg: SessionMessage) {
        match msg {
            SessionMessage::Enqueue { request, reply } => {
                let result = self.handle_enqueue(request);
                let _ = reply.send(result);
            }
            SessionMessage::Stop { reply } => {
                let stopped = self.handle_stop();
                let _ = reply.send(stopped);
            }
            SessionMessage::SetVolume { percent, reply } => {
                let stored = self.volume.set_percent(percent);
                debug!(server_id = %self.server_id, volume = stored, "Volume updated");
                let _ = reply.send(stored);
            }
            SessionMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionMessage::Shutdown => {}
            SessionMessage::ConnectFinished { generation, outcome } => {
                self.handle_connect_finished(generation, outcome).await;
            }
            SessionMessage::PipelineFinished { generation, outcome } => {
                self.handle_pipeline_finished(generation, outcome);
            }
            SessionMessage::GraceElapsed { generation } => {
                self.handle_grace_elapsed(generation);
            }
            SessionMessage::TeardownFinished { generation } => {
                self.handle_teardown_finished(generation).await;
            }
            SessionMessage::ExternalDisconnect => {
                self.handle_external_disconnect().await;
            }
        }
    }

    fn handle_enqueue(&mut self, request: PlaybackRequest) -> Result<EnqueueOutcome> {
        if self.state.is_idle() {
            info!(
                server_id = %self.server_id,
                title = %request.display_title,
                "Starting playback"
            );
            self.begin_playback(request, false);
            return Ok(EnqueueOutcome::Started);
        }

        if let Some(current) = &self.current {
            if current.channel_id != request.channel_id {
                return Err(Error::Busy(current.channel_id.clone()));
            }
        }

        self.queue.push_back(request);
        let position = self.queue.len();
        debug!(server_id = %self.server_id, position, "Request queued");
        Ok(EnqueueOutcome::Queued { position })
    }

    fn handle_stop(&mut self) -> bool {
        match self.state {
            SessionState::Idle => false,
            SessionState::Connecting => {
                info!(server_id = %self.server_id, "Stop requested, abandoning connect");
                self.queue.clear();
                self.state = SessionState::Draining;
                if let Some(token) = self.connect_cancel.take() {
                    token.cancel();
                }
                // Cleanup continues when the connect task reports back.
                true
            }
            SessionState::Playing => {
                info!(server_id = %self.server_id, "Stop requested");
                self.queue.clear();
                self.enter_drain(true);
                true
            }
            SessionState::Draining => {
                self.queue.clear();
                if let Some(token) = self.grace_cancel.take() {
                    token.cancel();
                    self.spawn_teardown(self.generation);
                }
                true
            }
        }
    }

    /// Promote `request` to current and kick off the connect + pipeline
    /// start sequence as a cancellable task.
    fn begin_playback(&mut self, request: PlaybackRequest, after_switch: bool) {
        self.generation += 1;
        let generation = self.generation;
        self.teardown_running = false;
        self.state = SessionState::Connecting;

        let PlaybackRequest {
            kind,
            locator,
            display_title,
            channel_id,
            enqueued_at,
        } = request;
        self.current = Some(CurrentTrack {
            title: display_title,
            kind,
            channel_id: channel_id.clone(),
            enqueued_at,
        });

        let destination = Destination::new(self.server_id.clone(), channel_id);
        let token = CancellationToken::new();
        self.connect_cancel = Some(token.clone());

        let connection = Arc::clone(&self.connection);
        let runner = Arc::clone(&self.runner);
        let volume = Arc::clone(&self.volume);
        let profile = self.profile.clone();
        let switch_delay = after_switch.then(|| self.session_config.switch_delay());
        let events = self.self_tx.clone();

        tokio::spawn(async move {
            let work = async {
                if let Some(delay) = switch_delay {
                    tokio::time::sleep(delay).await;
                }
                let mut conn = connection.lock().await;
                conn.connect(&destination).await?;
                let sinks = conn.open_pipes(&destination, &profile).await?;
                drop(conn);
                runner
                    .start(PipelineJob {
                        locator,
                        kind,
                        profile,
                        sinks,
                        volume,
                    })
                    .await
            };
            tokio::pin!(work);

            let outcome = tokio::select! {
                result = &mut work => match result {
                    Ok(handle) => ConnectOutcome::Ready(handle),
                    Err(e) => ConnectOutcome::Failed(e),
                },
                () = token.cancelled() => {
                    // Abandon the join in progress and clean up whatever
                    // got established.
                    connection.lock().await.teardown().await;
                    ConnectOutcome::Cancelled
                }
            };
            let _ = events
                .send(SessionMessage::ConnectFinished { generation, outcome })
                .await;
        });
    }

    async fn handle_connect_finished(&mut self, generation: u64, outcome: ConnectOutcome) {
        if generation != self.generation {
            if let ConnectOutcome::Ready(handle) = outcome {
                // A superseded attempt produced a pipeline nobody wants.
                handle.split().0.stop();
            }
            return;
        }
        self.connect_cancel = None;

        match outcome {
            ConnectOutcome::Ready(handle) if self.state == SessionState::Connecting => {
                let (stopper, completion) = handle.split();
                self.pipeline = Some(stopper);
                self.state = SessionState::Playing;

                let events = self.self_tx.clone();
                tokio::spawn(async move {
                    let outcome = completion.await.unwrap_or_else(|_| PipelineOutcome::Failed {
                        detail: "pipeline supervisor dropped".to_string(),
                    });
                    let _ = events
                        .send(SessionMessage::PipelineFinished { generation, outcome })
                        .await;
                });

                if let Some(current) = &self.current {
                    info!(
                        server_id = %self.server_id,
                        title = %current.title,
                        queued_for = ?(Utc::now() - current.enqueued_at).to_std().ok(),
                        "Streaming"
                    );
                    self.reporter.playing(current.kind, &current.title).await;
                }
            }
            ConnectOutcome::Ready(handle) => {
                // A stop raced the connect; the pipeline must not outlive
                // the decision.
                handle.split().0.stop();
                self.spawn_teardown(generation);
            }
            ConnectOutcome::Failed(e) if self.state == SessionState::Connecting => {
                warn!(server_id = %self.server_id, "Failed to start playback: {e}");
                if let Some(next) = self.queue.pop_front() {
                    // The failing request is dropped; the queue keeps
                    // going. connect() sorts out any half-open join.
                    self.begin_playback(next, false);
                } else {
                    self.state = SessionState::Draining;
                    self.spawn_teardown(generation);
                }
            }
            ConnectOutcome::Failed(_) | ConnectOutcome::Cancelled => {
                // Stop already moved us to Draining; finish the teardown
                // (idempotent even when the connect task tore down on
                // cancel).
                self.spawn_teardown(generation);
            }
        }
    }

    fn handle_pipeline_finished(&mut self, generation: u64, outcome: PipelineOutcome) {
        if generation != self.generation || self.state != SessionState::Playing {
            debug!(server_id = %self.server_id, "Ignoring stale pipeline event");
            return;
        }

        match &outcome {
            PipelineOutcome::Completed => {
                let title = self.current.as_ref().map_or("", |c| c.title.as_str());
                info!(server_id = %self.server_id, title, "Playback finished");
            }
            PipelineOutcome::Stopped => {
                info!(server_id = %self.server_id, "Playback stopped");
            }
            PipelineOutcome::Failed { detail } => {
                let err = Error::Pipeline {
                    detail: detail.clone(),
                };
                warn!(server_id = %self.server_id, "Playback failed: {err}");
            }
        }

        // Error or not, the queue continues; only the report differs.
        self.enter_drain(false);
    }

    /// Move to Draining: stop the pipeline (idempotent), lower the
    /// activity flags, then either tear down now or after the grace
    /// delay.
    fn enter_drain(&mut self, immediate: bool) {
        self.state = SessionState::Draining;
        if let Some(stopper) = self.pipeline.take() {
            stopper.stop();
        }

        let generation = self.generation;
        if immediate {
            self.spawn_teardown(generation);
            return;
        }

        let token = CancellationToken::new();
        self.grace_cancel = Some(token.clone());
        let connection = Arc::clone(&self.connection);
        let grace = self.session_config.drain_grace();
        let events = self.self_tx.clone();
        tokio::spawn(async move {
            connection.lock().await.lower_flags().await;
            tokio::select! {
                () = tokio::time::sleep(grace) => {
                    let _ = events
                        .send(SessionMessage::GraceElapsed { generation })
                        .await;
                }
                () = token.cancelled() => {}
            }
        });
    }

    fn handle_grace_elapsed(&mut self, generation: u64) {
        if generation != self.generation || self.state != SessionState::Draining {
            return;
        }
        self.grace_cancel = None;
        self.spawn_teardown(generation);
    }

    fn spawn_teardown(&mut self, generation: u64) {
        if self.teardown_running {
            return;
        }
        self.teardown_running = true;
        if let Some(token) = self.grace_cancel.take() {
            token.cancel();
        }

        let connection = Arc::clone(&self.connection);
        let events = self.self_tx.clone();
        tokio::spawn(async move {
            connection.lock().await.teardown().await;
            let _ = events
                .send(SessionMessage::TeardownFinished { generation })
                .await;
        });
    }

    async fn handle_teardown_finished(&mut self, generation: u64) {
        if generation != self.generation || self.state != SessionState::Draining {
            return;
        }
        self.teardown_running = false;
        self.pipeline = None;
        self.current = None;

        // Anything still queued was either preserved across a natural
        // end or enqueued after an explicit stop cleared the queue;
        // both continue playing.
        if let Some(next) = self.queue.pop_front() {
            info!(
                server_id = %self.server_id,
                title = %next.display_title,
                "Advancing to next queued request"
            );
            self.begin_playback(next, true);
        } else {
            self.go_idle().await;
        }
    }

    async fn handle_external_disconnect(&mut self) {
        match self.state {
            SessionState::Draining => {
                info!(
                    server_id = %self.server_id,
                    "Removed from channel externally, discarding queue"
                );
                self.queue.clear();
                if let Some(token) = self.grace_cancel.take() {
                    token.cancel();
                }
                // Invalidate whatever drain events are still in flight.
                self.generation += 1;
                if !self.teardown_running {
                    let connection = Arc::clone(&self.connection);
                    tokio::spawn(async move {
                        connection.lock().await.teardown().await;
                    });
                }
                self.teardown_running = false;
                self.go_idle().await;
            }
            SessionState::Playing | SessionState::Connecting => {
                // The pipeline notices the dead sinks and reports its own
                // failure; the normal drain path takes it from there.
                warn!(server_id = %self.server_id, "Transport reported external disconnect");
            }
            SessionState::Idle => {}
        }
    }

    async fn go_idle(&mut self) {
        debug_assert!(self.queue.is_empty());
        self.state = SessionState::Idle;
        self.current = None;
        self.pipeline = None;
        self.teardown_running = false;
        self.reporter.idle().await;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            current_title: self.current.as_ref().map(|c| c.title.clone()),
            current_channel: self.current.as_ref().map(|c| c.channel_id.clone()),
            queued_titles: self.queue.iter().map(|r| r.display_title.clone()).collect(),
            volume_percent: self.volume.percent(),
            has_pipeline: self.pipeline.is_some(),
        }
    }

    fn check_invariants(&self) {
        match self.state {
            SessionState::Idle => {
                debug_assert!(self.current.is_none());
                debug_assert!(self.pipeline.is_none());
                debug_assert!(self.queue.is_empty());
            }
            SessionState::Connecting | SessionState::Playing | SessionState::Draining => {
                debug_assert!(self.current.is_some() || self.state == SessionState::Draining);
            }
        }
        if self.current.is_none() {
            debug_assert!(self.pipeline.is_none());
        }
    }
}
