//! Session state machine behavior, driven end-to-end against a fake
//! transport and a scripted pipeline runner (no ffmpeg, no network).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use livecast_core::config::SessionConfig;
use livecast_core::models::{Destination, EncodeProfile, Locator, PlaybackRequest, SourceKind};
use livecast_core::volume::VolumeControl;
use livecast_core::{Error, Result};
use livecast_relay::connection::ConnectionManager;
use livecast_relay::pipeline::{
    PipelineHandle, PipelineJob, PipelineOutcome, PipelineRunner, PipelineStopper,
};
use livecast_relay::session::{EnqueueOutcome, SessionManager, SessionSnapshot, SessionState};
use livecast_relay::status::StatusSink;
use livecast_relay::transport::{SendChannel, Transport, TransportEvent};

// ── fakes ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeTransportState {
    joins: Vec<String>,
    leaves: usize,
    flags: Vec<(bool, bool)>,
    fail_joins: VecDeque<bool>,
    // keep pipe receivers alive so senders stay usable
    receivers: Vec<mpsc::Receiver<bytes::Bytes>>,
}

struct FakeTransport {
    state: Mutex<FakeTransportState>,
    join_delay: Mutex<Duration>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(FakeTransportState::default()),
            join_delay: Mutex::new(Duration::ZERO),
            events_tx,
        })
    }

    fn fail_next_join(&self) {
        self.state.lock().fail_joins.push_back(true);
    }

    fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock() = delay;
    }

    fn joins(&self) -> Vec<String> {
        self.state.lock().joins.clone()
    }

    fn leaves(&self) -> usize {
        self.state.lock().leaves
    }

    fn last_flags(&self) -> Option<(bool, bool)> {
        self.state.lock().flags.last().copied()
    }

    fn emit_disconnect(&self, server_id: &str) {
        let _ = self.events_tx.send(TransportEvent::Disconnected {
            server_id: server_id.to_string(),
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn join(&self, destination: &Destination) -> Result<()> {
        let delay = *self.join_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_joins.pop_front().unwrap_or(false) {
            return Err(Error::Connection("join refused by fake".to_string()));
        }
        state.joins.push(destination.channel_id.clone());
        Ok(())
    }

    async fn leave(&self, _server_id: &str) -> Result<()> {
        self.state.lock().leaves += 1;
        Ok(())
    }

    async fn create_send_channel(
        &self,
        _destination: &Destination,
        _profile: &EncodeProfile,
    ) -> Result<SendChannel> {
        let (video_tx, video_rx) = mpsc::channel(16);
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let mut state = self.state.lock();
        state.receivers.push(video_rx);
        state.receivers.push(audio_rx);
        Ok(SendChannel { video_tx, audio_tx })
    }

    async fn set_activity_flags(&self, _server_id: &str, speaking: bool, video: bool) -> Result<()> {
        self.state.lock().flags.push((speaking, video));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

/// One started pipeline the test can finish at will.
struct StartedPipeline {
    volume: Arc<VolumeControl>,
    volume_at_start: u32,
    done: Option<oneshot::Sender<PipelineOutcome>>,
    stop_token: CancellationToken,
}

#[derive(Default)]
struct ScriptedRunner {
    starts: AtomicUsize,
    fail_starts: Mutex<VecDeque<bool>>,
    started: Mutex<Vec<StartedPipeline>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_next_start(&self) {
        self.fail_starts.lock().push_back(true);
    }

    fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn finish(&self, index: usize, outcome: PipelineOutcome) {
        let mut started = self.started.lock();
        if let Some(done) = started[index].done.take() {
            let _ = done.send(outcome);
        }
    }

    fn volume_at_start(&self, index: usize) -> u32 {
        self.started.lock()[index].volume_at_start
    }

    fn live_volume(&self, index: usize) -> u32 {
        self.started.lock()[index].volume.percent()
    }

    fn stop_requested(&self, index: usize) -> bool {
        self.started.lock()[index].stop_token.is_cancelled()
    }
}

#[async_trait]
impl PipelineRunner for ScriptedRunner {
    async fn start(&self, job: PipelineJob) -> Result<PipelineHandle> {
        if self.fail_starts.lock().pop_front().unwrap_or(false) {
            return Err(Error::Pipeline {
                detail: "scripted start failure".to_string(),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        self.started.lock().push(StartedPipeline {
            volume_at_start: job.volume.percent(),
            volume: Arc::clone(&job.volume),
            done: Some(done_tx),
            stop_token: token.clone(),
        });
        Ok(PipelineHandle::new(PipelineStopper::new(token), done_rx))
    }
}

struct NullSink;

#[async_trait]
impl StatusSink for NullSink {
    async fn publish(&self, _emoji: &str, _text: &str) -> Result<()> {
        Ok(())
    }
}

// ── harness ──────────────────────────────────────────────────────────────

struct Harness {
    transport: Arc<FakeTransport>,
    runner: Arc<ScriptedRunner>,
    manager: SessionManager<FakeTransport, ScriptedRunner, NullSink>,
}

fn fast_session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 2_000,
        drain_grace_ms: 10,
        switch_delay_ms: 10,
    }
}

fn harness_with(config: SessionConfig) -> Harness {
    let transport = FakeTransport::new();
    let runner = ScriptedRunner::new();
    let manager = SessionManager::new(
        Arc::clone(&transport),
        Arc::clone(&runner),
        Arc::new(NullSink),
        config,
        EncodeProfile::default(),
    );
    Harness {
        transport,
        runner,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(fast_session_config())
}

fn request(title: &str, channel: &str) -> PlaybackRequest {
    let url = url::Url::parse(&format!("https://cdn.example.com/{title}.mp4")).expect("url");
    PlaybackRequest::new(SourceKind::DirectVideo, Locator::Url(url), title, channel)
}

async fn wait_for<F>(handle: &livecast_relay::session::SessionHandle, mut predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.expect("snapshot");
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting; last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn assert_idle_invariant(snapshot: &SessionSnapshot) {
    if snapshot.state == SessionState::Idle {
        assert!(snapshot.current_title.is_none(), "idle with a current request");
        assert!(!snapshot.has_pipeline, "idle with a live pipeline");
        assert!(snapshot.queued_titles.is_empty(), "idle with a queue");
    }
    if snapshot.current_title.is_none() {
        assert!(!snapshot.has_pipeline, "pipeline without a current request");
    }
}

// ── tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_enqueue_starts_later_enqueues_append() {
    let h = harness();
    let session = h.manager.session("general");

    let outcome = session.enqueue(request("a", "movies")).await.expect("enqueue a");
    assert_eq!(outcome, EnqueueOutcome::Started);

    let snapshot = wait_for(&session, |s| s.state == SessionState::Playing).await;
    assert_eq!(snapshot.current_title.as_deref(), Some("a"));

    let outcome = session.enqueue(request("b", "movies")).await.expect("enqueue b");
    assert_eq!(outcome, EnqueueOutcome::Queued { position: 1 });
    let outcome = session.enqueue(request("c", "movies")).await.expect("enqueue c");
    assert_eq!(outcome, EnqueueOutcome::Queued { position: 2 });

    let snapshot = session.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.current_title.as_deref(), Some("a"));
    assert_eq!(snapshot.queued_titles, vec!["b", "c"]);
    assert_idle_invariant(&snapshot);
}

#[tokio::test]
async fn enqueue_for_other_channel_is_rejected_busy() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("enqueue a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;

    let err = session
        .enqueue(request("b", "music"))
        .await
        .expect_err("must reject");
    assert!(matches!(err, Error::Busy(channel) if channel == "movies"));

    // The bound session is untouched.
    let snapshot = session.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.current_title.as_deref(), Some("a"));
    assert!(snapshot.queued_titles.is_empty());
}

#[tokio::test]
async fn fifo_order_survives_volume_and_status_calls() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");
    session.enqueue(request("c", "movies")).await.expect("c");

    // Interleave unrelated operations; they must not reorder the queue.
    session.set_volume(80).await.expect("volume");
    let _ = session.snapshot().await.expect("snapshot");

    h.runner.finish(0, PipelineOutcome::Completed);
    let snapshot =
        wait_for(&session, |s| s.current_title.as_deref() == Some("b") && s.state == SessionState::Playing).await;
    assert_eq!(snapshot.queued_titles, vec!["c"]);

    session.set_volume(60).await.expect("volume");
    h.runner.finish(1, PipelineOutcome::Completed);
    wait_for(&session, |s| s.current_title.as_deref() == Some("c") && s.state == SessionState::Playing).await;

    h.runner.finish(2, PipelineOutcome::Completed);
    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);
    assert_eq!(h.runner.start_count(), 3);
}

#[tokio::test]
async fn natural_end_advances_queue_without_new_enqueue() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");

    h.runner.finish(0, PipelineOutcome::Completed);

    let snapshot = wait_for(&session, |s| {
        s.state == SessionState::Playing && s.current_title.as_deref() == Some("b")
    })
    .await;
    assert!(snapshot.queued_titles.is_empty());
    assert_eq!(h.runner.start_count(), 2);
}

#[tokio::test]
async fn explicit_stop_discards_queue() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");
    session.enqueue(request("c", "movies")).await.expect("c");

    let stopped = session.stop().await.expect("stop");
    assert!(stopped);

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);

    // Neither b nor c ever started; a's pipeline got the stop signal.
    assert_eq!(h.runner.start_count(), 1);
    assert!(h.runner.stop_requested(0));

    // Stopping an idle session is a no-op.
    assert!(!session.stop().await.expect("stop idle"));
}

#[tokio::test]
async fn pipeline_error_continues_queue_like_natural_end() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");

    h.runner.finish(
        0,
        PipelineOutcome::Failed {
            detail: "exit status 1: moov atom not found".to_string(),
        },
    );

    wait_for(&session, |s| {
        s.state == SessionState::Playing && s.current_title.as_deref() == Some("b")
    })
    .await;
}

#[tokio::test]
async fn volume_set_while_idle_applies_to_next_playback() {
    let h = harness();
    let session = h.manager.session("general");

    assert_eq!(session.set_volume(40).await.expect("volume"), 40);
    let snapshot = session.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.volume_percent, 40);

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;

    assert_eq!(h.runner.volume_at_start(0), 40);

    // Live adjustment reaches the same gain stage the pump reads.
    session.set_volume(150).await.expect("volume");
    assert_eq!(h.runner.live_volume(0), 150);
}

#[tokio::test]
async fn volume_is_clamped() {
    let h = harness();
    let session = h.manager.session("general");
    assert_eq!(session.set_volume(100_000).await.expect("volume"), 400);
}

#[tokio::test]
async fn connect_error_drops_request_but_processes_queued_next() {
    let h = harness();
    // Slow join so "b" can be queued while "a" is still Connecting.
    h.transport.set_join_delay(Duration::from_millis(100));
    h.transport.fail_next_join();

    let session = h.manager.session("general");
    session.enqueue(request("a", "movies")).await.expect("a");

    let outcome = session.enqueue(request("b", "movies")).await.expect("b");
    assert_eq!(outcome, EnqueueOutcome::Queued { position: 1 });

    // a's join fails; b is promoted and succeeds.
    let snapshot = wait_for(&session, |s| {
        s.state == SessionState::Playing && s.current_title.as_deref() == Some("b")
    })
    .await;
    assert!(snapshot.queued_titles.is_empty());
    assert_eq!(h.runner.start_count(), 1);
}

#[tokio::test]
async fn connect_error_with_empty_queue_returns_to_idle() {
    let h = harness();
    h.transport.fail_next_join();

    let session = h.manager.session("general");
    session.enqueue(request("a", "movies")).await.expect("a");

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);
    assert_eq!(h.runner.start_count(), 0);
}

#[tokio::test]
async fn pipeline_start_failure_is_request_scoped() {
    let h = harness();
    h.runner.fail_next_start();

    let session = h.manager.session("general");
    session.enqueue(request("a", "movies")).await.expect("a");

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);

    // The session is not stuck: the next request plays normally.
    session.enqueue(request("b", "movies")).await.expect("b");
    wait_for(&session, |s| {
        s.state == SessionState::Playing && s.current_title.as_deref() == Some("b")
    })
    .await;
}

#[tokio::test]
async fn stop_interrupts_inflight_connect() {
    let h = harness();
    h.transport.set_join_delay(Duration::from_secs(30));

    let session = h.manager.session("general");
    session.enqueue(request("a", "movies")).await.expect("a");

    let snapshot = session.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state, SessionState::Connecting);

    let stopped = session.stop().await.expect("stop");
    assert!(stopped);

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);
    // The abandoned join never became a pipeline.
    assert_eq!(h.runner.start_count(), 0);
}

#[tokio::test]
async fn external_disconnect_during_drain_discards_queue() {
    // Long grace keeps the session in Draining while we fire the event.
    let h = harness_with(SessionConfig {
        connect_timeout_ms: 2_000,
        drain_grace_ms: 60_000,
        switch_delay_ms: 10,
    });
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");

    h.runner.finish(0, PipelineOutcome::Completed);
    wait_for(&session, |s| s.state == SessionState::Draining).await;

    h.transport.emit_disconnect("general");

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);
    // b never played.
    assert_eq!(h.runner.start_count(), 1);
}

#[tokio::test]
async fn stop_during_drain_short_circuits_grace() {
    let h = harness_with(SessionConfig {
        connect_timeout_ms: 2_000,
        drain_grace_ms: 60_000,
        switch_delay_ms: 10,
    });
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    session.enqueue(request("b", "movies")).await.expect("b");

    h.runner.finish(0, PipelineOutcome::Completed);
    wait_for(&session, |s| s.state == SessionState::Draining).await;

    // Without the stop, the 60s grace would hold Draining far past the
    // test deadline; the stop cancels it and discards b.
    session.stop().await.expect("stop");

    let snapshot = wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_idle_invariant(&snapshot);
    assert_eq!(h.runner.start_count(), 1);
}

#[tokio::test]
async fn activity_flags_follow_pipe_lifecycle() {
    let h = harness();
    let session = h.manager.session("general");

    session.enqueue(request("a", "movies")).await.expect("a");
    wait_for(&session, |s| s.state == SessionState::Playing).await;
    assert_eq!(h.transport.last_flags(), Some((true, true)));

    h.runner.finish(0, PipelineOutcome::Completed);
    wait_for(&session, |s| s.state == SessionState::Idle).await;
    assert_eq!(h.transport.last_flags(), Some((false, false)));
}

#[tokio::test]
async fn sessions_are_independent_per_server() {
    let h = harness();
    let one = h.manager.session("alpha");
    let two = h.manager.session("beta");

    one.enqueue(request("a", "movies")).await.expect("a");
    two.enqueue(request("b", "shows")).await.expect("b");

    wait_for(&one, |s| s.state == SessionState::Playing).await;
    wait_for(&two, |s| s.state == SessionState::Playing).await;

    // Both play concurrently; same server id returns the same session.
    assert_eq!(h.runner.start_count(), 2);
    one.set_volume(30).await.expect("volume");
    assert_eq!(two.snapshot().await.expect("snapshot").volume_percent, 100);

    let one_again = h.manager.session("alpha");
    assert_eq!(
        one_again.snapshot().await.expect("snapshot").volume_percent,
        30
    );
}

#[tokio::test]
async fn connection_teardown_is_idempotent() {
    let transport = FakeTransport::new();
    let mut conn = ConnectionManager::new(
        Arc::clone(&transport),
        "general",
        Duration::from_secs(1),
    );
    let destination = Destination::new("general", "movies");

    conn.connect(&destination).await.expect("connect");
    assert_eq!(conn.joined_channel(), Some("movies"));

    conn.teardown().await;
    let leaves_after_first = transport.leaves();
    conn.teardown().await;

    assert_eq!(conn.joined_channel(), None);
    assert_eq!(transport.leaves(), leaves_after_first);
}

#[tokio::test]
async fn connect_reuses_same_channel_join() {
    let transport = FakeTransport::new();
    let mut conn = ConnectionManager::new(
        Arc::clone(&transport),
        "general",
        Duration::from_secs(1),
    );
    let destination = Destination::new("general", "movies");

    conn.connect(&destination).await.expect("connect");
    conn.connect(&destination).await.expect("reconnect");
    assert_eq!(transport.joins().len(), 1);

    // Switching channels leaves first, then joins the new one.
    let other = Destination::new("general", "music");
    conn.connect(&other).await.expect("switch");
    assert_eq!(transport.joins(), vec!["movies", "music"]);
    assert_eq!(transport.leaves(), 1);
}

#[tokio::test]
async fn connect_times_out_as_connection_error() {
    let transport = FakeTransport::new();
    transport.set_join_delay(Duration::from_secs(30));
    let mut conn = ConnectionManager::new(
        Arc::clone(&transport),
        "general",
        Duration::from_millis(50),
    );

    let err = conn
        .connect(&Destination::new("general", "movies"))
        .await
        .expect_err("must time out");
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(conn.joined_channel(), None);
}
