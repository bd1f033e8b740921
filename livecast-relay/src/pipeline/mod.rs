//! Transcoder subprocess construction and supervision.
//!
//! One ffmpeg process per playback. The process connects its two
//! elementary outputs (H.264 video, s16le PCM audio) to Unix sockets the
//! runner listens on; pump tasks forward video chunks to the transport
//! sink and route audio through the volume gain stage. stderr stays free
//! for diagnostics and is kept as a bounded tail for failure reports.
//!
//! `start` resolves once the process is spawned; completion is delivered
//! through the handle. `stop` is a graceful, fire-and-forget quit
//! request (ffmpeg's `q` on stdin, or closing stdin for stream inputs)
//! with a delayed hard-kill fallback.

mod spec;

pub use spec::{InputTarget, TranscodeSpec};

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livecast_core::config::PipelineConfig;
use livecast_core::models::{EncodeProfile, Locator, SourceKind};
use livecast_core::volume::VolumeControl;
use livecast_core::{Error, Result};

use crate::transport::{FrameSender, SendChannel};

/// How long the transcoder gets to open both output connections before
/// the run is declared failed (covers slow network input probing).
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

const VIDEO_CHUNK_CAPACITY: usize = 32 * 1024;
const AUDIO_CHUNK_CAPACITY: usize = 8 * 1024;

/// Everything a pipeline run needs.
pub struct PipelineJob {
    pub locator: Locator,
    pub kind: SourceKind,
    pub profile: EncodeProfile,
    pub sinks: SendChannel,
    pub volume: Arc<VolumeControl>,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The transcoder reached end of input and exited cleanly.
    Completed,
    /// A stop was requested; however the process exited, it counts as
    /// intentional.
    Stopped,
    /// Abnormal exit; `detail` carries the stderr tail.
    Failed { detail: String },
}

/// Graceful-stop control for a running pipeline. Cloneable and
/// idempotent; never blocks on process exit.
#[derive(Debug, Clone)]
pub struct PipelineStopper {
    token: CancellationToken,
}

impl PipelineStopper {
    /// Wrap a stop token. Alternate [`PipelineRunner`] implementations
    /// watch the token to learn a stop was requested.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Handle to one running pipeline: the stop control plus the completion
/// future the session awaits separately.
pub struct PipelineHandle {
    stopper: PipelineStopper,
    completion: oneshot::Receiver<PipelineOutcome>,
}

impl PipelineHandle {
    #[must_use]
    pub fn new(stopper: PipelineStopper, completion: oneshot::Receiver<PipelineOutcome>) -> Self {
        Self { stopper, completion }
    }

    #[must_use]
    pub fn split(self) -> (PipelineStopper, oneshot::Receiver<PipelineOutcome>) {
        (self.stopper, self.completion)
    }
}

#[async_trait]
pub trait PipelineRunner: Send + Sync + 'static {
    /// Spawn the transcoder for `job`. Suspends only until the process
    /// has accepted its configuration, not until it finishes.
    async fn start(&self, job: PipelineJob) -> Result<PipelineHandle>;
}

/// The real thing: spawns ffmpeg per [`TranscodeSpec`].
pub struct FfmpegRunner {
    config: PipelineConfig,
}

impl FfmpegRunner {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineRunner for FfmpegRunner {
    async fn start(&self, job: PipelineJob) -> Result<PipelineHandle> {
        let dir = tempfile::Builder::new()
            .prefix("livecast-pipe-")
            .tempdir()
            .map_err(Error::Io)?;
        let video_path = dir.path().join("video.sock");
        let audio_path = dir.path().join("audio.sock");
        let video_listener = UnixListener::bind(&video_path).map_err(Error::Io)?;
        let audio_listener = UnixListener::bind(&audio_path).map_err(Error::Io)?;

        let (input, stream_input) = match job.locator {
            Locator::Url(url) => (InputTarget::Url(url.to_string()), None),
            Locator::Stream(stream) => (InputTarget::Stdin, Some(stream.into_inner())),
        };

        let spec = TranscodeSpec {
            input,
            kind: job.kind,
            profile: job.profile,
            video_output: video_path.display().to_string(),
            audio_output: audio_path.display().to_string(),
        };
        let args = spec.build_args();
        debug!(ffmpeg = %self.config.ffmpeg_path, ?args, "Spawning transcoder");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Pipeline {
                detail: format!("failed to spawn {}: {e}", self.config.ffmpeg_path),
            })?;

        info!(pid = child.id(), "Transcoder started");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(
            self.config.stderr_tail_lines,
        )));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_stderr(
                stderr,
                Arc::clone(&stderr_tail),
                self.config.stderr_tail_lines,
            ));
        }

        let token = CancellationToken::new();
        let mut quit_stdin = child.stdin.take();

        // Stream inputs own stdin as their media pipe; stopping closes it
        // instead of writing the quit key.
        if let Some(reader) = stream_input {
            if let Some(stdin) = quit_stdin.take() {
                tokio::spawn(feed_stdin(reader, stdin, token.clone()));
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(supervise(SuperviseArgs {
            child,
            video_listener,
            audio_listener,
            video_tx: job.sinks.video_tx,
            audio_tx: job.sinks.audio_tx,
            volume: job.volume,
            stderr_tail,
            token: token.clone(),
            quit_stdin,
            kill_after: Duration::from_millis(self.config.kill_after_ms),
            done_tx,
            _socket_dir: dir,
        }));

        Ok(PipelineHandle::new(PipelineStopper { token }, done_rx))
    }
}

struct SuperviseArgs {
    child: Child,
    video_listener: UnixListener,
    audio_listener: UnixListener,
    video_tx: FrameSender,
    audio_tx: FrameSender,
    volume: Arc<VolumeControl>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    token: CancellationToken,
    quit_stdin: Option<ChildStdin>,
    kill_after: Duration,
    done_tx: oneshot::Sender<PipelineOutcome>,
    _socket_dir: tempfile::TempDir,
}

async fn supervise(args: SuperviseArgs) {
    let SuperviseArgs {
        mut child,
        video_listener,
        audio_listener,
        video_tx,
        audio_tx,
        volume,
        stderr_tail,
        token,
        mut quit_stdin,
        kill_after,
        done_tx,
        _socket_dir,
    } = args;

    let accept_both = async {
        tokio::try_join!(
            async { video_listener.accept().await.map(|(s, _)| s) },
            async { audio_listener.accept().await.map(|(s, _)| s) },
        )
    };
    tokio::pin!(accept_both);

    enum Startup {
        Accepted(UnixStream, UnixStream),
        AcceptFailed(std::io::Error),
        // Exited before producing any output (bad URL, codec probe failure).
        Exited(std::io::Result<std::process::ExitStatus>),
        StopRequested,
        TimedOut,
    }

    let startup = tokio::select! {
        accepted = &mut accept_both => match accepted {
            Ok((video_stream, audio_stream)) => Startup::Accepted(video_stream, audio_stream),
            Err(e) => Startup::AcceptFailed(e),
        },
        status = child.wait() => Startup::Exited(status),
        () = token.cancelled() => Startup::StopRequested,
        () = tokio::time::sleep(ACCEPT_TIMEOUT) => Startup::TimedOut,
    };

    let outcome = match startup {
        Startup::Accepted(video_stream, audio_stream) => {
            run_until_exit(
                &mut child,
                video_stream,
                audio_stream,
                video_tx,
                audio_tx,
                volume,
                &stderr_tail,
                &token,
                &mut quit_stdin,
                kill_after,
            )
            .await
        }
        Startup::AcceptFailed(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            PipelineOutcome::Failed {
                detail: format!("output socket accept failed: {e}"),
            }
        }
        Startup::Exited(status) => classify_exit(status, &stderr_tail),
        Startup::StopRequested => {
            let _ = stop_child(&mut child, &mut quit_stdin, kill_after).await;
            PipelineOutcome::Stopped
        }
        Startup::TimedOut => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            PipelineOutcome::Failed {
                detail: format!("transcoder did not open its outputs within {ACCEPT_TIMEOUT:?}"),
            }
        }
    };

    debug!(?outcome, "Transcoder finished");
    let _ = done_tx.send(outcome);
}

#[allow(clippy::too_many_arguments)]
async fn run_until_exit(
    child: &mut Child,
    video_stream: UnixStream,
    audio_stream: UnixStream,
    video_tx: FrameSender,
    audio_tx: FrameSender,
    volume: Arc<VolumeControl>,
    stderr_tail: &Arc<Mutex<VecDeque<String>>>,
    token: &CancellationToken,
    quit_stdin: &mut Option<ChildStdin>,
    kill_after: Duration,
) -> PipelineOutcome {
    let video_pump = tokio::spawn(pump_video(video_stream, video_tx));
    let audio_pump = tokio::spawn(pump_audio(audio_stream, audio_tx, volume));

    let natural_exit = tokio::select! {
        status = child.wait() => Some(status),
        () = token.cancelled() => None,
    };
    let (status, stopped) = match natural_exit {
        Some(status) => (status, false),
        None => (stop_child(child, quit_stdin, kill_after).await, true),
    };

    // Let the pumps drain whatever the process flushed before exiting.
    let _ = video_pump.await;
    let _ = audio_pump.await;

    if stopped {
        PipelineOutcome::Stopped
    } else {
        classify_exit(status, stderr_tail)
    }
}

/// Graceful quit request, escalating to a hard kill after `kill_after`.
async fn stop_child(
    child: &mut Child,
    quit_stdin: &mut Option<ChildStdin>,
    kill_after: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(mut stdin) = quit_stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
        // Dropping stdin closes the pipe, which also unblocks stream
        // inputs waiting on us.
    }

    match tokio::time::timeout(kill_after, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Transcoder ignored quit request, killing");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

fn classify_exit(
    status: std::io::Result<std::process::ExitStatus>,
    stderr_tail: &Arc<Mutex<VecDeque<String>>>,
) -> PipelineOutcome {
    match status {
        Ok(status) if status.success() => PipelineOutcome::Completed,
        Ok(status) => {
            let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
            let detail = if tail.is_empty() {
                format!("transcoder exited with {status}")
            } else {
                format!("transcoder exited with {status}: {}", tail.join(" | "))
            };
            PipelineOutcome::Failed { detail }
        }
        Err(e) => PipelineOutcome::Failed {
            detail: format!("failed to reap transcoder: {e}"),
        },
    }
}

async fn collect_stderr(
    stderr: impl AsyncRead + Unpin,
    tail: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "livecast::ffmpeg", "{line}");
        let mut tail = tail.lock();
        if tail.len() == capacity {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn feed_stdin(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut stdin: ChildStdin,
    token: CancellationToken,
) {
    tokio::select! {
        copied = tokio::io::copy(&mut reader, &mut stdin) => {
            if let Err(e) = copied {
                debug!("Stream input ended: {e}");
            }
        }
        () = token.cancelled() => {}
    }
    // stdin drops here; the transcoder sees EOF and finishes up.
}

async fn pump_video(mut stream: UnixStream, tx: FrameSender) {
    let mut buf = BytesMut::with_capacity(VIDEO_CHUNK_CAPACITY);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(buf.split().freeze()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Audio pump with the inline gain stage. Only whole s16 samples are
/// scaled; a torn byte at a chunk boundary is carried to the next read.
async fn pump_audio(mut stream: UnixStream, tx: FrameSender, volume: Arc<VolumeControl>) {
    let mut buf = BytesMut::with_capacity(AUDIO_CHUNK_CAPACITY);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                if !buf.is_empty() {
                    volume.apply(&mut buf);
                    let _ = tx.send(buf.split().freeze()).await;
                }
                break;
            }
            Ok(_) => {
                let whole = buf.len() & !1;
                if whole == 0 {
                    continue;
                }
                let mut chunk = buf.split_to(whole);
                volume.apply(&mut chunk);
                if tx.send(chunk.freeze()).await.is_err() {
                    break;
                }
            }
        }
    }
}
