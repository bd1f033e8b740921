//! Transport seam: the low-level join/leave and raw packet-send
//! capability the relay streams through.
//!
//! The session manager only uses this contract; the wire protocol behind
//! it is a separate concern. Send pipes are bounded byte-chunk channels
//! so a slow transport applies backpressure to the pipeline pumps.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use livecast_core::models::{Destination, EncodeProfile};
use livecast_core::Result;

/// Chunk sender for one elementary stream.
pub type FrameSender = mpsc::Sender<Bytes>;

/// A fresh pair of elementary-stream send pipes.
///
/// Dropping both senders closes the data channel on the transport side.
pub struct SendChannel {
    pub video_tx: FrameSender,
    pub audio_tx: FrameSender,
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection on `server_id` was removed by an external event
    /// (kicked from the channel, server gone).
    Disconnected { server_id: String },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join the destination channel, completing the handshake.
    async fn join(&self, destination: &Destination) -> Result<()>;

    /// Leave whatever channel is joined on `server_id`. Idempotent.
    async fn leave(&self, server_id: &str) -> Result<()>;

    /// Request a fresh transport data channel sized per `profile`.
    ///
    /// Fails with `Error::Connection` if `destination` is not joined.
    async fn create_send_channel(
        &self,
        destination: &Destination,
        profile: &EncodeProfile,
    ) -> Result<SendChannel>;

    /// Flip the outward speaking/video-active flags for `server_id`.
    async fn set_activity_flags(&self, server_id: &str, speaking: bool, video: bool)
        -> Result<()>;

    /// Subscribe to transport events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
