//! Reference UDP transport.
//!
//! A destination maps to a receiver listening on `host:port` for video
//! and `host:port+2` for audio; both elementary streams are forwarded as
//! datagrams. Good enough to point `ffplay`/`ffprobe` at the two ports
//! and watch a relay end-to-end; a production transport implements the
//! same trait against its real wire protocol.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use livecast_core::config::TransportConfig;
use livecast_core::models::{Destination, EncodeProfile};
use livecast_core::{Error, Result};
use livecast_relay::transport::{SendChannel, Transport, TransportEvent};

const PIPE_DEPTH: usize = 64;
/// Audio listens this many ports above the video port.
const AUDIO_PORT_OFFSET: u16 = 2;

struct Joined {
    channel_id: String,
    video_addr: SocketAddr,
    audio_addr: SocketAddr,
}

pub struct UdpTransport {
    config: TransportConfig,
    joined: DashMap<String, Joined>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl UdpTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            config,
            joined: DashMap::new(),
            events_tx,
        }
    }

    async fn resolve(destination: &Destination) -> Result<(SocketAddr, SocketAddr)> {
        let port: u16 = destination.channel_id.parse().map_err(|_| {
            Error::Connection(format!(
                "channel '{}' is not a UDP port",
                destination.channel_id
            ))
        })?;
        let video_addr = lookup(&destination.server_id, port).await?;
        let audio_addr = lookup(&destination.server_id, port + AUDIO_PORT_OFFSET).await?;
        Ok((video_addr, audio_addr))
    }
}

async fn lookup(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Connection(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| Error::Connection(format!("no address for {host}:{port}")))
}

#[async_trait]
impl Transport for UdpTransport {
    async fn join(&self, destination: &Destination) -> Result<()> {
        let (video_addr, audio_addr) = Self::resolve(destination).await?;
        self.joined.insert(
            destination.server_id.clone(),
            Joined {
                channel_id: destination.channel_id.clone(),
                video_addr,
                audio_addr,
            },
        );
        info!(%destination, %video_addr, %audio_addr, "UDP transport joined");
        Ok(())
    }

    async fn leave(&self, server_id: &str) -> Result<()> {
        if self.joined.remove(server_id).is_some() {
            info!(server_id, "UDP transport left");
        }
        Ok(())
    }

    async fn create_send_channel(
        &self,
        destination: &Destination,
        _profile: &EncodeProfile,
    ) -> Result<SendChannel> {
        let (video_addr, audio_addr) = {
            let joined = self.joined.get(&destination.server_id).ok_or_else(|| {
                Error::Connection(format!("not joined to {destination}"))
            })?;
            if joined.channel_id != destination.channel_id {
                return Err(Error::Connection(format!(
                    "joined to channel {} but asked to send to {destination}",
                    joined.channel_id
                )));
            }
            (joined.video_addr, joined.audio_addr)
        };

        let (video_tx, video_rx) = mpsc::channel(PIPE_DEPTH);
        let (audio_tx, audio_rx) = mpsc::channel(PIPE_DEPTH);
        let datagram = self.config.max_datagram_bytes;

        tokio::spawn(forward(video_rx, video_addr, datagram, "video"));
        tokio::spawn(forward(audio_rx, audio_addr, datagram, "audio"));

        Ok(SendChannel { video_tx, audio_tx })
    }

    async fn set_activity_flags(&self, server_id: &str, speaking: bool, video: bool) -> Result<()> {
        debug!(server_id, speaking, video, "Activity flags updated");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        // UDP is connectionless; nobody can kick us, so this stream
        // stays silent.
        self.events_tx.subscribe()
    }
}

/// Drain one elementary stream into datagram-sized sends.
async fn forward(
    mut rx: mpsc::Receiver<Bytes>,
    addr: SocketAddr,
    max_datagram: usize,
    label: &'static str,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(label, "Failed to bind UDP send socket: {e}");
            return;
        }
    };

    let mut sent: u64 = 0;
    while let Some(chunk) = rx.recv().await {
        for datagram in chunk.chunks(max_datagram) {
            match socket.send_to(datagram, addr).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(label, "UDP send failed: {e}");
                }
            }
        }
    }
    debug!(label, datagrams = sent, "Send pipe closed");
}
