//! Connection lifecycle: join/switch/leave of one destination server's
//! channel and creation of its send pipes.
//!
//! Owned exclusively by one session. The activity flags are raised only
//! after pipes exist and lowered before they are released, so observers
//! never see the flag on without a live pipe.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use livecast_core::models::{Destination, EncodeProfile};
use livecast_core::{Error, Result};

use crate::transport::{SendChannel, Transport};

pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    server_id: String,
    joined_channel: Option<String>,
    flags_raised: bool,
    connect_timeout: Duration,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, server_id: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            server_id: server_id.into(),
            joined_channel: None,
            flags_raised: false,
            connect_timeout,
        }
    }

    #[must_use]
    pub fn joined_channel(&self) -> Option<&str> {
        self.joined_channel.as_deref()
    }

    /// Join `destination`, reusing an existing join to the same channel
    /// and leaving first when joined elsewhere. Bounded by the connect
    /// timeout.
    pub async fn connect(&mut self, destination: &Destination) -> Result<()> {
        debug_assert_eq!(destination.server_id, self.server_id);

        if self.joined_channel.as_deref() == Some(destination.channel_id.as_str()) {
            debug!(destination = %destination, "Reusing existing channel join");
            return Ok(());
        }

        if self.joined_channel.is_some() {
            self.teardown().await;
        }

        tokio::time::timeout(self.connect_timeout, self.transport.join(destination))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "join handshake for {destination} timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        self.joined_channel = Some(destination.channel_id.clone());
        info!(destination = %destination, "Joined destination channel");
        Ok(())
    }

    /// Create the send pipes, then raise the activity flags.
    pub async fn open_pipes(
        &mut self,
        destination: &Destination,
        profile: &EncodeProfile,
    ) -> Result<SendChannel> {
        if self.joined_channel.as_deref() != Some(destination.channel_id.as_str()) {
            return Err(Error::Connection(format!(
                "cannot open send pipes for {destination}: not joined"
            )));
        }

        let channel = self
            .transport
            .create_send_channel(destination, profile)
            .await?;
        self.transport
            .set_activity_flags(&self.server_id, true, true)
            .await?;
        self.flags_raised = true;
        Ok(channel)
    }

    /// Lower the activity flags ahead of pipe teardown. Idempotent.
    pub async fn lower_flags(&mut self) {
        if !self.flags_raised {
            return;
        }
        self.flags_raised = false;
        if let Err(e) = self
            .transport
            .set_activity_flags(&self.server_id, false, false)
            .await
        {
            warn!(server_id = %self.server_id, "Failed to lower activity flags: {e}");
        }
    }

    /// Stop sending, lower flags, leave the channel. Idempotent and
    /// best-effort: teardown problems are logged, never propagated.
    pub async fn teardown(&mut self) {
        self.lower_flags().await;

        if let Some(channel_id) = self.joined_channel.take() {
            if let Err(e) = self.transport.leave(&self.server_id).await {
                warn!(
                    server_id = %self.server_id,
                    channel_id,
                    "Failed to leave channel during teardown: {e}"
                );
            } else {
                info!(server_id = %self.server_id, channel_id, "Left destination channel");
            }
        }
    }
}
