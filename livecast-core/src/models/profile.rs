use serde::{Deserialize, Serialize};

use crate::config::StreamConfig;

/// Negotiated output parameters for one pipeline run.
///
/// Produced by the connection lifecycle manager from transport-side
/// capabilities; the pipeline builder treats it as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub frame_rate: u32,
    pub preset: String,
    pub read_at_native_fps: bool,
    pub hardware_decode: bool,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for EncodeProfile {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            width: stream.width,
            height: stream.height,
            bitrate_kbps: stream.bitrate_kbps,
            max_bitrate_kbps: stream.max_bitrate_kbps,
            frame_rate: stream.frame_rate,
            preset: stream.preset.clone(),
            read_at_native_fps: stream.read_at_native_fps,
            hardware_decode: stream.hardware_acceleration,
        }
    }
}

impl EncodeProfile {
    /// Keyframe interval in frames. One keyframe per second bounds the
    /// worst-case join latency for a late receiver to one frame-rate
    /// period.
    #[must_use]
    pub const fn keyframe_interval(&self) -> u32 {
        self.frame_rate
    }
}
