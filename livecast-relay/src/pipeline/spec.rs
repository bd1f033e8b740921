//! Transcode argv construction.
//!
//! One input, two independently configured elementary outputs: H.264
//! video tuned for low latency with forced keyframes at the frame-rate
//! interval, and raw s16le stereo PCM for the gain stage. Pure data —
//! the process side lives in the parent module.

use livecast_core::models::{EncodeProfile, SourceKind};

/// Descriptive client header for network inputs.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.3";

/// Bounded backoff for the transcoder's own reconnect-on-drop.
const RECONNECT_DELAY_MAX_SECS: &str = "4294";

/// Where the transcoder reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputTarget {
    /// Fetch the URL itself (enables header/reconnect handling).
    Url(String),
    /// Read a byte stream from stdin.
    Stdin,
}

/// Fully resolved specification for one transcoder run.
#[derive(Debug, Clone)]
pub struct TranscodeSpec {
    pub input: InputTarget,
    pub kind: SourceKind,
    pub profile: EncodeProfile,
    /// Unix-socket paths the process connects its outputs to.
    pub video_output: String,
    pub audio_output: String,
}

impl TranscodeSpec {
    /// Build the complete ffmpeg argument list.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        if self.profile.hardware_decode {
            args.extend(["-hwaccel".into(), "auto".into()]);
        }
        if self.profile.read_at_native_fps {
            args.push("-re".into());
        }

        // Low-buffering input probing
        args.extend([
            "-fflags".into(),
            "nobuffer".into(),
            "-analyzeduration".into(),
            "0".into(),
        ]);

        let input = match &self.input {
            InputTarget::Url(url) => {
                if is_network_url(url) {
                    args.extend([
                        "-headers".into(),
                        format!("User-Agent: {USER_AGENT}\r\nConnection: keep-alive\r\n"),
                    ]);
                    if self.kind == SourceKind::Hls {
                        // Segmented sources reconnect per segment on their
                        // own; remux the ADTS audio payload instead.
                        args.extend(["-bsf:a".into(), "aac_adtstoasc".into()]);
                    } else {
                        args.extend([
                            "-reconnect".into(),
                            "1".into(),
                            "-reconnect_at_eof".into(),
                            "1".into(),
                            "-reconnect_streamed".into(),
                            "1".into(),
                            "-reconnect_delay_max".into(),
                            RECONNECT_DELAY_MAX_SECS.into(),
                        ]);
                    }
                }
                url.clone()
            }
            InputTarget::Stdin => "pipe:0".to_string(),
        };
        args.extend(["-i".into(), input]);

        self.push_video_branch(&mut args);
        self.push_audio_branch(&mut args);
        args
    }

    fn push_video_branch(&self, args: &mut Vec<String>) {
        let fps = self.profile.frame_rate;
        let keyint = self.profile.keyframe_interval();
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-an".into(),
            "-vf".into(),
            format!(
                "scale=w={}:h={}:force_original_aspect_ratio=decrease:force_divisible_by=2",
                self.profile.width, self.profile.height
            ),
            "-r".into(),
            fps.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-b:v".into(),
            format!("{}k", self.profile.bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", self.profile.max_bitrate_kbps),
            "-tune".into(),
            "zerolatency".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-preset".into(),
            self.profile.preset.clone(),
            "-profile:v".into(),
            "baseline".into(),
            "-g".into(),
            keyint.to_string(),
            "-bf".into(),
            "0".into(),
            "-x264-params".into(),
            format!("keyint={keyint}:min-keyint={keyint}"),
            "-bsf:v".into(),
            "h264_metadata=aud=insert".into(),
            "-f".into(),
            "h264".into(),
            format!("unix://{}", self.video_output),
        ]);
    }

    fn push_audio_branch(&self, args: &mut Vec<String>) {
        args.extend([
            "-map".into(),
            "0:a:0".into(),
            "-vn".into(),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "48000".into(),
            "-f".into(),
            "s16le".into(),
            format!("unix://{}", self.audio_output),
        ]);
    }
}

fn is_network_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(input: InputTarget, kind: SourceKind) -> TranscodeSpec {
        TranscodeSpec {
            input,
            kind,
            profile: EncodeProfile::default(),
            video_output: "/tmp/v.sock".to_string(),
            audio_output: "/tmp/a.sock".to_string(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn network_direct_source_gets_reconnect_and_headers() {
        let args = spec(
            InputTarget::Url("https://cdn.example.com/movie.mp4".into()),
            SourceKind::DirectVideo,
        )
        .build_args();

        assert!(has_pair(&args, "-reconnect", "1"));
        assert!(has_pair(&args, "-reconnect_at_eof", "1"));
        assert!(has_pair(&args, "-reconnect_streamed", "1"));
        assert!(has_pair(&args, "-reconnect_delay_max", "4294"));
        assert!(args.iter().any(|a| a.starts_with("User-Agent:")));
        assert!(!args.contains(&"aac_adtstoasc".to_string()));
    }

    #[test]
    fn hls_source_gets_bitstream_filter_not_reconnect() {
        let args = spec(
            InputTarget::Url("https://live.example.com/ch/index.m3u8".into()),
            SourceKind::Hls,
        )
        .build_args();

        assert!(has_pair(&args, "-bsf:a", "aac_adtstoasc"));
        assert!(!args.contains(&"-reconnect".to_string()));
    }

    #[test]
    fn local_input_gets_neither_headers_nor_reconnect() {
        let args = spec(
            InputTarget::Url("file:///media/movie.mkv".into()),
            SourceKind::DirectVideo,
        )
        .build_args();

        assert!(!args.iter().any(|a| a.starts_with("User-Agent:")));
        assert!(!args.contains(&"-reconnect".to_string()));
        assert!(!args.contains(&"aac_adtstoasc".to_string()));
    }

    #[test]
    fn stdin_input_reads_pipe_zero() {
        let args = spec(InputTarget::Stdin, SourceKind::Torrent).build_args();
        assert!(has_pair(&args, "-i", "pipe:0"));
        assert!(!args.contains(&"-reconnect".to_string()));
    }

    #[test]
    fn video_branch_is_low_latency_h264() {
        let args = spec(
            InputTarget::Url("https://cdn.example.com/movie.mp4".into()),
            SourceKind::DirectVideo,
        )
        .build_args();

        assert!(has_pair(&args, "-tune", "zerolatency"));
        assert!(has_pair(&args, "-pix_fmt", "yuv420p"));
        assert!(has_pair(&args, "-profile:v", "baseline"));
        assert!(has_pair(&args, "-bf", "0"));
        assert!(has_pair(&args, "-b:v", "4000k"));
        assert!(has_pair(&args, "-bsf:v", "h264_metadata=aud=insert"));
        assert!(args
            .iter()
            .any(|a| a.contains("force_original_aspect_ratio=decrease")));
    }

    #[test]
    fn keyframes_align_to_frame_rate() {
        let mut profile = EncodeProfile::default();
        profile.frame_rate = 24;
        let mut s = spec(
            InputTarget::Url("https://cdn.example.com/movie.mp4".into()),
            SourceKind::DirectVideo,
        );
        s.profile = profile;
        let args = s.build_args();

        assert!(has_pair(&args, "-g", "24"));
        assert!(has_pair(&args, "-r", "24"));
        assert!(has_pair(&args, "-x264-params", "keyint=24:min-keyint=24"));
    }

    #[test]
    fn audio_branch_is_stereo_48k_pcm() {
        let args = spec(
            InputTarget::Url("https://cdn.example.com/movie.mp4".into()),
            SourceKind::DirectVideo,
        )
        .build_args();

        assert!(has_pair(&args, "-ac", "2"));
        assert!(has_pair(&args, "-ar", "48000"));
        assert!(has_pair(&args, "-f", "s16le"));
        assert!(args.contains(&"unix:///tmp/a.sock".to_string()));
    }

    #[test]
    fn hardware_decode_and_native_fps_are_opt_in() {
        let base = spec(
            InputTarget::Url("https://cdn.example.com/movie.mp4".into()),
            SourceKind::DirectVideo,
        );
        let args = base.build_args();
        assert!(!args.contains(&"-hwaccel".to_string()));
        assert!(!args.contains(&"-re".to_string()));

        let mut tuned = base;
        tuned.profile.hardware_decode = true;
        tuned.profile.read_at_native_fps = true;
        let args = tuned.build_args();
        assert!(has_pair(&args, "-hwaccel", "auto"));
        assert!(args.contains(&"-re".to_string()));
    }
}
