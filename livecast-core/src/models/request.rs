use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::io::AsyncRead;

/// Where a playable came from. Closed set; the resolver decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Plain progressive video URL (or a catalog-resolved direct link).
    DirectVideo,
    /// Segmented HLS playlist (m3u8).
    Hls,
    /// Torrent content, delivered as a byte stream by its resolver.
    Torrent,
    /// Library/catalog item (movie or episode).
    Catalog,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "direct_video" => Ok(Self::DirectVideo),
            "hls" => Ok(Self::Hls),
            "torrent" => Ok(Self::Torrent),
            "catalog" => Ok(Self::Catalog),
            _ => Err(format!("Unknown source kind: {s}")),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectVideo => write!(f, "direct_video"),
            Self::Hls => write!(f, "hls"),
            Self::Torrent => write!(f, "torrent"),
            Self::Catalog => write!(f, "catalog"),
        }
    }
}

/// Opaque readable handle to playable bytes (torrent resolvers produce
/// these instead of URLs).
pub struct ByteStream(Box<dyn AsyncRead + Send + Unpin>);

impl ByteStream {
    #[must_use]
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self(Box::new(reader))
    }

    #[must_use]
    pub fn into_inner(self) -> Box<dyn AsyncRead + Send + Unpin> {
        self.0
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteStream")
    }
}

/// Reference to playable content, produced by a resolver.
#[derive(Debug)]
pub enum Locator {
    Url(url::Url),
    Stream(ByteStream),
}

impl Locator {
    #[must_use]
    pub const fn as_url(&self) -> Option<&url::Url> {
        match self {
            Self::Url(url) => Some(url),
            Self::Stream(_) => None,
        }
    }

    /// True for locators the transcoder fetches over the network itself.
    #[must_use]
    pub fn is_network(&self) -> bool {
        self.as_url()
            .is_some_and(|u| matches!(u.scheme(), "http" | "https"))
    }
}

/// One unit of playback work. Immutable once created.
#[derive(Debug)]
pub struct PlaybackRequest {
    pub kind: SourceKind,
    pub locator: Locator,
    pub display_title: String,
    /// Channel within the destination server this request targets.
    pub channel_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl PlaybackRequest {
    #[must_use]
    pub fn new(
        kind: SourceKind,
        locator: Locator,
        display_title: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            locator,
            display_title: display_title.into(),
            channel_id: channel_id.into(),
            enqueued_at: Utc::now(),
        }
    }
}
