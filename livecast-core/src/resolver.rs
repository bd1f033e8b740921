//! Resolver seam: turns a user query or link into a playable locator.
//!
//! Catalog, torrent and video-site resolvers are external collaborators;
//! they all reduce to this one capability. The crate ships only the
//! direct-URL reference implementation.

use async_trait::async_trait;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::models::{Locator, SourceKind};

/// Output of a successful resolve.
#[derive(Debug)]
pub struct ResolvedMedia {
    pub locator: Locator,
    pub title: String,
    pub kind: SourceKind,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a user-supplied query or link to playable media.
    ///
    /// Failure is request-scoped: callers report it and keep the session
    /// untouched.
    async fn resolve(&self, input: &str) -> Result<ResolvedMedia>;
}

static MAGNET_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    regex::Regex::new(r"(?i)^magnet:\?xt=urn:[a-z0-9]+:[a-z0-9]{32}").unwrap()
});

/// True when the input looks like a BitTorrent magnet link.
#[must_use]
pub fn is_magnet_link(input: &str) -> bool {
    MAGNET_RE.is_match(input)
}

/// Resolver for plain video links.
///
/// Accepts http(s) URLs, classifies m3u8 playlists as HLS, and derives a
/// display title from the final path segment. Magnet links are
/// recognized but refused — torrent resolution lives outside this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectUrlResolver;

#[async_trait]
impl Resolver for DirectUrlResolver {
    async fn resolve(&self, input: &str) -> Result<ResolvedMedia> {
        if is_magnet_link(input) {
            return Err(Error::Resolve(
                "magnet links need a torrent resolver".to_string(),
            ));
        }

        let url = url::Url::parse(input)
            .map_err(|e| Error::Resolve(format!("not a valid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Resolve(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let kind = if is_hls_path(url.path()) {
            SourceKind::Hls
        } else {
            SourceKind::DirectVideo
        };
        let title = title_from_url(&url);

        Ok(ResolvedMedia {
            locator: Locator::Url(url),
            title,
            kind,
        })
    }
}

fn is_hls_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".m3u8") || lower.ends_with(".m3u")
}

fn title_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map_or_else(
            || url.host_str().unwrap_or("stream").to_string(),
            |segment| {
                segment
                    .rsplit_once('.')
                    .map_or(segment, |(stem, _ext)| stem)
                    .replace(['_', '.'], " ")
            },
        )
}
