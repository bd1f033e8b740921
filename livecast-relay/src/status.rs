//! Presence reporting: forwards human-readable state strings to the
//! external sink. Best-effort only — a failed push is logged and never
//! blocks playback.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use livecast_core::models::SourceKind;
use livecast_core::Result;

const IDLE_EMOJI: &str = "💿";
const IDLE_TEXT: &str = "Spinning around...";
const TITLE_MAX_CHARS: usize = 100;

#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    async fn publish(&self, emoji: &str, text: &str) -> Result<()>;
}

pub struct StatusReporter<S: StatusSink> {
    sink: Arc<S>,
}

impl<S: StatusSink> StatusReporter<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    pub async fn idle(&self) {
        self.push(IDLE_EMOJI, IDLE_TEXT.to_string()).await;
    }

    pub async fn playing(&self, kind: SourceKind, title: &str) {
        let text = format!("Streaming {}", truncate_title(title));
        self.push(kind_emoji(kind), text).await;
    }

    async fn push(&self, emoji: &str, text: String) {
        if let Err(e) = self.sink.publish(emoji, &text).await {
            warn!("Presence push failed (ignored): {e}");
        }
    }
}

fn kind_emoji(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::DirectVideo => "🎥",
        SourceKind::Hls => "🎦",
        SourceKind::Torrent | SourceKind::Catalog => "📺",
    }
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() <= TITLE_MAX_CHARS {
        return title.to_string();
    }
    let cut: String = title.chars().take(TITLE_MAX_CHARS).collect();
    format!("{cut}...")
}
