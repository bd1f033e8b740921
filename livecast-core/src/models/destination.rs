use serde::{Deserialize, Serialize};

/// The logical endpoint a session streams into.
///
/// A server holds at most one live connection at a time; sessions are
/// keyed by `server_id`, and `channel_id` selects the channel within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub server_id: String,
    pub channel_id: String,
}

impl Destination {
    #[must_use]
    pub fn new(server_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server_id, self.channel_id)
    }
}
