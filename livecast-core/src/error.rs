use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Catalog/source lookup failed. Surfaced to the caller; never
    /// changes session state.
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Join or send-pipe creation failed or timed out. Aborts an
    /// in-flight connect; the failing request is dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transcoder exited abnormally. Queue continuation behaves like a
    /// normal end; `detail` carries the process diagnostics.
    #[error("Pipeline error: {detail}")]
    Pipeline { detail: String },

    /// Enqueue rejected: the session is bound to a different channel.
    #[error("Busy: already streaming to channel {0}")]
    Busy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error terminates only the request, leaving the
    /// session free to continue its queue.
    #[must_use]
    pub const fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::Resolve(_) | Self::Connection(_) | Self::Pipeline { .. } | Self::Busy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
