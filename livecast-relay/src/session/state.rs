/// Session lifecycle states.
///
/// `Idle` is both the initial state and the rest state after every
/// completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing playing, nothing queued, no connection held.
    Idle,
    /// A request was promoted to current; join + pipeline start in
    /// flight.
    Connecting,
    /// The pipeline is streaming into the connection.
    Playing,
    /// Stop requested or pipeline ended; tearing down (grace delay,
    /// then connection teardown).
    Draining,
}

impl SessionState {
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// A session in these states holds a promoted current request.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !self.is_idle()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Playing => "playing",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}
