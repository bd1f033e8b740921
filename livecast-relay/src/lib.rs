//! Live media relay: connection lifecycle, transcoding pipeline
//! supervision, and the per-destination session state machine.
//!
//! The session manager owns everything stateful — what is playing, what
//! is queued, the transport connection and the transcoder subprocess —
//! and serializes all mutation through one event loop per destination
//! server. Resolvers, the chat surface and the presence sink stay
//! outside, behind the traits in [`livecast_core::resolver`],
//! [`transport`] and [`status`].

pub mod connection;
pub mod pipeline;
pub mod session;
pub mod status;
pub mod transport;

pub use session::{EnqueueOutcome, SessionHandle, SessionManager, SessionSnapshot};
pub use transport::{SendChannel, Transport, TransportEvent};
