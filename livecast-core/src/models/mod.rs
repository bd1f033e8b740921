mod destination;
mod profile;
mod request;

pub use destination::Destination;
pub use profile::EncodeProfile;
pub use request::{ByteStream, Locator, PlaybackRequest, SourceKind};
