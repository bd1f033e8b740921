//! Core types for the livecast relay: configuration, logging, the error
//! taxonomy, domain models, the resolver seam, and the volume gain stage.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod resolver;
pub mod volume;

pub use config::Config;
pub use error::{Error, Result};
