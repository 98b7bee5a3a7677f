//! Speech-squad orchestration server.
//!
//! Accepts one bidirectional stream per spoken question and fans it out to
//! the downstream speech services: audio is relayed to streaming
//! recognition, the committed transcript goes through natural-language
//! question answering against the supplied context paragraph, and the
//! extracted answer is synthesized back to the caller as streamed audio,
//! followed by a latency breakdown assembled from downstream metadata.

pub mod clients;
pub(crate) mod context;
pub mod pool;
pub mod resources;
pub mod service;
pub mod timing;

use thiserror::Error;

/// Server-side failures outside a live stream (startup, configuration).
/// In-stream failures travel as `tonic::Status`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub use pool::{ChannelLease, ChannelPool};
pub use resources::SquadResources;
pub use service::SpeechSquadServiceImpl;
