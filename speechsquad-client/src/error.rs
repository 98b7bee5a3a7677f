//! Client error taxonomy.
//!
//! Dataset and warm-up failures abort the process; per-stream failures are
//! recorded on the task and counted by the reaper.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("unknown: {0}")]
    Unknown(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::InvalidArgument => Self::InvalidArg(message),
            tonic::Code::Unavailable => Self::Unavailable(message),
            tonic::Code::Unimplemented => Self::Unsupported(message),
            tonic::Code::AlreadyExists => Self::AlreadyExists(message),
            tonic::Code::Internal => Self::Internal(message),
            _ => Self::Unknown(message),
        }
    }
}
