//! Error types for the pipeline client
//!
//! Only `ClientError::Unreachable` is fatal for a benchmark worker. Timeouts and
//! service failures never surface here; they travel through continuations as
//! [`crate::protocol::Outcome`] values.

/// Errors raised by the async client and its transports
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Service '{service}' unreachable at {address}: {reason}")]
    Unreachable {
        service: String,
        address: String,
        reason: String,
    },

    #[error("Client has not been started")]
    NotStarted,

    #[error("Unknown service: {service}")]
    UnknownService { service: String },

    #[error("Connection to {peer} is closed")]
    ConnectionClosed { peer: String },

    #[error("Request id {id} is already outstanding")]
    DuplicateRequestId { id: u64 },
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
