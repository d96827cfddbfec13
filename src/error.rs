use thiserror::Error;

/// Failures surfaced by the stream client.
///
/// Only `connect()` ever returns these to a caller; everything that happens
/// after the first attempt is reported through the status channel instead.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handler for '{message_type}' failed: {reason}")]
    Handler {
        message_type: String,
        reason: String,
    },

    #[error("connection attempt superseded before it opened")]
    Superseded,

    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("trade listing failed: {0}")]
    Listing(String),
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
