//! Error types for the signaling relay

use crate::protocol::{CallId, PeerId};
use thiserror::Error;

/// Errors that can occur while relaying signaling traffic
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Failed to queue a message for a peer
    #[error("Failed to send message to {peer}: {reason}")]
    SendError {
        /// Intended recipient
        peer: PeerId,
        /// Why the outbound queue refused the message
        reason: &'static str,
    },

    /// A room with this call id already exists
    #[error("Call {0} already has a room")]
    DuplicateCall(CallId),
}

/// Errors from client requests
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported frame type
    #[error("Unsupported message type")]
    UnsupportedType,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),
}
