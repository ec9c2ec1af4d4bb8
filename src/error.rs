//! Error taxonomy for the obs-websocket client.
//!
//! Errors fall into three groups:
//!
//! - **Session-fatal**: [`ObsError::Connection`], the authentication errors,
//!   and [`ObsError::HandshakeTimeout`]. The transport is torn down.
//! - **Per-request**: [`ObsError::RequestTimedOut`], [`ObsError::Remote`],
//!   [`ObsError::NotReady`], [`ObsError::ConnectionClosed`]. Only the caller
//!   that issued the request sees them.
//! - **Per-frame**: [`ObsError::MalformedMessage`]. The frame is dropped and
//!   the session carries on.

use std::time::Duration;

/// Close code obs-websocket uses when the Identify authentication is wrong.
pub const CLOSE_CODE_AUTHENTICATION_FAILED: u16 = 4009;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ObsError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("server requires authentication but no password is configured")]
    AuthenticationRequired,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("not connected or identified with the OBS WebSocket server")]
    NotReady,

    #[error("request {request_type} timed out after {}ms", .timeout.as_millis())]
    RequestTimedOut {
        request_type: String,
        timeout: Duration,
    },

    #[error("request {request_type} failed: {code}{}", .comment.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    Remote {
        request_type: String,
        code: i64,
        comment: Option<String>,
    },

    #[error("WebSocket connection closed")]
    ConnectionClosed,
}

impl ObsError {
    /// Whether this error ends the session (as opposed to a single request or frame).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::AuthenticationRequired
                | Self::AuthenticationFailed(_)
                | Self::HandshakeTimeout(_)
        )
    }
}
