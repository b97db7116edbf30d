//! Session-level error taxonomy.
//!
//! Fatal categories drive the session controller through a full teardown
//! before the error surfaces; recoverable ones (codec drops) never change
//! session state.

use crate::codec::CodecError;
use crate::device::DeviceError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Microphone access was refused. Fatal to `start()`, surfaced once.
    #[error("device permission denied: {0}")]
    PermissionDenied(String),

    /// A capture stream ended unexpectedly mid-session. Fatal; a retry is a
    /// fresh `start()`.
    #[error("capture device lost: {0}")]
    DeviceLost(String),

    /// The remote session could not be opened.
    #[error("failed to open remote session: {0}")]
    RemoteConnect(String),

    /// The remote session reported a failure mid-stream.
    #[error("remote session error: {0}")]
    RemoteSession(String),

    /// Malformed frame. Recoverable: callers drop the frame and continue.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A session is already active on the owned devices.
    #[error("a live session is already active")]
    SchedulingConflict,

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
