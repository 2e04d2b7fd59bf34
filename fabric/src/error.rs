//! # Error Types
//!
//! Error enums for the fabric core. The philosophy follows the rest of the
//! crate: recoverable failures never surface as `Err` from the public node
//! API. A malformed frame is logged and dropped, an unknown peer reads like
//! a timeout, a refused expression becomes `"NULL"`. The only operations
//! that return `Result` are the ones where the caller genuinely has to act:
//! transport construction at `enter()` and the codec used by handlers.

use thiserror::Error;

/// Failures of the gossip transport layer.
///
/// Construction failures are fatal to the node session: the node marks
/// itself "not entered" and requires an explicit re-`enter()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Unable to create or bind the transport endpoint.
    #[error("failed to construct transport: {0}")]
    Construct(String),
    /// The transport endpoint has shut down or the event stream closed.
    #[error("transport is closed")]
    Closed,
    /// A send toward a peer or group failed at the transport level.
    #[error("transport send failed: {0}")]
    Send(String),
}

/// Failures while decoding a framed wire payload.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The payload ended in the middle of a frame or length prefix.
    #[error("unexpected end of payload")]
    Truncated,
    /// A string frame did not contain valid UTF-8.
    #[error("frame is not valid utf-8")]
    Utf8,
}

/// Top-level error for node lifecycle operations.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The transport could not be constructed or started.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// `enter()` was called while a session is already live.
    #[error("node has already entered the fabric")]
    AlreadyEntered,
    /// A lifecycle operation was invoked from inside a dispatched command
    /// handler. The actor cannot be torn down from its own delivery path.
    #[error("lifecycle operation invoked from a command handler")]
    Reentrant,
    /// The actor thread did not acknowledge startup.
    #[error("actor failed to signal ready")]
    ActorStartup,
}
