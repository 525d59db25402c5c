//! Error and close-reason types used at the seams between the multiplexing
//! core and its external collaborators (transport, socket, HTTP, auth).

use std::fmt;

/// Errors produced by the core itself, as opposed to errors reported by an
/// external transport or socket implementation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame or command payload could not be decoded.
    #[error("malformed frame or command")]
    MalformedFrame,
    /// An agent referenced a channel it does not own, or a channel that
    /// does not exist.
    #[error("unknown or unauthorized channel {0:?}")]
    UnknownChannel(String),
    /// A control command without a channel used an unrecognized command
    /// name, or used one that requires a channel.
    #[error("invalid control command {0:?}")]
    InvalidCommand(String),
    /// The service is shutting down and will not open new channels.
    #[error("service is closing")]
    Closing,
    /// A requested resource could not be found.
    #[error("resource not found")]
    ResourceNotFound,
    /// A resource fetch failed for a reason other than not-found.
    #[error("resource fetch failed: {0}")]
    ResourceFailed(String),
    /// The underlying transport or socket reported an I/O failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// The wire-level reason string sent in a `close` control frame, or used to
/// close the underlying transport/socket. Kept as a thin newtype so call
/// sites never hand-type the same literal twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason(pub String);

impl CloseReason {
    pub const PROTOCOL_ERROR: &'static str = "protocol-error";
    pub const TIMEOUT: &'static str = "timeout";
    pub const DISCONNECTED: &'static str = "disconnected";
    pub const TERMINATED: &'static str = "terminated";
    pub const GOING_AWAY: &'static str = "going-away";
    pub const NOT_FOUND: &'static str = "not-found";

    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CloseReason {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CloseReason {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
