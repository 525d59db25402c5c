//! The browser socket seam: a framed full-duplex connection multiplexing
//! several channels from one browser session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a live [`BrowserSocket`] connection, used as the key
/// for `sockets.by_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Readiness state of a browser connection, mirroring the states a framed
/// socket exposes: `OPEN` is the only state in which a send is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    Closed,
}

/// Events a [`BrowserSocket`] implementation reports back to the service,
/// corresponding to spec §4.6's `open`/`message`/`closing`/`close`/`error`.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open,
    Message { bytes: Bytes },
    /// Fired before `Close`, while channels can still be torn down
    /// gracefully.
    Closing,
    Close,
    Error(String),
}

/// A live browser connection. Implementations typically wrap a WebSocket
/// handshake negotiated with subprotocol `agentmux1`; unit tests use an
/// in-memory stand-in (see [`crate::testing`]).
///
/// `?Send`: see [`crate::transport::AgentTransport`] for why.
#[async_trait(?Send)]
pub trait BrowserSocket {
    fn id(&self) -> SocketId;

    fn state(&self) -> SocketState;

    /// Send one TEXT frame (a full `channel-or-blank LF payload` envelope).
    async fn send(&self, bytes: Vec<u8>) -> Result<(), Error>;

    /// Close the connection with the given status reason (e.g.
    /// `"going-away"`, `"protocol-error"`).
    async fn close(&self, reason: &str);
}
