//! The agent transport seam: an outbound conduit (typically a secure
//! remote-shell session) multiplexing channels to one agent process.
//!
//! Grounded on `transport::connect::Connector`, generalized from "connect
//! and yield a `TcpTransport`" to "a long-lived handle the core can send
//! frames on, that feeds [`TransportEvent`]s back into the service's single
//! event queue".

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::creds::Credentials;
use crate::error::Error;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a live [`AgentTransport`], minted once per transport
/// and used as the key for `sessions.by_transport` and to check "does this
/// channel belong to the transport this event arrived on".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Events an [`AgentTransport`] implementation reports back to the service,
/// corresponding to the `control`/`recv`/`closed` signals of spec §4.5.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A control frame: `command`, the transport-global `channel` if any,
    /// and the full decoded JSON object.
    Control {
        command: String,
        channel: Option<String>,
        options: Map<String, Value>,
    },
    /// A data frame on `channel` (transport-global).
    Recv { channel: String, payload: Vec<u8> },
    /// The transport closed or failed. `problem` is the close reason, e.g.
    /// `"unknown-hostkey"` or `"terminated"`.
    Closed { problem: Option<String> },
}

/// A live conduit to one agent process. Implementations typically wrap a
/// secure remote-shell session multiplexing several logical channels; unit
/// tests use an in-memory stand-in (see [`crate::testing`]).
///
/// Uses `?Send` futures: every trait object here is owned and driven from
/// the single local task that runs the service's event loop (spec §5), so
/// there is no need to pay for `Send`/`Sync` bounds that single-threaded
/// implementations (including the mocks) would otherwise have to satisfy.
#[async_trait(?Send)]
pub trait AgentTransport {
    fn id(&self) -> TransportId;

    /// Send a control frame (empty channel header) to the agent.
    async fn send_control(&self, fields: &[(&str, Option<Value>)]) -> Result<(), Error>;

    /// Send a data frame on `channel` (transport-global).
    async fn send_data(&self, channel: &str, payload: &[u8]) -> Result<(), Error>;

    /// Close the transport, reporting `reason` to whatever is on the other
    /// end (and eventually surfacing as this transport's `Closed` event).
    async fn close(&self, reason: &str);

    /// Host key / fingerprint captured from an `"unknown-hostkey"` close,
    /// if this transport type supports it.
    fn host_key(&self) -> Option<(String, String)> {
        None
    }
}

/// Opens new [`AgentTransport`]s on demand, standing in for the remote-shell
/// session helper. Generalizes `transport::connect::Connector`, which
/// established one concrete `TcpTransport` per accepted socket, into "mint a
/// transport for a given host + credentials", since here one transport may
/// end up shared by several sockets (see `SessionTable::lookup_or_open`).
#[async_trait(?Send)]
pub trait TransportFactory {
    async fn open(
        &self,
        host: &str,
        port_override: Option<u16>,
        creds: &Credentials,
        host_key: Option<&str>,
    ) -> Result<Rc<dyn AgentTransport>, Error>;
}
