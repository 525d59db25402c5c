//! In-memory `AgentTransport`/`BrowserSocket` stand-ins used by this
//! crate's own test suite (both the `#[cfg(test)]` unit tests and the
//! `tests/` integration suite, which depends back on this crate with the
//! `test-util` feature enabled — the same self-dependency trick the teacher
//! crate uses for its `console-logging` feature in dev-dependencies).

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;

use crate::creds::{Challenge, Credentials, Password, Reauthorizer};
use crate::error::Error;
use crate::socket::{BrowserSocket, SocketId, SocketState};
use crate::transport::{AgentTransport, TransportFactory, TransportId};

/// Everything a [`MockTransport`] was asked to send, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SentToTransport {
    Control(Vec<(String, Option<Value>)>),
    Data { channel: String, payload: Vec<u8> },
    Close(String),
}

pub struct MockTransport {
    id: TransportId,
    sent: RefCell<Vec<SentToTransport>>,
    closed: RefCell<Option<String>>,
}

impl MockTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: TransportId::next(),
            sent: RefCell::new(Vec::new()),
            closed: RefCell::new(None),
        })
    }

    pub fn sent(&self) -> Vec<SentToTransport> {
        self.sent.borrow().clone()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }
}

#[async_trait(?Send)]
impl AgentTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    async fn send_control(&self, fields: &[(&str, Option<Value>)]) -> Result<(), Error> {
        self.sent.borrow_mut().push(SentToTransport::Control(
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ));
        Ok(())
    }

    async fn send_data(&self, channel: &str, payload: &[u8]) -> Result<(), Error> {
        self.sent.borrow_mut().push(SentToTransport::Data {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self, reason: &str) {
        *self.closed.borrow_mut() = Some(reason.to_string());
    }
}

pub struct MockSocket {
    id: SocketId,
    state: RefCell<SocketState>,
    sent: RefCell<Vec<Vec<u8>>>,
    closed: RefCell<Option<String>>,
}

impl MockSocket {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: SocketId::next(),
            state: RefCell::new(SocketState::Open),
            sent: RefCell::new(Vec::new()),
            closed: RefCell::new(None),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }

    pub fn sent_strings(&self) -> Vec<String> {
        self.sent
            .borrow()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .collect()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    pub fn set_state(&self, state: SocketState) {
        *self.state.borrow_mut() = state;
    }
}

#[async_trait(?Send)]
impl BrowserSocket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.sent.borrow_mut().push(bytes);
        Ok(())
    }

    async fn close(&self, reason: &str) {
        *self.state.borrow_mut() = SocketState::Closed;
        *self.closed.borrow_mut() = Some(reason.to_string());
    }
}

/// A [`TransportFactory`] that mints a fresh [`MockTransport`] per call,
/// recording every `(host, port_override)` pair it was asked to open.
pub struct MockTransportFactory {
    opened: RefCell<Vec<(String, Option<u16>)>>,
    transports: RefCell<Vec<Rc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            opened: RefCell::new(Vec::new()),
            transports: RefCell::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<(String, Option<u16>)> {
        self.opened.borrow().clone()
    }

    /// Every concrete [`MockTransport`] this factory has ever minted, in
    /// open order, so integration tests can simulate events arriving on a
    /// specific opened transport.
    pub fn transports(&self) -> Vec<Rc<MockTransport>> {
        self.transports.borrow().clone()
    }
}

#[async_trait(?Send)]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        host: &str,
        port_override: Option<u16>,
        _creds: &Credentials,
        _host_key: Option<&str>,
    ) -> Result<Rc<dyn AgentTransport>, Error> {
        self.opened.borrow_mut().push((host.to_string(), port_override));
        let transport = MockTransport::new();
        self.transports.borrow_mut().push(transport.clone());
        Ok(transport as Rc<dyn AgentTransport>)
    }
}

/// A [`TransportFactory`] that always fails to open, for tests whose service
/// never needs to open a second session.
pub struct RefusingTransportFactory;

pub fn refusing_transport_factory() -> Rc<dyn TransportFactory> {
    Rc::new(RefusingTransportFactory)
}

#[async_trait(?Send)]
impl TransportFactory for RefusingTransportFactory {
    async fn open(
        &self,
        _host: &str,
        _port_override: Option<u16>,
        _creds: &Credentials,
        _host_key: Option<&str>,
    ) -> Result<Rc<dyn AgentTransport>, Error> {
        Err(Error::Io("no transport available in this test".into()))
    }
}

/// A [`Reauthorizer`] stub: challenges are the literal string
/// `"<kind>:<user>"`, and the crypt1 response is always `"<password>-signed"`.
pub struct StubReauthorizer;

pub fn stub_reauthorizer() -> Rc<dyn Reauthorizer> {
    Rc::new(StubReauthorizer)
}

impl Reauthorizer for StubReauthorizer {
    fn extract(&self, challenge: &str) -> Option<Challenge> {
        let (kind, user) = challenge.split_once(':')?;
        Some(Challenge {
            kind: kind.to_string(),
            user: user.to_string(),
        })
    }

    fn crypt1_response(&self, _challenge: &str, password: &Password) -> Option<String> {
        Some(format!("{}-signed", password.get()))
    }
}
