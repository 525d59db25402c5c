//! Shared integration-test harness: a running `Service` wired to in-memory
//! mocks, driven only through its public `ServiceHandle` surface — exactly
//! the way an external HTTP/WebSocket layer would drive it in production.
//!
//! Grounded on `async-opcua`'s `tests/utils/mod.rs` + `tests/integration/*.rs`
//! split: one harness module, one file per scenario group.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use agentmux::config::Config;
use agentmux::creds::Credentials;
use agentmux::resource::HttpResponseSink;
use agentmux::service::{Service, ServiceHandle, ServiceNotification};
use agentmux::testing::{stub_reauthorizer, MockSocket, MockTransport, MockTransportFactory};
use agentmux::transport::{AgentTransport, TransportFactory};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub struct Harness {
    pub handle: ServiceHandle,
    pub primary: Rc<MockTransport>,
    pub factory: Rc<MockTransportFactory>,
    pub notifications: UnboundedReceiver<ServiceNotification>,
    run_task: JoinHandle<()>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let primary = MockTransport::new();
        let factory = MockTransportFactory::new();
        let (service, handle, notifications) = Service::new(
            config,
            Credentials::new("admin", None, "localhost"),
            primary.clone() as Rc<dyn AgentTransport>,
            factory.clone() as Rc<dyn TransportFactory>,
            stub_reauthorizer(),
        );
        let run_task = tokio::task::spawn_local(service.run());
        Self {
            handle,
            primary,
            factory,
            notifications,
            run_task,
        }
    }

    /// Give the background event loop enough turns (and a little real time)
    /// to drain whatever was just pushed in.
    pub async fn settle(&self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pub async fn dispose_and_wait(self) {
        self.handle.dispose();
        let _ = self.run_task.await;
    }
}

/// An `HttpResponseSink` that records every call for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub headers: RefCell<Option<(u16, bool)>>,
    pub chunks: RefCell<Vec<Vec<u8>>>,
    pub completed: RefCell<bool>,
    pub errored: RefCell<Option<u16>>,
    pub aborted: RefCell<bool>,
}

#[async_trait(?Send)]
impl HttpResponseSink for RecordingSink {
    async fn write_headers(&self, status: u16, cache_forever: bool) {
        *self.headers.borrow_mut() = Some((status, cache_forever));
    }
    async fn write_chunk(&self, bytes: &[u8]) {
        self.chunks.borrow_mut().push(bytes.to_vec());
    }
    async fn complete(&self) {
        *self.completed.borrow_mut() = true;
    }
    async fn error(&self, status: u16) {
        *self.errored.borrow_mut() = Some(status);
    }
    async fn abort(&self) {
        *self.aborted.borrow_mut() = true;
    }
}

/// Adapts a shared `Rc<RecordingSink>` to `Box<dyn HttpResponseSink>` so a
/// test can keep observing it after handing ownership to the service.
pub struct SinkHandle(pub Rc<RecordingSink>);

#[async_trait(?Send)]
impl HttpResponseSink for SinkHandle {
    async fn write_headers(&self, status: u16, cache_forever: bool) {
        self.0.write_headers(status, cache_forever).await;
    }
    async fn write_chunk(&self, bytes: &[u8]) {
        self.0.write_chunk(bytes).await;
    }
    async fn complete(&self) {
        self.0.complete().await;
    }
    async fn error(&self, status: u16) {
        self.0.error(status).await;
    }
    async fn abort(&self) {
        self.0.abort().await;
    }
}

pub fn open_frame(channel: &str, host: &str, user: Option<&str>, password: Option<&str>) -> Vec<u8> {
    agentmux::codec::encode_control_frame(&[
        agentmux::codec::field("command", Some("open")),
        agentmux::codec::field("channel", Some(channel)),
        agentmux::codec::field("host", Some(host)),
        agentmux::codec::field("user", user),
        agentmux::codec::field("password", password),
    ])
}

pub fn accept(harness: &Harness) -> Rc<MockSocket> {
    let socket = MockSocket::new();
    harness.handle.accept_socket(socket.clone() as Rc<dyn agentmux::socket::BrowserSocket>);
    socket
}
