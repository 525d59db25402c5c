//! The top-level `Service`/`ServiceHandle` pair (C3–C9's owner), grounded on
//! the teacher crate's `Server`/`ServerHandle` split: `Service` is consumed
//! by its own event loop, `ServiceHandle` is the cheap handle callers keep
//! around to push events in and to request shutdown.
//!
//! Unlike the teacher (a multi-threaded tokio server synchronizing a shared
//! `Arc<RwLock<SessionManager>>`), this engine is single-threaded per spec
//! §5: `Service` owns its index tables outright, runs on a
//! `tokio::task::LocalSet`, and every other task (socket readers, transport
//! readers, HTTP handlers) only ever *pushes events in* — it never reaches
//! into the tables itself. That is why `AgentTransport`/`BrowserSocket` are
//! `?Send` traits and why the index maps use `Rc<RefCell<_>>` instead of
//! `Arc<RwLock<_>>`.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::creds::{Credentials, Reauthorizer};
use crate::error::{CloseReason, Error};
use crate::resource::{ResourceRequest, ResourceResponse};
use crate::scope::ScopeRegistry;
use crate::session::manager::SessionTable;
use crate::session::SessionRef;
use crate::socket::{BrowserSocket, SocketEvent, SocketId};
use crate::sockets::manager::SocketTable;
use crate::sockets::SocketRef;
use crate::transport::{AgentTransport, TransportEvent, TransportFactory, TransportId};

/// Inbound events, funneled through one queue per spec §9's design note
/// ("replace the signal/object framework... with message types on
/// per-session/per-socket inboxes").
pub enum ServiceEvent {
    SocketAccepted(Rc<dyn BrowserSocket>),
    Socket(SocketId, SocketEvent),
    Transport(TransportId, TransportEvent),
    Resource(ResourceRequest),
    ListModules {
        host: String,
        reply: oneshot::Sender<Result<HashMap<String, Value>, Error>>,
    },
    PingTick,
    Dispose,
}

/// Outbound lifecycle notifications a caller can subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceNotification {
    /// `callers` transitioned to (`true`) or away from (`false`) zero.
    Idling(bool),
    /// The service has fully torn itself down.
    Destroy,
}

/// A cheap, `Clone`-able handle used to push events into the running
/// service and to query/request its shutdown.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceEvent>,
}

impl ServiceHandle {
    pub fn accept_socket(&self, connection: Rc<dyn BrowserSocket>) {
        let _ = self.tx.send(ServiceEvent::SocketAccepted(connection));
    }

    pub fn socket_event(&self, id: SocketId, event: SocketEvent) {
        let _ = self.tx.send(ServiceEvent::Socket(id, event));
    }

    pub fn transport_event(&self, id: TransportId, event: TransportEvent) {
        let _ = self.tx.send(ServiceEvent::Transport(id, event));
    }

    pub fn resource_request(&self, request: ResourceRequest) {
        let _ = self.tx.send(ServiceEvent::Resource(request));
    }

    pub async fn list_modules(&self, host: String) -> Result<HashMap<String, Value>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServiceEvent::ListModules { host, reply })
            .map_err(|_| Error::Closing)?;
        rx.await.map_err(|_| Error::Closing)?
    }

    pub fn dispose(&self) {
        let _ = self.tx.send(ServiceEvent::Dispose);
    }
}

pub struct Service {
    pub(crate) config: Rc<Config>,
    pub(crate) creds: Credentials,
    pub(crate) sessions: SessionTable,
    pub(crate) sockets: SocketTable,
    pub(crate) scope_registry: ScopeRegistry,
    pub(crate) closing: bool,
    pub(crate) callers: u64,
    pub(crate) next_resource_id: u64,
    pub(crate) resources: HashMap<(TransportId, String), ResourceResponse>,
    pub(crate) pending_module_listings:
        HashMap<(TransportId, String), oneshot::Sender<Result<HashMap<String, Value>, Error>>>,
    pub(crate) transport_factory: Rc<dyn TransportFactory>,
    pub(crate) reauthorizer: Rc<dyn Reauthorizer>,
    pub(crate) notifications: mpsc::UnboundedSender<ServiceNotification>,
    events_rx: mpsc::UnboundedReceiver<ServiceEvent>,
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    disposed: bool,
}

impl Service {
    /// Construct a service with its primary session already attached (the
    /// one whose loss tears the whole service down), per spec §3's Service
    /// lifecycle note.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        creds: Credentials,
        primary_transport: Rc<dyn AgentTransport>,
        transport_factory: Rc<dyn TransportFactory>,
        reauthorizer: Rc<dyn Reauthorizer>,
    ) -> (Self, ServiceHandle, mpsc::UnboundedReceiver<ServiceNotification>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        let mut sessions = SessionTable::new();
        sessions.track(
            "localhost".to_string(),
            true,
            false,
            creds.clone(),
            primary_transport,
        );

        let service = Self {
            config: Rc::new(config),
            creds,
            sessions,
            sockets: SocketTable::new(),
            scope_registry: ScopeRegistry::new(),
            closing: false,
            callers: 0,
            next_resource_id: 1,
            resources: HashMap::new(),
            pending_module_listings: HashMap::new(),
            transport_factory,
            reauthorizer,
            notifications,
            events_tx: events_tx.clone(),
            events_rx,
            disposed: false,
        };
        let handle = ServiceHandle { tx: events_tx };
        (service, handle, notification_rx)
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Resolve or open a non-private-sharing session for `host`, per spec
    /// §4.3's `lookup_or_open`.
    pub(crate) async fn lookup_or_open(
        &mut self,
        host: &str,
        host_key: Option<&str>,
        creds: Credentials,
        private: bool,
    ) -> Result<SessionRef, Error> {
        let host = if host.is_empty() { "localhost" } else { host };

        if !private {
            if let Some(existing) = self.sessions.by_host(host) {
                return Ok(existing);
            }
        }

        let normalized_host = if host == "localhost" {
            match self.config.ssh_port_override {
                Some(_) => "127.0.0.1",
                None => host,
            }
        } else {
            host
        };

        let transport = self
            .transport_factory
            .open(normalized_host, self.config.ssh_port_override, &creds, host_key)
            .await?;

        Ok(self
            .sessions
            .track(host.to_string(), false, private, creds, transport))
    }

    /// Increment the caller count on each accepted socket, per spec §4.9.
    pub(crate) fn caller_begin(&mut self) {
        self.callers += 1;
        if self.callers == 1 {
            let _ = self.notifications.send(ServiceNotification::Idling(false));
        }
    }

    /// Decrement the caller count on each socket destruction.
    pub(crate) fn caller_end(&mut self) {
        self.callers = self.callers.saturating_sub(1);
        if self.callers == 0 {
            let _ = self.notifications.send(ServiceNotification::Idling(true));
        }
    }

    pub fn get_idling(&self) -> bool {
        self.callers == 0
    }

    /// Tear the whole service down: close every socket with `going-away`,
    /// send EOF on every session's transport, then emit `destroy`. Per spec
    /// §3's Service lifecycle and §7 ("only the primary session's loss
    /// tears the service down").
    pub(crate) async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.closing = true;

        let sockets: Vec<SocketRef> = self.sockets.iter().cloned().collect();
        for socket in &sockets {
            let connection = socket.borrow().connection.clone();
            connection.close(CloseReason::GOING_AWAY).await;
        }

        let sessions: Vec<SessionRef> = self.sessions.iter().cloned().collect();
        for session in &sessions {
            let (transport, already_eof) = {
                let s = session.borrow();
                (s.transport.clone(), s.sent_eof.get())
            };
            if !already_eof {
                session.borrow().sent_eof.set(true);
                transport.close(CloseReason::TERMINATED).await;
            }
        }

        info!("service disposed");
        let _ = self.notifications.send(ServiceNotification::Destroy);
    }

    /// Drive the service's single event loop until disposed. Grounded on
    /// `Server::run_with`'s `tokio::select!` loop, minus the
    /// connection-accept branch (accepting sockets/transports happens
    /// externally and is pushed in via [`ServiceHandle`]).
    pub async fn run(mut self) {
        let mut ping_tick = tokio::time::interval(self.config.ping_interval());
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.disposed {
                break;
            }

            let idle_deadline = self.sessions.next_idle_deadline();
            let idle_sleep = async {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = ping_tick.tick() => {
                    self.broadcast_ping().await;
                }
                _ = idle_sleep => {
                    self.expire_idle_sessions(Instant::now()).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::SocketAccepted(connection) => self.on_socket_accepted(connection),
            ServiceEvent::Socket(id, event) => self.on_socket_event(id, event).await,
            ServiceEvent::Transport(id, event) => self.on_transport_event(id, event).await,
            ServiceEvent::Resource(request) => self.handle_resource_request(request).await,
            ServiceEvent::ListModules { host, reply } => self.list_modules(&host, reply).await,
            ServiceEvent::PingTick => self.broadcast_ping().await,
            ServiceEvent::Dispose => self.dispose().await,
        }
    }

    async fn expire_idle_sessions(&mut self, now: Instant) {
        let expired = self.sessions.expire_idle(now);
        for session in expired {
            if session.borrow().channels.is_empty() {
                let transport = session.borrow().transport.clone();
                warn!("session idle timeout expired, closing transport");
                transport.close(CloseReason::TIMEOUT).await;
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if !self.disposed {
            error!("service dropped without a clean dispose");
        }
    }
}
