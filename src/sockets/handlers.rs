//! Socket event handlers (C6): react to browser-side `open`, `message`,
//! `closing`, `close`, and `error` events, enforcing `closing`-state checks
//! before forwarding to a session.

use std::rc::Rc;

use log::{debug, error, info, warn};

use super::SocketRef;
use crate::codec;
use crate::error::CloseReason;
use crate::scope;
use crate::service::Service;
use crate::socket::{BrowserSocket, SocketEvent, SocketId, SocketState};

impl Service {
    pub(crate) fn on_socket_accepted(&mut self, connection: Rc<dyn BrowserSocket>) {
        let scope = self.scope_registry.next_scope();
        info!("socket accepted, scope {scope:?}");
        self.sockets.track(scope, connection);
        self.caller_begin();
    }

    pub(crate) async fn on_socket_event(&mut self, id: SocketId, event: SocketEvent) {
        match event {
            SocketEvent::Open => info!("socket {id} open"),
            SocketEvent::Message { bytes } => self.on_socket_message(id, &bytes).await,
            SocketEvent::Closing => self.on_socket_closing(id).await,
            SocketEvent::Close => self.on_socket_close(id).await,
            SocketEvent::Error(message) => self.on_socket_error(id, &message),
        }
    }

    async fn on_socket_message(&mut self, id: SocketId, bytes: &[u8]) {
        let Some(socket) = self.sockets.by_connection(id) else {
            error!("message from untracked socket {id}");
            return;
        };

        let Some((channel, payload)) = codec::parse_frame(bytes) else {
            warn!("malformed frame from socket {id}");
            self.inbound_protocol_error(&socket).await;
            return;
        };

        match channel {
            None => self.dispatch_inbound_command(&socket, payload).await,
            Some(local) => {
                if self.closing {
                    debug!("dropping message for {local:?}, service is closing");
                    return;
                }
                let scope = socket.borrow().scope.clone();
                let global = scope::add_scope(&scope, &local);
                let Some(session) = self.sessions.by_channel(&global) else {
                    warn!("message for unknown channel {global:?}, dropping");
                    return;
                };
                let (transport, sent_eof) = {
                    let s = session.borrow();
                    (s.transport.clone(), s.sent_eof.get())
                };
                if sent_eof {
                    warn!("dropping message for {global:?}, session has sent eof");
                    return;
                }
                let _ = transport.send_data(&global, payload).await;
            }
        }
    }

    /// Fires before `close`, while the session side can still be told to
    /// free per-channel state gracefully.
    async fn on_socket_closing(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.by_connection(id) else {
            return;
        };
        let scope = socket.borrow().scope.clone();
        let snapshot = self.sessions.channels_in_scope(&scope);
        for (channel, session) in snapshot {
            let transport = session.borrow().transport.clone();
            let local = scope::strip_scope(&channel).unwrap_or(&channel);
            let fields = [
                codec::field("command", Some("close")),
                codec::field("channel", Some(local)),
                codec::field("reason", Some(CloseReason::DISCONNECTED)),
            ];
            let _ = transport.send_control(&fields).await;
        }
    }

    async fn on_socket_close(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.by_connection(id) else {
            return;
        };
        self.sockets.destroy(&socket);
        self.caller_end();
    }

    fn on_socket_error(&self, id: SocketId, message: &str) {
        let lower = message.to_lowercase();
        if lower.contains("tls") && lower.contains("eof") {
            debug!("socket {id} error: {message}");
        } else {
            warn!("socket {id} error: {message}");
        }
    }

    /// §7: malformed inbound frame/command — tell the browser, then close it
    /// with a server-error status.
    pub(crate) async fn inbound_protocol_error(&self, socket: &SocketRef) {
        let connection = socket.borrow().connection.clone();
        let fields = [
            codec::field("command", Some("close")),
            codec::field("reason", Some(CloseReason::PROTOCOL_ERROR)),
        ];
        let frame = codec::encode_control_frame(&fields);
        let _ = connection.send(frame).await;
        connection.close(CloseReason::PROTOCOL_ERROR).await;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::config::Config;
    use crate::creds::Credentials;
    use crate::testing::{refusing_transport_factory, stub_reauthorizer, MockSocket, MockTransport};
    use crate::transport::AgentTransport;

    fn new_service() -> (Service, Rc<MockTransport>) {
        let primary = MockTransport::new();
        let (service, _handle, _notifications) = Service::new(
            Config::default(),
            Credentials::new("admin", None, "localhost"),
            primary.clone() as Rc<dyn AgentTransport>,
            refusing_transport_factory(),
            stub_reauthorizer(),
        );
        (service, primary)
    }

    #[tokio::test]
    async fn closing_broadcasts_disconnected_to_owned_channels() {
        let (mut service, primary) = new_service();
        let socket = MockSocket::new();
        let id = socket.id();
        service.on_socket_accepted(socket.clone() as Rc<dyn BrowserSocket>);
        let tracked = service.sockets.by_connection(id).unwrap();
        let scope = tracked.borrow().scope.clone();

        let session = service.sessions.by_transport(primary.id()).unwrap();
        service.sessions.add_channel(&session, format!("{scope}a"));

        service.on_socket_event(id, SocketEvent::Closing).await;

        let sent = primary.sent();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn close_destroys_socket_and_decrements_callers() {
        let (mut service, _primary) = new_service();
        let socket = MockSocket::new();
        let id = socket.id();
        service.on_socket_accepted(socket.clone() as Rc<dyn BrowserSocket>);
        assert_eq!(service.callers, 1);

        service.on_socket_event(id, SocketEvent::Close).await;
        assert!(service.sockets.by_connection(id).is_none());
        assert_eq!(service.callers, 0);
    }
}
