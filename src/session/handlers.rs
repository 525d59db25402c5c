//! Session event handlers (C5): react to agent-side `control`, `recv`, and
//! `closed` events, enforcing the cross-socket isolation invariant before
//! forwarding anything to a browser socket.

use log::{error, warn};
use serde_json::{Map, Value};

use super::SessionRef;
use crate::codec;
use crate::error::CloseReason;
use crate::scope;
use crate::service::Service;
use crate::socket::SocketState;
use crate::transport::{TransportEvent, TransportId};

impl Service {
    pub(crate) async fn on_transport_event(&mut self, transport_id: TransportId, event: TransportEvent) {
        match event {
            TransportEvent::Control {
                command,
                channel,
                options,
            } => self.on_session_control(transport_id, command, channel, options).await,
            TransportEvent::Recv { channel, payload } => {
                self.on_session_recv(transport_id, channel, payload).await;
            }
            TransportEvent::Closed { problem } => self.on_session_closed(transport_id, problem).await,
        }
    }

    async fn on_session_control(
        &mut self,
        transport_id: TransportId,
        command: String,
        channel: Option<String>,
        options: Map<String, Value>,
    ) {
        match channel {
            None => self.on_session_control_no_channel(transport_id, command, options).await,
            Some(channel) => {
                self.on_session_control_with_channel(transport_id, command, channel, options)
                    .await;
            }
        }
    }

    async fn on_session_control_no_channel(
        &mut self,
        transport_id: TransportId,
        command: String,
        options: Map<String, Value>,
    ) {
        let Some(session) = self.sessions.by_transport(transport_id) else {
            error!("control from transport {transport_id} with no tracked session");
            self.close_transport_protocol_error(transport_id).await;
            return;
        };

        match command.as_str() {
            "authorize" => self.authorize(&session, options).await,
            "ping" => {}
            other => warn!("invalid session-wide control command {other:?}"),
        }
    }

    async fn on_session_control_with_channel(
        &mut self,
        transport_id: TransportId,
        command: String,
        channel: String,
        options: Map<String, Value>,
    ) {
        let Some(session) = self.sessions.by_channel(&channel) else {
            warn!("control for unknown channel {channel:?}");
            self.close_transport_protocol_error(transport_id).await;
            return;
        };
        if session.borrow().transport.id() != transport_id {
            warn!("transport claimed a channel it does not own: {channel:?}");
            self.close_transport_protocol_error(transport_id).await;
            return;
        }

        if command == "close" {
            if let Some(Value::Object(resources)) = options.get("resources").cloned() {
                process_resources(&session, &resources);
            }

            if let Some(reply) = self.pending_module_listings.remove(&(transport_id, channel.clone())) {
                let modules: std::collections::HashMap<String, Value> = options
                    .get("resources")
                    .and_then(Value::as_object)
                    .cloned()
                    .map(|obj| obj.into_iter().collect())
                    .unwrap_or_default();
                let _ = reply.send(Ok(modules));
                let idle_timeout = self.config.agent_idle_timeout();
                self.sessions
                    .remove_channel(&session, &channel, idle_timeout, std::time::Instant::now());
                return;
            }

            let reason = options.get("reason").and_then(Value::as_str);
            if self.finish_resource_if_pending(transport_id, &channel, reason).await {
                let idle_timeout = self.config.agent_idle_timeout();
                self.sessions
                    .remove_channel(&session, &channel, idle_timeout, std::time::Instant::now());
                return;
            }

            let idle_timeout = self.config.agent_idle_timeout();
            self.sessions
                .remove_channel(&session, &channel, idle_timeout, std::time::Instant::now());
        }

        self.forward_session_control_to_socket(&channel, &command, options).await;
    }

    /// §4.5.1: an agent asking the service to re-prove the user's identity.
    async fn authorize(&self, session: &SessionRef, options: Map<String, Value>) {
        let (Some(challenge), Some(cookie)) = (
            options.get("challenge").and_then(Value::as_str),
            options.get("cookie").and_then(Value::as_str),
        ) else {
            warn!("authorize control missing challenge or cookie");
            return;
        };

        let Some(parsed) = self.reauthorizer.extract(challenge) else {
            warn!("could not parse authorize challenge");
            return;
        };

        let session_user = session.borrow().creds.user().to_string();
        if parsed.user != session_user {
            warn!(
                "authorize challenge issued for {:?}, session belongs to {:?}, dropping",
                parsed.user, session_user
            );
            return;
        }

        let response = if parsed.kind == "crypt1" {
            let creds = session.borrow().creds.clone();
            creds
                .password()
                .and_then(|password| self.reauthorizer.crypt1_response(challenge, password))
        } else {
            None
        };

        if session.borrow().sent_eof.get() {
            return;
        }

        let transport = session.borrow().transport.clone();
        let fields = [
            codec::field("command", Some("authorize")),
            codec::field("cookie", Some(cookie)),
            codec::field("response", Some(response.as_deref().unwrap_or(""))),
        ];
        let _ = transport.send_control(&fields).await;
    }

    async fn on_session_recv(&mut self, transport_id: TransportId, channel: String, payload: Vec<u8>) {
        let Some(session) = self.sessions.by_channel(&channel) else {
            warn!("recv on unknown channel {channel:?}");
            self.close_transport_protocol_error(transport_id).await;
            return;
        };
        if session.borrow().transport.id() != transport_id {
            warn!("transport sent data for a channel it does not own: {channel:?}");
            self.close_transport_protocol_error(transport_id).await;
            return;
        }

        if self.handle_resource_recv(transport_id, &channel, &payload).await {
            return;
        }

        let Some(socket) = self.sockets.scope_lookup(&channel) else {
            return;
        };
        let connection = socket.borrow().connection.clone();
        if connection.state() != SocketState::Open {
            return;
        }
        let local = scope::strip_scope(&channel).unwrap_or(&channel);
        let frame = codec::encode_data_frame(local, &payload);
        let _ = connection.send(frame).await;
    }

    async fn on_session_closed(&mut self, transport_id: TransportId, problem: Option<String>) {
        let Some(session) = self.sessions.by_transport(transport_id) else {
            return;
        };

        if problem.as_deref() == Some("unknown-hostkey") {
            if let Some(host_key) = session.borrow().transport.host_key() {
                *session.borrow().host_key.borrow_mut() = Some(host_key);
            }
        }

        self.finish_all_resources_for_transport(transport_id, problem.as_deref().unwrap_or("terminated"))
            .await;

        let channels: Vec<String> = session.borrow().channels.iter().cloned().collect();
        let host_key = session.borrow().host_key.borrow().clone();
        for channel in channels {
            let Some(socket) = self.sockets.scope_lookup(&channel) else {
                continue;
            };
            let connection = socket.borrow().connection.clone();
            if connection.state() != SocketState::Open {
                continue;
            }
            let local = scope::strip_scope(&channel).unwrap_or(&channel);
            let fields = [
                codec::field("command", Some("close")),
                codec::field("channel", Some(local)),
                codec::field("reason", problem.as_deref()),
                codec::field("host-key", host_key.as_ref().map(|(key, _)| key.as_str())),
                codec::field(
                    "host-fingerprint",
                    host_key.as_ref().map(|(_, fingerprint)| fingerprint.as_str()),
                ),
            ];
            let frame = codec::encode_control_frame(&fields);
            let _ = connection.send(frame).await;
        }

        let primary = session.borrow().primary;
        self.sessions.destroy(&session);

        if primary {
            self.dispose().await;
        }
    }

    pub(crate) async fn close_transport_protocol_error(&mut self, transport_id: TransportId) {
        if let Some(session) = self.sessions.by_transport(transport_id) {
            let transport = session.borrow().transport.clone();
            transport.close(CloseReason::PROTOCOL_ERROR).await;
        }
    }

    pub(crate) async fn forward_session_control_to_socket(&self, channel: &str, command: &str, mut options: Map<String, Value>) {
        let Some(socket) = self.sockets.scope_lookup(channel) else {
            return;
        };
        let connection = socket.borrow().connection.clone();
        if connection.state() != SocketState::Open {
            return;
        }
        let local = scope::strip_scope(channel).unwrap_or(channel);
        options.insert("command".to_string(), Value::String(command.to_string()));
        options.insert("channel".to_string(), Value::String(local.to_string()));
        let payload = serde_json::to_vec(&Value::Object(options)).expect("control payload serialization cannot fail");
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(b'\n');
        frame.extend_from_slice(&payload);
        let _ = connection.send(frame).await;
    }
}

/// §4.5.2: repopulate a session's checksum table from a `close` control's
/// `resources` object, clearing it first.
fn process_resources(session: &SessionRef, resources: &Map<String, Value>) {
    let session_ref = session.borrow();
    let mut checksums = session_ref.checksums.borrow_mut();
    checksums.clear();
    for (module, details) in resources {
        if let Some(checksum) = details.get("checksum").and_then(Value::as_str) {
            checksums.insert(checksum.to_string(), module.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::config::Config;
    use crate::creds::Credentials;
    use crate::testing::{MockSocket, MockTransport};
    use crate::transport::AgentTransport;

    fn new_service() -> (Service, Rc<MockTransport>) {
        let primary = MockTransport::new();
        let (service, _handle, _notifications) = Service::new(
            Config::default(),
            Credentials::new("admin", None, "localhost"),
            primary.clone() as Rc<dyn AgentTransport>,
            crate::testing::refusing_transport_factory(),
            crate::testing::stub_reauthorizer(),
        );
        (service, primary)
    }

    #[tokio::test]
    async fn channel_close_forwards_and_removes_channel() {
        let (mut service, primary) = new_service();
        let session = service.sessions.by_transport(primary.id()).unwrap();
        service.sessions.add_channel(&session, "1:a".into());

        let socket = MockSocket::new();
        service.sockets.track("1:".into(), socket.clone() as Rc<dyn crate::socket::BrowserSocket>);

        let mut options = Map::new();
        options.insert("channel".into(), Value::String("1:a".into()));
        service
            .on_session_control_with_channel(primary.id(), "close".into(), "1:a".into(), options)
            .await;

        assert!(service.sessions.by_channel("1:a").is_none());
        assert!(socket.sent_strings()[0].contains("\"command\":\"close\""));
    }

    #[tokio::test]
    async fn foreign_transport_claiming_a_channel_is_rejected() {
        let (mut service, primary) = new_service();
        let session = service.sessions.by_transport(primary.id()).unwrap();
        service.sessions.add_channel(&session, "1:a".into());

        // The intruder is itself a tracked session (e.g. a second host) that
        // falsely claims ownership of a channel belonging to `primary`'s
        // session. §4.5's cross-socket isolation invariant says the event's
        // own transport gets closed, not the channel's legitimate owner.
        let intruder = MockTransport::new();
        service
            .sessions
            .track("h2".into(), false, false, Credentials::new("admin", None, "localhost"), intruder.clone() as Rc<dyn AgentTransport>);

        service
            .on_session_control_with_channel(intruder.id(), "close".into(), "1:a".into(), Map::new())
            .await;

        assert_eq!(intruder.closed_reason().as_deref(), Some(CloseReason::PROTOCOL_ERROR));
        assert!(primary.closed_reason().is_none());
    }
}
