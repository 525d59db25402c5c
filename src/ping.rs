//! Ping ticker & idling tracker (C9): a fixed-interval keepalive broadcast
//! plus the `callers` reference count that flips `idling` at zero.
//!
//! `caller_begin`/`caller_end`/`get_idling` live on [`Service`] directly
//! (see `service.rs`) since they only touch the `callers` counter; this
//! module owns the periodic side of the component.

use crate::codec;
use crate::service::Service;
use crate::socket::SocketState;

impl Service {
    /// §4.9: every tick, send a `command:"ping"` control to each OPEN
    /// socket.
    pub(crate) async fn broadcast_ping(&self) {
        let fields = [codec::field("command", Some("ping"))];
        let frame = codec::encode_control_frame(&fields);

        for socket in self.sockets.iter() {
            let connection = socket.borrow().connection.clone();
            if connection.state() != SocketState::Open {
                continue;
            }
            let _ = connection.send(frame.clone()).await;
        }
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

    #[tokio::test]
    async fn ping_reaches_open_sockets_but_not_closed_ones() {
        let primary = MockTransport::new();
        let (mut service, _handle, _notifications) = Service::new(
            Config::default(),
            Credentials::new("admin", None, "localhost"),
            primary.clone() as Rc<dyn AgentTransport>,
            refusing_transport_factory(),
            stub_reauthorizer(),
        );

        let open_socket = MockSocket::new();
        service.on_socket_accepted(open_socket.clone() as Rc<dyn crate::socket::BrowserSocket>);

        let closed_socket = MockSocket::new();
        closed_socket.set_state(SocketState::Closed);
        service.on_socket_accepted(closed_socket.clone() as Rc<dyn crate::socket::BrowserSocket>);

        service.broadcast_ping().await;

        assert_eq!(open_socket.sent().len(), 1);
        assert!(open_socket.sent_strings()[0].contains("\"command\":\"ping\""));
        assert!(closed_socket.sent().is_empty());
    }
}
