//! Command dispatchers (C7): the small set of control commands a browser
//! socket may send (`open`, `close`, `ping`, `authorize`, `logout`), plus the
//! channel-less broadcast path.

use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::codec;
use crate::creds::Password;
use crate::scope;
use crate::service::Service;
use crate::sockets::SocketRef;

impl Service {
    pub(crate) async fn dispatch_inbound_command(&mut self, socket: &SocketRef, payload: &[u8]) {
        let Some(parsed) = codec::parse_command(payload) else {
            warn!("malformed control command from socket");
            self.inbound_protocol_error(socket).await;
            return;
        };

        let scope = socket.borrow().scope.clone();
        let global_channel = parsed.channel.as_deref().map(|local| scope::add_scope(&scope, local));
        let mut options = parsed.options;
        options.remove("command");
        if let Some(global) = &global_channel {
            options.insert("channel".to_string(), Value::String(global.clone()));
        } else {
            options.remove("channel");
        }

        let mut forward = true;
        match parsed.command.as_str() {
            "open" => {
                forward = false;
                match global_channel.clone() {
                    Some(global) => self.process_open(socket, global, options.clone()).await,
                    None => warn!("open command without a channel, dropping (undefined behavior)"),
                }
            }
            "logout" => {
                forward = false;
                self.process_logout(&options).await;
            }
            "close" => {}
            "ping" => {
                forward = false;
            }
            _ => {}
        }

        if !forward {
            return;
        }

        match global_channel {
            None => self.broadcast_control(&parsed.command, options).await,
            Some(global) => self.forward_control_to_session(&global, &parsed.command, options).await,
        }
    }

    /// No channel after scope-rewriting: broadcast to every non-EOF session.
    /// Resolves spec §9's Open Question 2 — the predicate is "no channel was
    /// present at all", not a numeric comparison.
    async fn broadcast_control(&self, command: &str, mut options: Map<String, Value>) {
        options.insert("command".to_string(), Value::String(command.to_string()));
        let fields: Vec<(&str, Option<Value>)> = options.iter().map(|(k, v)| (k.as_str(), Some(v.clone()))).collect();

        for session in self.sessions.iter() {
            let (transport, sent_eof) = {
                let s = session.borrow();
                (s.transport.clone(), s.sent_eof.get())
            };
            if sent_eof {
                continue;
            }
            let _ = transport.send_control(&fields).await;
        }
    }

    async fn forward_control_to_session(&mut self, global_channel: &str, command: &str, mut options: Map<String, Value>) {
        let Some(session) = self.sessions.by_channel(global_channel) else {
            warn!("control for unknown channel {global_channel:?}, dropping");
            return;
        };
        options.insert("command".to_string(), Value::String(command.to_string()));
        options.insert("channel".to_string(), Value::String(global_channel.to_string()));

        let (transport, sent_eof) = {
            let s = session.borrow();
            (s.transport.clone(), s.sent_eof.get())
        };
        if sent_eof {
            warn!("dropping control for {global_channel:?}, session has sent eof");
            return;
        }

        let fields: Vec<(&str, Option<Value>)> = options.iter().map(|(k, v)| (k.as_str(), Some(v.clone()))).collect();
        let _ = transport.send_control(&fields).await;
    }

    /// §4.7 `process_open`.
    async fn process_open(&mut self, socket: &SocketRef, channel: String, options: Map<String, Value>) {
        if self.closing {
            info!("ignoring open for {channel:?}, service is closing");
            return;
        }
        if self.sessions.by_channel(&channel).is_some() {
            warn!("duplicate open for channel {channel:?}, protocol error");
            self.inbound_protocol_error(socket).await;
            return;
        }

        let host = options
            .get("host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
            .to_string();
        let user = options.get("user").and_then(Value::as_str).map(str::to_string);
        let password = options.get("password").and_then(Value::as_str).map(Password::new);
        let host_key = options.get("host-key").and_then(Value::as_str).map(str::to_string);

        let mut private = false;
        let creds = match user {
            Some(user) if !user.is_empty() => {
                private = true;
                self.creds.derive(user, password)
            }
            _ => self.creds.clone(),
        };
        if host_key.is_some() {
            private = true;
        }

        match self.lookup_or_open(&host, host_key.as_deref(), creds, private).await {
            Ok(session) => self.sessions.add_channel(&session, channel),
            Err(err) => error!("failed to open session for host {host:?}: {err}"),
        }
    }

    /// §4.7 `process_logout`.
    async fn process_logout(&mut self, options: &Map<String, Value>) {
        let disconnect = options.get("disconnect").and_then(Value::as_bool).unwrap_or(false);
        self.creds.poison();
        if disconnect {
            info!("logout requested full disconnect");
            self.dispose().await;
        } else {
            info!("logout");
        }
    }
}
