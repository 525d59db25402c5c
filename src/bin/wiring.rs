//! Production wiring for the `agentmux` binary: process-spawned
//! `AgentTransport`s and the system reauthorization seam.
//!
//! Nothing in `agentmux::service` cares how a transport is actually opened —
//! it only depends on the `AgentTransport`/`TransportFactory` traits — so
//! this lives in the binary rather than the library, the same way the
//! teacher crate keeps `transport::connect::Connector` (the thing that
//! actually dials a `TcpTransport`) out of `Server`/`ServerHandle`.

use std::cell::RefCell;
use std::process::Stdio;
use std::rc::Rc;

use agentmux::codec;
use agentmux::config::Config;
use agentmux::creds::{Challenge, Credentials, Password, Reauthorizer};
use agentmux::error::Error;
use agentmux::service::ServiceHandle;
use agentmux::transport::{AgentTransport, TransportEvent, TransportFactory, TransportId};
use async_trait::async_trait;
use log::{error, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

/// Late-bound handle to the running [`Service`](agentmux::service::Service).
///
/// The primary transport has to exist before `Service::new` can run (it's
/// passed in as an argument), but a transport can't report events back
/// without a [`ServiceHandle`] — and that handle is only minted by
/// `Service::new`. This cell breaks the cycle: wiring constructs every
/// transport against an empty cell, `main` fills it in right after
/// `Service::new` returns, and a transport's read loop only ever consults it
/// once real frames start arriving (well after that point in practice).
#[derive(Clone, Default)]
pub struct HandleCell(Rc<RefCell<Option<ServiceHandle>>>);

impl HandleCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, handle: ServiceHandle) {
        *self.0.borrow_mut() = Some(handle);
    }

    fn get(&self) -> ServiceHandle {
        self.0
            .borrow()
            .clone()
            .expect("service handle must be set before a transport reports any event")
    }
}

/// Spawn the primary (`localhost`) transport eagerly, the way `main` spawns
/// its primary session before the service that will own it exists.
pub fn spawn_primary_transport(config: &Config, handle: HandleCell) -> Rc<dyn AgentTransport> {
    ProcessTransport::spawn(config, None, handle)
        .unwrap_or_else(|err| panic!("failed to spawn primary session helper: {err}"))
}

pub fn transport_factory(config: &Config, handle: HandleCell) -> Rc<dyn TransportFactory> {
    Rc::new(ProcessTransportFactory {
        config: Rc::new(config.clone()),
        handle,
    })
}

pub fn reauthorizer() -> Rc<dyn Reauthorizer> {
    Rc::new(SystemReauthorizer)
}

struct ProcessTransportFactory {
    config: Rc<Config>,
    handle: HandleCell,
}

#[async_trait(?Send)]
impl TransportFactory for ProcessTransportFactory {
    async fn open(
        &self,
        host: &str,
        port_override: Option<u16>,
        _creds: &Credentials,
        _host_key: Option<&str>,
    ) -> Result<Rc<dyn AgentTransport>, Error> {
        let mut config = (*self.config).clone();
        config.ssh_port_override = port_override;
        ProcessTransport::spawn(&config, Some(host), self.handle.clone())
    }
}

/// An [`AgentTransport`] backed by a spawned session-helper child process,
/// speaking the same `channel-or-blank LF payload` envelope the browser
/// socket uses — prefixed with `"<byte-length>\n"` on the wire, since a pipe
/// has no frame boundaries of its own the way a single WebSocket TEXT frame
/// does.
///
/// Grounded on the teacher's `TcpTransport`: one long-lived handle wrapping
/// a duplex I/O object, with a background task feeding reads back into the
/// service as events and writes going out through a method on `self`.
pub struct ProcessTransport {
    id: TransportId,
    stdin: RefCell<ChildStdin>,
    child: RefCell<Child>,
}

impl ProcessTransport {
    /// Spawn the configured session helper, targeting `host` (the local
    /// agent when `None`), and start its background read loop.
    fn spawn(config: &Config, host: Option<&str>, handle: HandleCell) -> Result<Rc<dyn AgentTransport>, Error> {
        let mut command = Command::new(&config.session_helper_path);
        command
            .arg("--agent")
            .arg(&config.agent_path)
            .arg("--known-hosts")
            .arg(&config.known_hosts_path);
        if let Some(host) = host {
            command.arg("--host").arg(host);
        }
        if let Some(port) = config.ssh_port_override {
            command.arg("--port").arg(port.to_string());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|err| Error::Io(format!("spawning session helper: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io("session helper did not expose stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io("session helper did not expose stdout".into()))?;

        let transport = Rc::new(Self {
            id: TransportId::next(),
            stdin: RefCell::new(stdin),
            child: RefCell::new(child),
        });

        let id = transport.id;
        tokio::task::spawn_local(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => {
                        let Some((channel, payload)) = codec::parse_frame(&bytes) else {
                            warn!("session helper sent a malformed frame, ignoring");
                            continue;
                        };
                        let event = match channel {
                            None => match codec::parse_command(payload) {
                                Some(parsed) => TransportEvent::Control {
                                    command: parsed.command,
                                    channel: parsed.channel,
                                    options: parsed.options,
                                },
                                None => {
                                    warn!("session helper sent a malformed control frame");
                                    continue;
                                }
                            },
                            Some(channel) => TransportEvent::Recv {
                                channel,
                                payload: payload.to_vec(),
                            },
                        };
                        handle.get().transport_event(id, event);
                    }
                    Ok(None) => {
                        handle.get().transport_event(id, TransportEvent::Closed { problem: None });
                        break;
                    }
                    Err(err) => {
                        error!("session helper read failed: {err}");
                        handle.get().transport_event(
                            id,
                            TransportEvent::Closed {
                                problem: Some("terminated".to_string()),
                            },
                        );
                        break;
                    }
                }
            }
        });

        Ok(transport as Rc<dyn AgentTransport>)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), Error> {
        let mut stdin = self.stdin.borrow_mut();
        stdin
            .write_all(format!("{}\n", frame.len()).as_bytes())
            .await
            .map_err(|err| Error::Io(err.to_string()))?;
        stdin
            .write_all(frame)
            .await
            .map_err(|err| Error::Io(err.to_string()))?;
        stdin.flush().await.map_err(|err| Error::Io(err.to_string()))
    }
}

#[async_trait(?Send)]
impl AgentTransport for ProcessTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    async fn send_control(&self, fields: &[(&str, Option<Value>)]) -> Result<(), Error> {
        self.write_frame(&codec::encode_control_frame(fields)).await
    }

    async fn send_data(&self, channel: &str, payload: &[u8]) -> Result<(), Error> {
        self.write_frame(&codec::encode_data_frame(channel, payload)).await
    }

    async fn close(&self, reason: &str) {
        let fields = [codec::field("command", Some("close")), codec::field("reason", Some(reason))];
        let _ = self.send_control(&fields).await;
        if let Err(err) = self.child.borrow_mut().start_kill() {
            warn!("failed to kill session helper process: {err}");
        }
    }
}

/// Read one length-prefixed frame: an ASCII decimal length, `\n`, then that
/// many raw bytes. Returns `Ok(None)` on a clean EOF before any length line.
async fn read_frame<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = String::new();
    let read = reader.read_line(&mut header).await?;
    if read == 0 {
        return Ok(None);
    }
    let len: usize = header
        .trim_end()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame length header"))?;
    let mut buf = vec![0u8; len];
    tokio::io::AsyncReadExt::read_exact(reader, &mut buf).await?;
    Ok(Some(buf))
}

/// System reauthorization helper stand-in. A real deployment shells out to
/// (or links) the platform's crypt1 challenge/response helper; this build
/// has no such dependency available, so it recognizes the `"crypt1:<user>"`
/// challenge shape but always declines to compute a response, which is a
/// legal outcome per spec §4.5.1 ("otherwise leave response empty").
struct SystemReauthorizer;

impl Reauthorizer for SystemReauthorizer {
    fn extract(&self, challenge: &str) -> Option<Challenge> {
        let (kind, user) = challenge.split_once(':')?;
        Some(Challenge {
            kind: kind.to_string(),
            user: user.to_string(),
        })
    }

    fn crypt1_response(&self, _challenge: &str, _password: &Password) -> Option<String> {
        warn!("crypt1 reauthorization requested but no crypt helper is wired up");
        None
    }
}
