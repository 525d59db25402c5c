//! Resource fetcher (C8): proxies static resources served by an agent's
//! `resource1` channel out over an HTTP response, and the one-shot
//! `list_modules` lookup used to populate a session's checksum table ahead
//! of a cache hit.

use std::cell::Cell;
use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use log::error;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec;
use crate::error::Error;
use crate::session::SessionRef;
use crate::service::Service;
use crate::transport::TransportId;

/// Sink for streaming a resource response out over HTTP, standing in for
/// the external HTTP layer per spec §1's explicit interface list
/// (`headers`, `queue`, `complete`, `error`, `abort`).
///
/// `?Send`: driven entirely from the service's single event-loop task, same
/// as [`crate::transport::AgentTransport`]/[`crate::socket::BrowserSocket`].
#[async_trait(?Send)]
pub trait HttpResponseSink {
    async fn write_headers(&self, status: u16, cache_forever: bool);
    async fn write_chunk(&self, bytes: &[u8]);
    async fn complete(&self);
    async fn error(&self, status: u16);
    async fn abort(&self);
}

/// A pending HTTP GET, pushed into the service's event queue by the
/// (external) HTTP server.
pub enum ResourceRequest {
    /// `/res/<host>/<module>/<path>`, `path` already stripped of the `/res/`
    /// prefix.
    Resource { path: String, sink: Box<dyn HttpResponseSink> },
    /// `/cache/<checksum>/<path>`, `path` already stripped of the
    /// `/cache/` prefix.
    Cache { path: String, sink: Box<dyn HttpResponseSink> },
}

pub(crate) struct ResourceResponse {
    pub(crate) sink: Box<dyn HttpResponseSink>,
    pub(crate) headers_sent: Cell<bool>,
    pub(crate) cache_forever: bool,
}

impl Service {
    pub(crate) async fn handle_resource_request(&mut self, request: ResourceRequest) {
        match request {
            ResourceRequest::Resource { path, sink } => self.handle_res_request(path, sink).await,
            ResourceRequest::Cache { path, sink } => self.handle_cache_request(path, sink).await,
        }
    }

    async fn handle_res_request(&mut self, path: String, sink: Box<dyn HttpResponseSink>) {
        let parts: Vec<&str> = path.splitn(3, '/').collect();
        if parts.len() != 3 {
            sink.error(404).await;
            return;
        }
        let (host, module, rest) = (parts[0].to_string(), parts[1].to_string(), parts[2].to_string());

        let session = match self.lookup_or_open(&host, None, self.creds.clone(), false).await {
            Ok(session) => session,
            Err(err) => {
                error!("failed to open session for resource host {host:?}: {err}");
                sink.error(500).await;
                return;
            }
        };
        self.open_resource_channel(session, module, rest, sink, false).await;
    }

    async fn handle_cache_request(&mut self, path: String, sink: Box<dyn HttpResponseSink>) {
        let parts: Vec<&str> = path.splitn(2, '/').collect();
        if parts.len() != 2 {
            sink.error(404).await;
            return;
        }
        let (checksum, rest) = (parts[0], parts[1].to_string());

        let found = self.sessions.iter().find_map(|session| {
            let module = session.borrow().checksums.borrow().get(checksum).cloned();
            module.map(|module| (session.clone(), module))
        });

        let Some((session, module)) = found else {
            sink.error(404).await;
            return;
        };

        self.open_resource_channel(session, module, rest, sink, true).await;
    }

    /// §4.8 step 3–4: allocate a fresh `"0:N"` channel and send the `open`
    /// control that asks the agent to start streaming the resource.
    async fn open_resource_channel(
        &mut self,
        session: SessionRef,
        module: String,
        path: String,
        sink: Box<dyn HttpResponseSink>,
        cache_forever: bool,
    ) {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        let channel = format!("0:{id}");

        let transport = session.borrow().transport.clone();
        let transport_id = transport.id();

        self.resources.insert(
            (transport_id, channel.clone()),
            ResourceResponse {
                sink,
                headers_sent: Cell::new(false),
                cache_forever,
            },
        );
        self.sessions.add_channel(&session, channel.clone());

        let fields = [
            codec::field("command", Some("open")),
            codec::field("channel", Some(&channel)),
            codec::field("payload", Some("resource1")),
            codec::field("module", Some(&module)),
            codec::field("path", Some(&path)),
        ];
        if let Err(err) = transport.send_control(&fields).await {
            error!("failed to request resource {module}/{path}: {err}");
            if let Some(resource) = self.resources.remove(&(transport_id, channel.clone())) {
                resource.sink.error(500).await;
            }
            let idle_timeout = self.config.agent_idle_timeout();
            self.sessions.remove_channel(&session, &channel, idle_timeout, Instant::now());
        }
    }

    /// `cockpit_web_service_modules`-equivalent one-shot listing, resolved
    /// through the same channel/session plumbing as a normal resource fetch.
    ///
    /// Takes the reply sender rather than returning a `Result` directly and
    /// awaiting it here: the caller (the service's single event loop) must
    /// keep draining `events_rx` while this is outstanding, since the reply
    /// is only fulfilled once the agent's `close` for this channel arrives
    /// as a later event on that same queue. Awaiting the reply inline would
    /// park the loop that is supposed to deliver it — a self-deadlock.
    pub(crate) async fn list_modules(
        &mut self,
        host: &str,
        reply: oneshot::Sender<Result<HashMap<String, Value>, Error>>,
    ) {
        let session = match self.lookup_or_open(host, None, self.creds.clone(), false).await {
            Ok(session) => session,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let transport = session.borrow().transport.clone();
        let transport_id = transport.id();

        let id = self.next_resource_id;
        self.next_resource_id += 1;
        let channel = format!("0:{id}");

        self.pending_module_listings.insert((transport_id, channel.clone()), reply);
        self.sessions.add_channel(&session, channel.clone());

        let fields = [
            codec::field("command", Some("open")),
            codec::field("channel", Some(&channel)),
            codec::field("payload", Some("resource1")),
        ];
        if let Err(err) = transport.send_control(&fields).await {
            if let Some(reply) = self.pending_module_listings.remove(&(transport_id, channel.clone())) {
                let _ = reply.send(Err(err));
            }
            let idle_timeout = self.config.agent_idle_timeout();
            self.sessions.remove_channel(&session, &channel, idle_timeout, Instant::now());
        }
    }

    pub(crate) async fn handle_resource_recv(&mut self, transport_id: TransportId, channel: &str, payload: &[u8]) -> bool {
        let Some(resource) = self.resources.get(&(transport_id, channel.to_string())) else {
            return false;
        };
        if !resource.headers_sent.get() {
            resource.headers_sent.set(true);
            resource.sink.write_headers(200, resource.cache_forever).await;
        }
        resource.sink.write_chunk(payload).await;
        true
    }

    pub(crate) async fn finish_resource_if_pending(&mut self, transport_id: TransportId, channel: &str, reason: Option<&str>) -> bool {
        let Some(resource) = self.resources.remove(&(transport_id, channel.to_string())) else {
            return false;
        };
        finish_resource(resource, reason).await;
        true
    }

    /// Finalize every pending resource fetch and module listing on a
    /// transport that just closed, mapping it to `reason` (spec §4.8 step 7:
    /// a transport close while serving maps to `"terminated"`).
    pub(crate) async fn finish_all_resources_for_transport(&mut self, transport_id: TransportId, reason: &str) {
        let resource_keys: Vec<(TransportId, String)> = self
            .resources
            .keys()
            .filter(|(t, _)| *t == transport_id)
            .cloned()
            .collect();
        for key in resource_keys {
            if let Some(resource) = self.resources.remove(&key) {
                finish_resource(resource, Some(reason)).await;
            }
        }

        let listing_keys: Vec<(TransportId, String)> = self
            .pending_module_listings
            .keys()
            .filter(|(t, _)| *t == transport_id)
            .cloned()
            .collect();
        for key in listing_keys {
            if let Some(reply) = self.pending_module_listings.remove(&key) {
                let _ = reply.send(Err(Error::ResourceFailed(reason.to_string())));
            }
        }
    }
}

/// §4.8 step 6's close-reason mapping, shared by the per-channel close path
/// and the whole-transport teardown path.
async fn finish_resource(resource: ResourceResponse, reason: Option<&str>) {
    match reason {
        Some("not-found") => {
            if resource.headers_sent.get() {
                resource.sink.abort().await;
            } else {
                resource.sink.error(404).await;
            }
        }
        Some(other) if !other.is_empty() => {
            if resource.headers_sent.get() {
                resource.sink.abort().await;
            } else {
                resource.sink.error(500).await;
            }
        }
        _ => {
            if !resource.headers_sent.get() {
                resource.sink.write_headers(200, resource.cache_forever).await;
            }
            resource.sink.complete().await;
        }
    }
}
