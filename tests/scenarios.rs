//! End-to-end scenarios S1-S6, driven entirely through `ServiceHandle` —
//! nothing here reaches into `Service`'s private tables, the same boundary
//! an external HTTP/WebSocket front end would observe.

mod common;

use std::rc::Rc;
use std::time::Duration;

use agentmux::config::Config;
use agentmux::error::CloseReason;
use agentmux::resource::ResourceRequest;
use agentmux::service::ServiceNotification;
use agentmux::socket::{BrowserSocket, SocketEvent};
use agentmux::transport::{AgentTransport, TransportEvent};
use common::{accept, open_frame, Harness, RecordingSink, SinkHandle};
use tokio::task::LocalSet;

/// S1: two `open`s for the same host over one socket share a single session.
#[tokio::test(flavor = "current_thread")]
async fn s1_two_channels_share_a_session() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let harness = Harness::new();
            let w1 = accept(&harness);

            harness
                .handle
                .socket_event(w1.id(), SocketEvent::Message { bytes: open_frame("a", "h1", None, None).into() });
            harness.settle().await;
            harness
                .handle
                .socket_event(w1.id(), SocketEvent::Message { bytes: open_frame("b", "h1", None, None).into() });
            harness.settle().await;

            assert_eq!(harness.factory.opened().len(), 1);
            harness.dispose_and_wait().await;
        })
        .await;
}

/// S2: an explicit `user`/`password` mints a private, unshared session.
#[tokio::test(flavor = "current_thread")]
async fn s2_private_session_on_explicit_user() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let harness = Harness::new();
            let w1 = accept(&harness);

            harness
                .handle
                .socket_event(w1.id(), SocketEvent::Message { bytes: open_frame("a", "h1", None, None).into() });
            harness.settle().await;
            harness.handle.socket_event(
                w1.id(),
                SocketEvent::Message {
                    bytes: open_frame("b", "h1", Some("alice"), Some("x")).into(),
                },
            );
            harness.settle().await;

            assert_eq!(harness.factory.opened().len(), 2);
            harness.dispose_and_wait().await;
        })
        .await;
}

/// S3: a transport claiming a channel it does not own gets itself closed
/// with `protocol-error`; the legitimate owner is untouched.
#[tokio::test(flavor = "current_thread")]
async fn s3_cross_socket_isolation() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let harness = Harness::new();
            let w1 = accept(&harness);
            let w2 = accept(&harness);

            harness
                .handle
                .socket_event(w1.id(), SocketEvent::Message { bytes: open_frame("a", "h1", None, None).into() });
            harness.settle().await;

            // A distinct, private session for w2 so its transport has an
            // identity different from h1's.
            harness.handle.socket_event(
                w2.id(),
                SocketEvent::Message {
                    bytes: open_frame("a", "h2", Some("alice"), Some("x")).into(),
                },
            );
            harness.settle().await;

            let transports = harness.factory.transports();
            assert_eq!(transports.len(), 2);
            let (owner, forger) = (transports[0].clone(), transports[1].clone());

            harness.handle.transport_event(
                forger.id(),
                TransportEvent::Recv {
                    channel: "1:a".to_string(),
                    payload: b"forged".to_vec(),
                },
            );
            harness.settle().await;

            assert_eq!(forger.closed_reason().as_deref(), Some(CloseReason::PROTOCOL_ERROR));
            assert!(owner.closed_reason().is_none());
            harness.dispose_and_wait().await;
        })
        .await;
}

/// S4: once a session's last channel closes, its transport is torn down
/// after the configured idle timeout.
#[tokio::test(flavor = "current_thread")]
async fn s4_idle_teardown() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut config = Config::default();
            config.agent_idle_timeout_secs = 0;
            let harness = Harness::with_config(config);
            let w1 = accept(&harness);

            harness
                .handle
                .socket_event(w1.id(), SocketEvent::Message { bytes: open_frame("a", "h1", None, None).into() });
            harness.settle().await;

            let transport = harness.factory.transports().into_iter().next().unwrap();

            // The agent reports the channel closed, which arms the idle timer.
            harness.handle.transport_event(
                transport.id(),
                TransportEvent::Control {
                    command: "close".to_string(),
                    channel: Some("1:a".to_string()),
                    options: serde_json::Map::new(),
                },
            );
            harness.settle().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            harness.settle().await;

            assert_eq!(transport.closed_reason().as_deref(), Some(CloseReason::TIMEOUT));
            harness.dispose_and_wait().await;
        })
        .await;
}

/// S5: losing the primary session tears the whole service down.
#[tokio::test(flavor = "current_thread")]
async fn s5_primary_session_loss() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let harness = Harness::new();
            let w1 = accept(&harness);
            harness.settle().await;

            let primary_id = harness.primary.id();
            harness.handle.transport_event(
                primary_id,
                TransportEvent::Closed {
                    problem: Some("terminated".to_string()),
                },
            );
            harness.settle().await;

            assert_eq!(w1.closed_reason().as_deref(), Some(CloseReason::GOING_AWAY));

            let mut notifications = harness.notifications;
            let saw_destroy = loop {
                match tokio::time::timeout(Duration::from_millis(200), notifications.recv()).await {
                    Ok(Some(ServiceNotification::Destroy)) => break true,
                    Ok(Some(_)) => continue,
                    _ => break false,
                }
            };
            assert!(saw_destroy, "expected a Destroy notification after primary loss");
        })
        .await;
}

/// S6: a resource checksum learned from a prior `close` makes a `/cache/...`
/// request resolve against the same session, with cache-forever headers.
#[tokio::test(flavor = "current_thread")]
async fn s6_resource_cache_hit() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let harness = Harness::new();

            let modules = {
                let handle = harness.handle.clone();
                let list = tokio::task::spawn_local(async move { handle.list_modules("h1".to_string()).await });
                harness.settle().await;

                let transport = harness.factory.transports().into_iter().next().unwrap();
                let mut resources = serde_json::Map::new();
                let mut mod1 = serde_json::Map::new();
                mod1.insert("checksum".to_string(), serde_json::Value::String("abc".to_string()));
                resources.insert("mod1".to_string(), serde_json::Value::Object(mod1));

                harness.handle.transport_event(
                    transport.id(),
                    TransportEvent::Control {
                        command: "close".to_string(),
                        channel: Some("0:1".to_string()),
                        options: {
                            let mut options = serde_json::Map::new();
                            options.insert("resources".to_string(), serde_json::Value::Object(resources));
                            options
                        },
                    },
                );
                harness.settle().await;
                list.await.unwrap().expect("list_modules should resolve")
            };
            assert!(modules.contains_key("mod1"));

            let sink = Rc::new(RecordingSink::default());
            harness.handle.resource_request(ResourceRequest::Cache {
                path: "abc/foo.js".to_string(),
                sink: Box::new(SinkHandle(sink.clone())),
            });
            harness.settle().await;

            let transport = harness.factory.transports().into_iter().next().unwrap();
            harness.handle.transport_event(
                transport.id(),
                TransportEvent::Recv {
                    channel: "0:2".to_string(),
                    payload: b"hello".to_vec(),
                },
            );
            harness.settle().await;
            harness.handle.transport_event(
                transport.id(),
                TransportEvent::Control {
                    command: "close".to_string(),
                    channel: Some("0:2".to_string()),
                    options: serde_json::Map::new(),
                },
            );
            harness.settle().await;

            assert_eq!(*sink.headers.borrow(), Some((200, true)));
            assert_eq!(sink.chunks.borrow()[0], b"hello");
            assert!(*sink.completed.borrow());
            harness.dispose_and_wait().await;
        })
        .await;
}
