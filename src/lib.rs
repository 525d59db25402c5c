//! A web-to-agent multiplexer: accepts browser-originated message streams
//! over a framed full-duplex socket and forwards their messages to one or
//! more agent processes, relaying agent output back to the originating
//! socket. Multiple channels are multiplexed per socket and per agent
//! transport, and multiple sockets may share one transport to the same
//! host.
//!
//! See [`service::Service`] for the entry point.

pub mod codec;
pub mod config;
pub mod creds;
pub mod dispatch;
pub mod error;
pub mod ping;
pub mod resource;
pub mod scope;
pub mod service;
pub mod session;
pub mod sockets;
pub mod socket;
pub mod transport;

#[cfg(feature = "test-util")]
pub mod testing;

pub use config::Config;
pub use error::{CloseReason, Error};
pub use service::{Service, ServiceHandle};
