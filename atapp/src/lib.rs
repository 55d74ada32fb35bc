// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `atapp`: a framework for long-lived, clustered server processes that
//! exchange typed messages over a mesh of peers.
//!
//! Each process ("node") owns a numeric identity, a human-readable name,
//! metadata and a set of listen addresses. The framework provides:
//!
//! - a deterministic process lifecycle (configure → initialize modules →
//!   run → reload → stop) with signal-driven shutdown;
//! - a message router that resolves a destination (by id, by name, or by
//!   hash over a key) against a discovery catalog, opens a connection on a
//!   matching transport, and delivers a typed payload with sequence
//!   tracking and per-message expiry;
//! - a per-peer outgoing queue that tolerates transient connection loss
//!   with bounded buffering and timed retries;
//! - pluggable connectors (transports) keyed by address scheme, plus a
//!   module contract for domain extensions.
//!
//! ## Getting started
//!
//! ```no_run
//! use atapp::{App, AppEvents, Message, MessageSender};
//!
//! struct Echo;
//!
//! impl AppEvents for Echo {
//!     fn on_forward_request(
//!         &mut self,
//!         app: &mut App,
//!         source: &MessageSender,
//!         message: &Message,
//!     ) -> i32 {
//!         // echo every payload back to its sender
//!         let _ = app.send_message_by_id(
//!             source.id,
//!             message.message_type,
//!             &message.payload,
//!             None,
//!             message.metadata.as_ref(),
//!         );
//!         0
//!     }
//! }
//!
//! fn main() {
//!     let mut app = App::new();
//!     app.set_events_observer(Box::new(Echo));
//!     std::process::exit(app.run_with_args(std::env::args()));
//! }
//! ```
//!
//! The default wire transport (the "atbus" connector, serving the
//! `tcp://`, `ipv4://`, `ipv6://` and `dns://` schemes) lives in the
//! `atapp-bus` crate; register it with [App::add_connector] and mark it
//! with [App::set_default_connector] to enable the legacy id-send
//! fallback and CLI command delivery. The built-in in-process transport
//! for the `mem://` scheme is [connector::loopback::LoopbackConnector].
//!
//! ## Concurrency model
//!
//! The core is single-threaded and cooperative: endpoint indices, pending
//! queues, the waker queue and the lifecycle flags are only ever touched
//! from the app's own loop. Connectors may spawn IO tasks, but everything
//! crossing the connector boundary is marshaled back onto the core loop
//! through an [connector::AppContext]. `send_*` never suspends - it
//! either enqueues or fails fast.

#![warn(unused_imports)]
#![warn(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod app;
pub mod cli;
pub mod config;
pub mod connector;
pub mod discovery;
pub mod endpoint;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod message;
pub mod module;
pub mod pidfile;

pub(crate) mod waker;

// ============== Re-exports ============== //
pub use address::{Address, AddressType};
pub use app::{App, AppFlag, RunMode};
pub use config::AppConfig;
pub use connector::{AppContext, ConnectionHandle, Connector, ConnectorRef, HandleRef};
pub use discovery::{DiscoveryAction, DiscoveryNode, DiscoveryNodeInfo, DiscoverySet};
pub use endpoint::{Endpoint, EndpointRef};
pub use errors::AppError;
pub use events::AppEvents;
pub use gateway::GatewayMatcher;
pub use message::{Message, MessageSender, Metadata};
pub use module::AppModule;
