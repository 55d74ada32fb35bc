// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! # The default wire transport for `atapp` nodes
//!
//! A [BusConnector] serves the `tcp://`, `ipv4://`, `ipv6://` and
//! `dns://` address schemes: one TCP session per peer, frames carried as
//! a big-endian `u64` length prefix followed by a prost-encoded
//! [protocol::BusFrame] whose header exposes `{cmd, type, ret, sequence,
//! src_bus_id}`. Sessions authenticate through a three-stage challenge
//! handshake (HELLO → CHALLENGE → ACK) computed over the configured
//! `bus.access_tokens` with HMAC-SHA-256; with no tokens configured the
//! handshake still runs but accepts every peer.
//!
//! Beyond routed endpoint traffic, the connector implements:
//!
//! - the **legacy direct send** fallback for id-addressed messages: peer
//!   listen addresses are learned from discovery PUT events and
//!   handshakes, and an on-demand session is dialed when an id send has
//!   no routed endpoint;
//! - the **command channel** behind the CLI `stop`/`reload`/`run`
//!   commands ([command::send_command]), a one-shot request bounded by
//!   the caller's deadline.
//!
//! ## Usage
//!
//! ```no_run
//! use atapp::App;
//! use atapp_bus::{BusConnector, BusOptions};
//!
//! let mut app = App::new();
//! // load configuration first, then install the transport
//! let _bus = BusConnector::install(&mut app, BusOptions::default());
//! std::process::exit(app.run_with_args(std::env::args()));
//! ```
//!
//! The connector runs its IO on `spawn_local` tasks, so the app must be
//! driven inside a `tokio` `LocalSet` - [atapp::App::run] sets one up.

#![warn(unused_imports)]
#![warn(unsafe_code)]
#![warn(missing_docs)]

mod connector;
mod handshake;
mod net;

pub mod command;
pub mod protocol;

// ============== Re-exports ============== //
pub use connector::{BusConnector, BusOptions};
