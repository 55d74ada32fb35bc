// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Application event observer
//!
//! One observer implementation receives every app-level event through
//! named methods. Handlers get `&mut App` back, so they can send messages
//! or stop the app from inside a callback; replacing the observer from
//! within a handler is allowed and takes effect for the next event.

use crate::app::App;
use crate::message::{Message, MessageSender};

/// Named event hooks dispatched by the app core. Every method has a
/// default no-op implementation.
pub trait AppEvents {
    /// A peer delivered a message to this node.
    fn on_forward_request(
        &mut self,
        _app: &mut App,
        _source: &MessageSender,
        _message: &Message,
    ) -> i32 {
        0
    }

    /// A delivery receipt (or failure report) arrived for a message this
    /// node sent. `error_code` is `0` on success.
    fn on_forward_response(
        &mut self,
        _app: &mut App,
        _source: &MessageSender,
        _message: &Message,
        _error_code: i32,
    ) -> i32 {
        0
    }

    /// A connection handle to `peer` became ready.
    fn on_connected(&mut self, _app: &mut App, _peer: &MessageSender) {}

    /// A connection handle to `peer` closed. `error_code` is `0` for an
    /// orderly shutdown.
    fn on_disconnected(&mut self, _app: &mut App, _peer: &MessageSender, _error_code: i32) {}

    /// Every registered module finished `init`.
    fn on_all_modules_ready(&mut self, _app: &mut App) {}

    /// A peer (or the CLI) submitted a custom command not handled by the
    /// built-ins. Push response lines into `response`; return non-zero to
    /// report the command as failed.
    fn on_custom_command(
        &mut self,
        _app: &mut App,
        _from: &MessageSender,
        words: &[String],
        response: &mut Vec<String>,
    ) -> i32 {
        response.push(format!("unknown command: {}", words.join(" ")));
        0
    }
}

/// The do-nothing observer installed before the application registers its
/// own.
pub(crate) struct NullEvents;

impl AppEvents for NullEvents {}
