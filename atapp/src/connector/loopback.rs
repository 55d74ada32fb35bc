// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! In-process transport over a shared hub
//!
//! The loopback connector serves the `mem://` scheme: every participating
//! app registers its listen key on a shared [LoopbackHub], and sends are
//! delivered straight into the peer app's core event channel. It is the
//! transport of choice for tests and for co-located nodes inside one
//! process; there is no wire format and no IO.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::address::{Address, AddressType};
use crate::connector::{AppContext, Connector, HandleRef};
use crate::discovery::{DiscoveryAction, DiscoveryNode};
use crate::errors::AppError;
use crate::message::{Message, MessageSender, Metadata};

#[derive(Clone)]
struct PeerSlot {
    node_id: u64,
    node_name: String,
    context: AppContext,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, PeerSlot>,
}

/// The shared in-process switchboard. Clone one hub into every
/// [LoopbackConnector] that should see the same peers.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Rc<RefCell<HubInner>>,
}

impl LoopbackHub {
    /// A hub with no registered peers.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: String, slot: PeerSlot) {
        self.inner.borrow_mut().peers.insert(key, slot);
    }

    fn unregister(&self, key: &str) {
        self.inner.borrow_mut().peers.remove(key);
    }

    fn lookup(&self, key: &str) -> Option<PeerSlot> {
        self.inner.borrow().peers.get(key).cloned()
    }

    /// Whether a peer is registered under `key` (`host` + `path` of its
    /// listen address).
    pub fn has_peer(&self, key: &str) -> bool {
        self.inner.borrow().peers.contains_key(key)
    }
}

fn hub_key(addr: &Address) -> String {
    format!("{}{}", addr.host, addr.path)
}

/// The `mem://` connector. See the module docs.
pub struct LoopbackConnector {
    context: AppContext,
    hub: LoopbackHub,
    handles: HashMap<u64, HandleRef>,
    targets: HashMap<u64, String>,
    listen_keys: Vec<String>,
    sequence: u64,
    hold_connections: bool,
    held: Vec<HandleRef>,
}

impl LoopbackConnector {
    /// Build a connector for `context`'s app, attached to `hub`.
    pub fn new(context: AppContext, hub: LoopbackHub) -> Self {
        Self {
            context,
            hub,
            handles: HashMap::new(),
            targets: HashMap::new(),
            listen_keys: Vec::new(),
            sequence: 0,
            hold_connections: false,
            held: Vec::new(),
        }
    }

    /// When set, accepted connections stay not-ready until
    /// [Self::release_connections] runs. Lets tests exercise the
    /// disconnected-buffering path.
    pub fn hold_connections(&mut self, hold: bool) {
        self.hold_connections = hold;
    }

    /// Flip every held connection to ready.
    pub fn release_connections(&mut self) {
        for handle in self.held.drain(..) {
            self.context.notify_handle_ready(&handle);
        }
    }

    fn local_identity(&self) -> MessageSender {
        MessageSender {
            id: self.context.node_id(),
            name: self.context.node_name(),
        }
    }
}

impl Connector for LoopbackConnector {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn schemes(&self) -> &[&'static str] {
        &["mem"]
    }

    fn address_type(&self, _addr: &Address) -> AddressType {
        AddressType::LOCAL
    }

    fn start_listen(&mut self, addr: &Address) -> Result<(), AppError> {
        let key = hub_key(addr);
        self.hub.register(
            key.clone(),
            PeerSlot {
                node_id: self.context.node_id(),
                node_name: self.context.node_name(),
                context: self.context.clone(),
            },
        );
        self.listen_keys.push(key);
        Ok(())
    }

    fn start_connect(
        &mut self,
        _node: &DiscoveryNode,
        addr: &Address,
        handle: &HandleRef,
    ) -> Result<(), AppError> {
        let key = hub_key(addr);
        if self.hub.lookup(&key).is_none() {
            return Err(AppError::ConnectPeerFailed);
        }

        self.handles.insert(handle.id(), handle.clone());
        self.targets.insert(handle.id(), key);
        if self.hold_connections {
            self.held.push(handle.clone());
        } else {
            self.context.notify_handle_ready(handle);
        }
        Ok(())
    }

    fn close_handle(&mut self, handle: &HandleRef) {
        self.handles.remove(&handle.id());
        self.targets.remove(&handle.id());
        self.held.retain(|held| held.id() != handle.id());
    }

    fn send_forward_request(
        &mut self,
        handle: &HandleRef,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32 {
        let Some(key) = self.targets.get(&handle.id()) else {
            return AppError::SendFailed.code();
        };
        let Some(peer) = self.hub.lookup(key) else {
            return AppError::ConnectPeerFailed.code();
        };

        if *sequence == 0 {
            self.sequence += 1;
            *sequence = self.sequence;
        }

        let message = Message::new(message_type, *sequence, payload, metadata);
        peer.context
            .receive_forward_request(self.local_identity(), message.clone());
        // in-process delivery cannot fail past this point; report success
        self.context.receive_forward_response(
            MessageSender {
                id: peer.node_id,
                name: peer.node_name,
            },
            message,
            0,
        );
        0
    }

    fn on_discovery_event(&mut self, _action: DiscoveryAction, _node: &Rc<DiscoveryNode>) {}

    fn tick(&mut self, _now: Instant) -> i32 {
        0
    }

    fn shutdown(&mut self) {
        for key in self.listen_keys.drain(..) {
            self.hub.unregister(&key);
        }
        for (_, handle) in self.handles.drain() {
            self.context.notify_handle_closed(&handle, 0);
        }
        self.targets.clear();
        self.held.clear();
    }
}
