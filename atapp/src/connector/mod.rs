// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The pluggable transport boundary
//!
//! A [Connector] is a transport shim keyed by address scheme. The router
//! never looks past the scheme to decide routing; everything else about an
//! address belongs to the connector. Connectors may run real IO on spawned
//! tasks, but every event crossing back into the core - readiness flips,
//! closures, incoming messages, delivery receipts - must be marshaled onto
//! the core loop through the [AppContext] it was built with. The core
//! drains those events between ticks, so no connector code ever touches
//! router state directly.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::address::{Address, AddressType};
use crate::discovery::{DiscoveryAction, DiscoveryNode};
use crate::endpoint::{EndpointRef, EndpointWeak};
use crate::errors::AppError;
use crate::message::{Message, MessageSender, Metadata};

pub mod loopback;

/// Shared reference to a connector.
pub type ConnectorRef = Rc<RefCell<dyn Connector>>;

/// Shared reference to a connection handle.
pub type HandleRef = Rc<ConnectionHandle>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection to one peer.
///
/// The handle is owned by its connector (which holds the underlying
/// socket/channel) and observed by its endpoint; both back-references are
/// weak, so dropping either side cannot leak the other.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    connector: RefCell<Option<Weak<RefCell<dyn Connector>>>>,
    endpoint: RefCell<EndpointWeak>,
    ready: Cell<bool>,
    closing: Cell<bool>,
}

impl ConnectionHandle {
    /// Allocate a fresh, unbound, not-ready handle.
    pub fn new() -> HandleRef {
        Rc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            connector: RefCell::new(None),
            endpoint: RefCell::new(EndpointWeak::new()),
            ready: Cell::new(false),
            closing: Cell::new(false),
        })
    }

    /// Process-unique handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transport has confirmed this connection.
    pub fn is_ready(&self) -> bool {
        self.ready.get() && !self.closing.get()
    }

    /// Whether the handle is being torn down.
    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    pub(crate) fn set_closing(&self) {
        self.closing.set(true);
        self.ready.set(false);
    }

    /// The connector owning this handle, if still alive.
    pub fn connector(&self) -> Option<ConnectorRef> {
        self.connector.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// The endpoint observing this handle, if bound.
    pub fn endpoint(&self) -> Option<EndpointRef> {
        self.endpoint.borrow().upgrade()
    }

    pub(crate) fn set_connector(&self, connector: &ConnectorRef) {
        *self.connector.borrow_mut() = Some(Rc::downgrade(connector));
    }

    pub(crate) fn set_endpoint(&self, endpoint: &EndpointRef) {
        *self.endpoint.borrow_mut() = Rc::downgrade(endpoint);
    }

    pub(crate) fn clear_endpoint(&self) {
        *self.endpoint.borrow_mut() = EndpointWeak::new();
    }
}

/// Attach a handle to an endpoint, registering both directions. A no-op
/// when the endpoint is closing or the handle is already bound there.
pub fn bind_handle_to_endpoint(handle: &HandleRef, endpoint: &EndpointRef) {
    if endpoint.borrow().is_closing() || handle.is_closing() {
        return;
    }
    handle.set_endpoint(endpoint);
    endpoint.borrow_mut().add_handle(handle.clone());
}

/// Detach a handle from whatever endpoint observes it. Idempotent from
/// both sides.
pub fn unbind_handle_from_endpoint(handle: &HandleRef) {
    let previous = handle.endpoint.replace(EndpointWeak::new());
    if let Some(endpoint) = previous.upgrade() {
        endpoint.borrow_mut().remove_handle(handle.id());
    }
}

/// The transport plugin contract.
///
/// Status-code returning operations (`send_forward_request`,
/// `send_fallback_request`) speak raw `i32` codes because their results
/// travel in synthesized responses; `0` means the transport has taken
/// responsibility for delivery signaling.
pub trait Connector {
    /// Short connector name for logs.
    fn name(&self) -> &'static str;

    /// Address schemes (lowercase) this connector serves.
    fn schemes(&self) -> &[&'static str];

    /// Advisory address classification; used by tooling only.
    fn address_type(&self, _addr: &Address) -> AddressType {
        AddressType::NONE
    }

    /// Begin accepting peers on `addr`.
    fn start_listen(&mut self, addr: &Address) -> Result<(), AppError>;

    /// Begin connecting to `node` at `addr`.
    ///
    /// On `Ok(())`, a connector that wants the connection keeps a clone of
    /// `handle`; the core checks the retained reference before binding the
    /// handle into the endpoint. The handle starts not-ready and the
    /// connector flips it through [AppContext::notify_handle_ready] when
    /// the transport confirms.
    fn start_connect(
        &mut self,
        node: &DiscoveryNode,
        addr: &Address,
        handle: &HandleRef,
    ) -> Result<(), AppError>;

    /// Tear down the connection behind `handle`.
    fn close_handle(&mut self, handle: &HandleRef);

    /// Hand a message to the transport. If the caller's `sequence` is `0`
    /// the connector allocates one and writes it back.
    fn send_forward_request(
        &mut self,
        handle: &HandleRef,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32;

    /// Legacy direct send by node id, without a routed endpoint. Only the
    /// default bus connector implements this; everything else reports the
    /// scheme unsupported.
    fn send_fallback_request(
        &mut self,
        _target_id: u64,
        _message_type: i32,
        _sequence: &mut u64,
        _payload: &[u8],
        _metadata: Option<&Metadata>,
    ) -> i32 {
        AppError::ChannelNotSupported.code()
    }

    /// Observe a discovery PUT/DELETE so the connector can optimistically
    /// manage dialed connections.
    fn on_discovery_event(&mut self, _action: DiscoveryAction, _node: &Rc<DiscoveryNode>) {}

    /// Ask a running peer instance to execute a command, completing the
    /// supplied channel with its response lines. Used by the CLI
    /// stop/reload/run paths; bounded by the caller with a deadline.
    fn start_command_request(
        &mut self,
        _addr: &Address,
        _words: &[String],
        reply: oneshot::Sender<Result<Vec<String>, AppError>>,
    ) {
        let _ = reply.send(Err(AppError::ChannelNotSupported));
    }

    /// Advance connector-internal timers. Returns the number of actions
    /// performed (contributes to the tick's active count).
    fn tick(&mut self, _now: Instant) -> i32 {
        0
    }

    /// Stop listening and drop every live session.
    fn shutdown(&mut self) {}
}

// ========================= Core event marshaling ========================= //

/// Events a connector (or the router itself) queues onto the core loop.
pub(crate) enum CoreEvent {
    /// A transport confirmed the connection behind a handle
    HandleReady(HandleRef),
    /// A transport lost the connection behind a handle
    HandleClosed {
        /// The affected handle
        handle: HandleRef,
        /// `0` for orderly EOF, a taxonomy code otherwise
        error_code: i32,
    },
    /// A peer delivered a forward request to this node
    ForwardRequest {
        /// Originating peer
        from: MessageSender,
        /// The delivered message
        message: Message,
    },
    /// A delivery receipt (or failure) for a message this node sent
    ForwardResponse {
        /// The peer the message was addressed to
        target: MessageSender,
        /// The original message
        message: Message,
        /// `0` on success, taxonomy code on failure
        error_code: i32,
    },
    /// A peer submitted a custom command
    CustomCommand {
        /// Originating peer
        from: MessageSender,
        /// Command words
        words: Vec<String>,
        /// Channel receiving the response lines
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct ContextInner {
    node_id: Cell<u64>,
    node_name: RefCell<String>,
    events: mpsc::UnboundedSender<CoreEvent>,
}

/// The slice of the core a connector is allowed to talk to.
///
/// Cloneable and cheap; every method enqueues onto the core loop and
/// returns immediately.
#[derive(Clone)]
pub struct AppContext {
    inner: Rc<ContextInner>,
}

impl AppContext {
    pub(crate) fn new(events: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                node_id: Cell::new(0),
                node_name: RefCell::new(String::new()),
                events,
            }),
        }
    }

    pub(crate) fn set_identity(&self, id: u64, name: &str) {
        self.inner.node_id.set(id);
        *self.inner.node_name.borrow_mut() = name.to_string();
    }

    /// The local node id.
    pub fn node_id(&self) -> u64 {
        self.inner.node_id.get()
    }

    /// The local node name.
    pub fn node_name(&self) -> String {
        self.inner.node_name.borrow().clone()
    }

    /// Report that the transport behind `handle` is ready for traffic.
    pub fn notify_handle_ready(&self, handle: &HandleRef) {
        let _ = self.inner.events.send(CoreEvent::HandleReady(handle.clone()));
    }

    /// Report that the transport behind `handle` closed.
    pub fn notify_handle_closed(&self, handle: &HandleRef, error_code: i32) {
        let _ = self.inner.events.send(CoreEvent::HandleClosed {
            handle: handle.clone(),
            error_code,
        });
    }

    /// Deliver an incoming forward request to the application.
    pub fn receive_forward_request(&self, from: MessageSender, message: Message) {
        let _ = self
            .inner
            .events
            .send(CoreEvent::ForwardRequest { from, message });
    }

    /// Deliver a forward response (delivery receipt or failure) to the
    /// application.
    pub fn receive_forward_response(
        &self,
        target: MessageSender,
        message: Message,
        error_code: i32,
    ) {
        let _ = self.inner.events.send(CoreEvent::ForwardResponse {
            target,
            message,
            error_code,
        });
    }

    /// Deliver a custom command; the returned channel yields the response
    /// lines once the application processed it.
    pub fn receive_custom_command(
        &self,
        from: MessageSender,
        words: Vec<String>,
    ) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.events.send(CoreEvent::CustomCommand {
            from,
            words,
            reply: tx,
        });
        rx
    }
}
