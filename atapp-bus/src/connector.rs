// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The bus connector: atapp's default wire transport
//!
//! Serves the `tcp://`, `ipv4://`, `ipv6://` and `dns://` schemes with
//! one TCP session per peer. Sessions authenticate through a three-stage
//! challenge handshake (HELLO → CHALLENGE → ACK) backed by the configured
//! access tokens, then carry length-prefixed prost frames. The connector
//! also implements the legacy direct-send fallback for id targets: peer
//! listen addresses are learned from discovery events and handshakes, and
//! an on-demand session is dialed when an id send has no routed endpoint.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use atapp::address::{Address, AddressType};
use atapp::app::App;
use atapp::connector::{AppContext, Connector, ConnectorRef, HandleRef};
use atapp::discovery::{DiscoveryAction, DiscoveryNode};
use atapp::errors::AppError;
use atapp::{Message, MessageSender, Metadata};

use crate::handshake;
use crate::net::listener;
use crate::net::session::{spawn_session, Session, SessionState};
use crate::protocol::{
    cmd, frame_body, handshake_stage, BusFrame, BusHeader, BusMetadata, CommandData, ForwardData,
    Handshake, PROTOCOL_VERSION,
};

/// Tuning knobs for a [BusConnector].
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Shared secrets for handshake authentication; empty disables it
    pub access_tokens: Vec<String>,
    /// Addresses announced to peers so they can dial back
    pub advertise_addresses: Vec<String>,
    /// How long a sent-but-unacknowledged (or queued-but-undialed)
    /// message may live before a `Timeout` response is synthesized
    pub inflight_timeout: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            access_tokens: Vec::new(),
            advertise_addresses: Vec::new(),
            inflight_timeout: Duration::from_secs(30),
        }
    }
}

impl BusOptions {
    /// Derive options from a loaded app configuration.
    pub fn from_configure(config: &atapp::AppConfig) -> Self {
        Self {
            access_tokens: config.bus.access_tokens.clone(),
            advertise_addresses: config.bus.listen.clone(),
            inflight_timeout: config.timer.message_timeout.max(Duration::from_secs(1)) * 2,
        }
    }
}

struct QueuedForward {
    queued_at: Instant,
    message: Message,
}

/// The default bus transport. Register through [BusConnector::install].
pub struct BusConnector {
    context: AppContext,
    options: BusOptions,
    self_ref: Option<Weak<RefCell<BusConnector>>>,
    sessions: HashMap<u64, Session>,
    session_by_handle: HashMap<u64, u64>,
    session_by_peer: HashMap<u64, u64>,
    /// Handles retained between `start_connect` and session registration
    handles: HashMap<u64, HandleRef>,
    /// Peer listen addresses learned from discovery and handshakes
    known_peers: HashMap<u64, String>,
    /// Fallback sends waiting for an on-demand session
    pending_by_peer: HashMap<u64, Vec<QueuedForward>>,
    dialing: std::collections::HashSet<u64>,
    listeners: Vec<tokio::task::JoinHandle<()>>,
    bound_addresses: Vec<SocketAddr>,
    next_session_id: u64,
    sequence: u64,
}

impl BusConnector {
    /// Build a connector. Prefer [BusConnector::install], which also wires
    /// the back-reference the IO tasks need.
    pub fn new(context: AppContext, options: BusOptions) -> Self {
        Self {
            context,
            options,
            self_ref: None,
            sessions: HashMap::new(),
            session_by_handle: HashMap::new(),
            session_by_peer: HashMap::new(),
            handles: HashMap::new(),
            known_peers: HashMap::new(),
            pending_by_peer: HashMap::new(),
            dialing: std::collections::HashSet::new(),
            listeners: Vec::new(),
            bound_addresses: Vec::new(),
            next_session_id: 1,
            sequence: 0,
        }
    }

    /// Register a bus connector on `app` and mark it as the default
    /// transport (fallback target and CLI command carrier).
    pub fn install(app: &mut App, options: BusOptions) -> Rc<RefCell<BusConnector>> {
        let connector = app.add_connector(Self::new(app.context(), options));
        connector.borrow_mut().self_ref = Some(Rc::downgrade(&connector));
        let dynamic: ConnectorRef = connector.clone();
        app.set_default_connector(&dynamic);
        connector
    }

    /// The addresses actually bound by `start_listen` (useful when the
    /// configuration asked for port 0).
    pub fn bound_addresses(&self) -> &[SocketAddr] {
        &self.bound_addresses
    }

    fn self_ref(&self) -> Option<Weak<RefCell<BusConnector>>> {
        self.self_ref.clone()
    }

    fn identity_handshake(&self, challenge: u64, answer: Vec<u8>) -> Handshake {
        Handshake {
            node_id: self.context.node_id(),
            node_name: self.context.node_name(),
            version: PROTOCOL_VERSION,
            challenge,
            access_digest: answer,
            listen_addresses: self.options.advertise_addresses.clone(),
        }
    }

    fn handshake_frame(&self, stage: i32, handshake: Handshake) -> BusFrame {
        BusFrame::new(
            BusHeader {
                cmd: cmd::HANDSHAKE,
                message_type: stage,
                ret: 0,
                sequence: 0,
                src_bus_id: self.context.node_id(),
            },
            frame_body::Body::Handshake(handshake),
        )
    }

    /// Register an accepted (server-side) stream.
    pub(crate) fn accept_stream(&mut self, stream: TcpStream) {
        let Some(weak) = self.self_ref() else {
            return;
        };
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let session = spawn_session(weak, session_id, stream, true, None);
        self.sessions.insert(session_id, session);
    }

    fn register_outbound(&mut self, stream: TcpStream, handle: Option<HandleRef>) {
        let Some(weak) = self.self_ref() else {
            return;
        };
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let session = spawn_session(weak, session_id, stream, false, handle.clone());
        if let Some(handle) = &handle {
            self.session_by_handle.insert(handle.id(), session_id);
        }

        // the client speaks first
        let hello = self.handshake_frame(
            handshake_stage::HELLO,
            self.identity_handshake(session.our_challenge, Vec::new()),
        );
        session.send_raw(hello);
        self.sessions.insert(session_id, session);
    }

    fn learn_peer(&mut self, peer_id: u64, addresses: &[String]) {
        if peer_id == 0 {
            return;
        }
        if let Some(address) = addresses.iter().find(|a| !a.is_empty()) {
            self.known_peers.insert(peer_id, address.clone());
        }
    }

    fn session_ready(&mut self, session_id: u64) {
        let (peer_id, handle) = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.mark_ready();
            tracing::info!(
                "bus session {session_id} to {}({}) is ready",
                session.peer_id,
                session.peer_name
            );
            (session.peer_id, session.handle.clone())
        };

        if peer_id != 0 {
            self.session_by_peer.insert(peer_id, session_id);
            self.dialing.remove(&peer_id);
        }
        if let Some(handle) = handle {
            self.context.notify_handle_ready(&handle);
        }

        // release fallback sends parked for this peer
        if let Some(parked) = self.pending_by_peer.remove(&peer_id) {
            for queued in parked {
                let mut sequence = queued.message.sequence;
                self.send_on_session(
                    session_id,
                    queued.message.message_type,
                    &mut sequence,
                    &queued.message.payload,
                    queued.message.metadata.as_ref(),
                );
            }
        }
    }

    fn close_session(&mut self, session_id: u64, error_code: i32, notify: bool) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.close();

        // unacknowledged messages die with the session; the sender still
        // hears about it on the response path
        let lost_code = if error_code != 0 {
            error_code
        } else {
            AppError::Closing.code()
        };
        let peer = MessageSender {
            id: session.peer_id,
            name: session.peer_name.clone(),
        };
        for (_, (_, message)) in session.in_flight.drain() {
            self.context
                .receive_forward_response(peer.clone(), message, lost_code);
        }

        if let Some(handle) = &session.handle {
            self.session_by_handle.remove(&handle.id());
            self.handles.remove(&handle.id());
            if notify {
                self.context.notify_handle_closed(handle, error_code);
            }
        }
        if session.peer_id != 0 {
            let stale = self
                .session_by_peer
                .get(&session.peer_id)
                .is_some_and(|sid| *sid == session_id);
            if stale {
                self.session_by_peer.remove(&session.peer_id);
            }
        }
    }

    /// A session's reader task ended.
    pub(crate) fn on_session_closed(&mut self, session_id: u64, error_code: i32) {
        self.close_session(session_id, error_code, true);
    }

    /// A frame arrived on a session.
    pub(crate) fn on_frame(&mut self, session_id: u64, frame: BusFrame) {
        let header = frame.header();
        match (header.cmd, frame.body) {
            (cmd::HANDSHAKE, Some(frame_body::Body::Handshake(handshake))) => {
                self.on_handshake(session_id, header.message_type, handshake);
            }
            (cmd::FORWARD_REQUEST, Some(frame_body::Body::Forward(forward))) => {
                self.on_forward_request(session_id, header, forward);
            }
            (cmd::FORWARD_RESPONSE, _) => {
                self.on_forward_response(session_id, header);
            }
            (cmd::COMMAND_REQUEST, Some(frame_body::Body::Command(command))) => {
                self.on_command_request(session_id, header, command.lines);
            }
            (cmd::COMMAND_RESPONSE, _) => {
                // command responses are consumed by the one-shot client
            }
            (other, _) => {
                tracing::warn!("dropping frame with unknown cmd {other} on session {session_id}");
            }
        }
    }

    fn on_handshake(&mut self, session_id: u64, stage: i32, handshake: Handshake) {
        let tokens = self.options.access_tokens.clone();

        enum Next {
            Challenge(u64),
            Ready,
            AckThenReady(u64),
            Reject,
            Ignore,
        }

        let next = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            match (session.state, stage, session.is_server) {
                (SessionState::WaitingHello, handshake_stage::HELLO, true) => {
                    session.peer_id = handshake.node_id;
                    session.peer_name = handshake.node_name.clone();
                    Next::Challenge(handshake.challenge)
                }
                (SessionState::WaitingChallenge, handshake_stage::CHALLENGE, false) => {
                    if !handshake::verify_digest(
                        &tokens,
                        session.our_challenge,
                        &handshake.access_digest,
                    ) {
                        Next::Reject
                    } else {
                        session.peer_id = handshake.node_id;
                        session.peer_name = handshake.node_name.clone();
                        Next::AckThenReady(handshake.challenge)
                    }
                }
                (SessionState::WaitingAck, handshake_stage::ACK, true) => {
                    if !handshake::verify_digest(
                        &tokens,
                        session.our_challenge,
                        &handshake.access_digest,
                    ) {
                        Next::Reject
                    } else {
                        Next::Ready
                    }
                }
                _ => Next::Ignore,
            }
        };

        match next {
            Next::Challenge(peer_challenge) => {
                self.learn_peer(handshake.node_id, &handshake.listen_addresses);
                let answer = handshake::answer_digest(&tokens, peer_challenge);
                let (our_challenge, reply) = {
                    let session = self.sessions.get_mut(&session_id).expect("session exists");
                    session.state = SessionState::WaitingAck;
                    (session.our_challenge, session.writer_clone())
                };
                let frame = self.handshake_frame(
                    handshake_stage::CHALLENGE,
                    self.identity_handshake(our_challenge, answer),
                );
                let _ = reply.send(frame);
            }
            Next::AckThenReady(peer_challenge) => {
                self.learn_peer(handshake.node_id, &handshake.listen_addresses);
                let answer = handshake::answer_digest(&tokens, peer_challenge);
                let frame = self
                    .handshake_frame(handshake_stage::ACK, self.identity_handshake(0, answer));
                if let Some(session) = self.sessions.get(&session_id) {
                    session.send_raw(frame);
                }
                self.session_ready(session_id);
            }
            Next::Ready => {
                self.session_ready(session_id);
            }
            Next::Reject => {
                tracing::info!(
                    "bus session {session_id} is shutting down due to authentication failure"
                );
                self.close_session(session_id, AppError::ConnectPeerFailed.code(), true);
            }
            Next::Ignore => {
                tracing::warn!(
                    "unexpected handshake stage {stage} on session {session_id}, dropping"
                );
            }
        }
    }

    fn on_forward_request(&mut self, session_id: u64, header: BusHeader, forward: ForwardData) {
        let (state, peer_name, ack) = {
            let Some(session) = self.sessions.get(&session_id) else {
                return;
            };
            (
                session.state,
                session.peer_name.clone(),
                session.writer_clone(),
            )
        };
        if state != SessionState::Ready {
            tracing::warn!("inter-node message received on unauthenticated bus session");
            return;
        }

        let metadata: Option<Metadata> = forward.metadata.map(BusMetadata::into);
        self.context.receive_forward_request(
            MessageSender {
                id: header.src_bus_id,
                name: peer_name,
            },
            Message {
                message_type: header.message_type,
                sequence: header.sequence,
                payload: forward.payload,
                metadata,
            },
        );

        // the sender's delivery receipt
        let receipt = BusFrame::new(
            BusHeader {
                cmd: cmd::FORWARD_RESPONSE,
                message_type: header.message_type,
                ret: 0,
                sequence: header.sequence,
                src_bus_id: self.context.node_id(),
            },
            frame_body::Body::Forward(ForwardData {
                from: forward.to,
                to: forward.from,
                payload: Vec::new(),
                metadata: None,
            }),
        );
        let _ = ack.send(receipt);
    }

    fn on_forward_response(&mut self, session_id: u64, header: BusHeader) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let Some((_, message)) = session.in_flight.remove(&header.sequence) else {
            return;
        };
        let peer = MessageSender {
            id: session.peer_id,
            name: session.peer_name.clone(),
        };
        self.context.receive_forward_response(peer, message, header.ret);
    }

    fn on_command_request(&mut self, session_id: u64, header: BusHeader, words: Vec<String>) {
        let (peer, reply) = {
            let Some(session) = self.sessions.get(&session_id) else {
                return;
            };
            if session.state != SessionState::Ready {
                tracing::warn!("command received on unauthenticated bus session");
                return;
            }
            (
                MessageSender {
                    id: header.src_bus_id,
                    name: session.peer_name.clone(),
                },
                session.writer_clone(),
            )
        };

        let response_rx = self.context.receive_custom_command(peer, words);
        let node_id = self.context.node_id();
        tokio::task::spawn_local(async move {
            let Ok(lines) = response_rx.await else {
                return;
            };
            let frame = BusFrame::new(
                BusHeader {
                    cmd: cmd::COMMAND_RESPONSE,
                    message_type: 0,
                    ret: 0,
                    sequence: header.sequence,
                    src_bus_id: node_id,
                },
                frame_body::Body::Command(CommandData { lines }),
            );
            let _ = reply.send(frame);
        });
    }

    fn send_on_session(
        &mut self,
        session_id: u64,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32 {
        if *sequence == 0 {
            self.sequence += 1;
            *sequence = self.sequence;
        }
        let node_id = self.context.node_id();

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return AppError::SendFailed.code();
        };

        let frame = BusFrame::new(
            BusHeader {
                cmd: cmd::FORWARD_REQUEST,
                message_type,
                ret: 0,
                sequence: *sequence,
                src_bus_id: node_id,
            },
            frame_body::Body::Forward(ForwardData {
                from: node_id,
                to: session.peer_id,
                payload: payload.to_vec(),
                metadata: metadata.map(BusMetadata::from),
            }),
        );
        session.in_flight.insert(
            *sequence,
            (
                Instant::now(),
                Message::new(message_type, *sequence, payload, metadata),
            ),
        );
        session.send(frame);
        0
    }

    fn dial_fallback_peer(&mut self, target_id: u64, address: String) {
        if !self.dialing.insert(target_id) {
            return;
        }
        let Some(weak) = self.self_ref() else {
            return;
        };
        tokio::task::spawn_local(async move {
            let target = match Address::parse(&address) {
                Ok(addr) => addr.host_port(),
                Err(_) => {
                    if let Some(connector) = weak.upgrade() {
                        connector
                            .borrow_mut()
                            .fallback_dial_failed(target_id, AppError::NoAvailableAddress.code());
                    }
                    return;
                }
            };
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    if let Some(connector) = weak.upgrade() {
                        connector.borrow_mut().register_outbound(stream, None);
                    }
                }
                Err(err) => {
                    tracing::warn!("fallback dial to {target} failed: {err}");
                    if let Some(connector) = weak.upgrade() {
                        connector
                            .borrow_mut()
                            .fallback_dial_failed(target_id, AppError::ConnectPeerFailed.code());
                    }
                }
            }
        });
    }

    fn fallback_dial_failed(&mut self, target_id: u64, error_code: i32) {
        self.dialing.remove(&target_id);
        let Some(parked) = self.pending_by_peer.remove(&target_id) else {
            return;
        };
        for queued in parked {
            self.context.receive_forward_response(
                MessageSender::by_id(target_id),
                queued.message,
                error_code,
            );
        }
    }
}

impl Connector for BusConnector {
    fn name(&self) -> &'static str {
        "atbus"
    }

    fn schemes(&self) -> &[&'static str] {
        &["tcp", "ipv4", "ipv6", "dns"]
    }

    fn address_type(&self, addr: &Address) -> AddressType {
        let mut flags = AddressType::NONE;
        if addr.host.parse::<std::net::Ipv4Addr>().is_ok() {
            flags = flags.with(AddressType::IPV4);
        } else if addr.host.parse::<std::net::Ipv6Addr>().is_ok() {
            flags = flags.with(AddressType::IPV6);
        } else {
            flags = flags.with(AddressType::DNS);
        }
        if addr.host == "127.0.0.1" || addr.host == "::1" || addr.host == "localhost" {
            flags = flags.with(AddressType::LOCAL);
        }
        flags
    }

    fn start_listen(&mut self, addr: &Address) -> Result<(), AppError> {
        let std_listener = std::net::TcpListener::bind(addr.host_port()).map_err(|err| {
            tracing::error!("failed to bind {addr}: {err}");
            AppError::SetupBus
        })?;
        std_listener.set_nonblocking(true).map_err(|err| {
            tracing::error!("failed to prepare listener on {addr}: {err}");
            AppError::SetupBus
        })?;
        let listener = TcpListener::from_std(std_listener).map_err(|err| {
            tracing::error!("failed to register listener on {addr}: {err}");
            AppError::SetupBus
        })?;

        if let Ok(local) = listener.local_addr() {
            self.bound_addresses.push(local);
        }
        let Some(weak) = self.self_ref() else {
            tracing::error!("bus connector is not installed; call BusConnector::install");
            return Err(AppError::SetupBus);
        };
        self.listeners.push(listener::spawn_listener(weak, listener));
        Ok(())
    }

    fn start_connect(
        &mut self,
        node: &DiscoveryNode,
        addr: &Address,
        handle: &HandleRef,
    ) -> Result<(), AppError> {
        let Some(weak) = self.self_ref() else {
            return Err(AppError::SetupBus);
        };

        self.handles.insert(handle.id(), handle.clone());
        let context = self.context.clone();
        let handle = handle.clone();
        let target = addr.host_port();
        let node_id = node.id();

        tokio::task::spawn_local(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    if let Some(connector) = weak.upgrade() {
                        connector
                            .borrow_mut()
                            .register_outbound(stream, Some(handle));
                    }
                }
                Err(err) => {
                    tracing::warn!("connect to node {node_id} at {target} failed: {err}");
                    context.notify_handle_closed(&handle, AppError::ConnectPeerFailed.code());
                }
            }
        });
        Ok(())
    }

    fn close_handle(&mut self, handle: &HandleRef) {
        self.handles.remove(&handle.id());
        if let Some(session_id) = self.session_by_handle.remove(&handle.id()) {
            self.close_session(session_id, 0, false);
        }
    }

    fn send_forward_request(
        &mut self,
        handle: &HandleRef,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32 {
        let Some(&session_id) = self.session_by_handle.get(&handle.id()) else {
            return AppError::SendFailed.code();
        };
        self.send_on_session(session_id, message_type, sequence, payload, metadata)
    }

    fn send_fallback_request(
        &mut self,
        target_id: u64,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32 {
        if let Some(&session_id) = self.session_by_peer.get(&target_id) {
            return self.send_on_session(session_id, message_type, sequence, payload, metadata);
        }

        let Some(address) = self.known_peers.get(&target_id).cloned() else {
            return AppError::NodeNotFound.code();
        };

        if *sequence == 0 {
            self.sequence += 1;
            *sequence = self.sequence;
        }
        self.pending_by_peer
            .entry(target_id)
            .or_default()
            .push(QueuedForward {
                queued_at: Instant::now(),
                message: Message::new(message_type, *sequence, payload, metadata),
            });
        self.dial_fallback_peer(target_id, address);
        0
    }

    fn on_discovery_event(&mut self, action: DiscoveryAction, node: &Rc<DiscoveryNode>) {
        match action {
            DiscoveryAction::Put => {
                let address = node.info().gateways.iter().find_map(|gw| {
                    let addr = Address::parse(&gw.address).ok()?;
                    self.schemes()
                        .iter()
                        .any(|scheme| *scheme == addr.scheme)
                        .then(|| gw.address.clone())
                });
                if let Some(address) = address {
                    self.learn_peer(node.id(), &[address]);
                }
            }
            DiscoveryAction::Delete => {
                self.known_peers.remove(&node.id());
                if let Some(&session_id) = self.session_by_peer.get(&node.id()) {
                    self.close_session(session_id, 0, true);
                }
            }
        }
    }

    fn start_command_request(
        &mut self,
        addr: &Address,
        words: &[String],
        reply: oneshot::Sender<Result<Vec<String>, AppError>>,
    ) {
        let addr = addr.clone();
        let words = words.to_vec();
        let identity = (self.context.node_id(), self.context.node_name());
        let tokens = self.options.access_tokens.clone();
        tokio::task::spawn_local(async move {
            let result = crate::command::send_command(&addr, &words, identity, &tokens).await;
            let _ = reply.send(result);
        });
    }

    fn tick(&mut self, now: Instant) -> i32 {
        let deadline = self.options.inflight_timeout;
        let mut expired: Vec<(MessageSender, Message)> = Vec::new();

        for session in self.sessions.values_mut() {
            let overdue: Vec<u64> = session
                .in_flight
                .iter()
                .filter(|(_, (sent_at, _))| now.duration_since(*sent_at) > deadline)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in overdue {
                if let Some((_, message)) = session.in_flight.remove(&seq) {
                    expired.push((
                        MessageSender {
                            id: session.peer_id,
                            name: session.peer_name.clone(),
                        },
                        message,
                    ));
                }
            }
        }

        let stale_peers: Vec<u64> = self
            .pending_by_peer
            .iter()
            .filter(|(_, queue)| {
                queue
                    .first()
                    .is_some_and(|q| now.duration_since(q.queued_at) > deadline)
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stale_peers {
            if let Some(queue) = self.pending_by_peer.remove(&peer) {
                for queued in queue {
                    expired.push((MessageSender::by_id(peer), queued.message));
                }
            }
        }

        let count = expired.len() as i32;
        for (peer, message) in expired {
            self.context
                .receive_forward_response(peer, message, AppError::Timeout.code());
        }
        count
    }

    fn shutdown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        let session_ids: Vec<u64> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            self.close_session(session_id, 0, true);
        }
        self.session_by_handle.clear();
        self.session_by_peer.clear();
        self.handles.clear();
        self.pending_by_peer.clear();
        self.dialing.clear();
    }
}
