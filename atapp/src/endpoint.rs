// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Per-peer endpoint state
//!
//! An [Endpoint] owns everything the router knows about one peer: the
//! current discovery snapshot, the connection handles bound to it, and the
//! FIFO queue of messages waiting for a ready connection. Buffered
//! messages carry an expiry; the endpoint re-arms the app's waker queue so
//! that expiry and post-reconnect draining both happen on a tick.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::connector::HandleRef;
use crate::discovery::DiscoveryNode;
use crate::errors::AppError;
use crate::message::{Message, MessageSender, Metadata};
use crate::waker::WakerQueue;

/// Shared reference to an endpoint.
pub type EndpointRef = Rc<RefCell<Endpoint>>;
/// Weak reference to an endpoint, as stored in the waker queue.
pub type EndpointWeak = Weak<RefCell<Endpoint>>;

/// A response the router synthesized on behalf of a transport - enqueue
/// rejections, expiry, cancellation. Dispatched to the application's
/// observer right after the operation that produced it.
#[derive(Debug)]
pub(crate) struct RoutedResponse {
    /// The peer the original message was addressed to
    pub source: MessageSender,
    /// The original message
    pub message: Message,
    /// Taxonomy code describing the failure
    pub error_code: i32,
}

/// Borrowed slices of app state an endpoint operation may touch.
pub(crate) struct EndpointOps<'a> {
    /// Cached tick time
    pub now: Instant,
    /// Expiry assigned to newly buffered messages
    pub message_timeout: Duration,
    /// Max buffered messages; `0` means unbounded
    pub send_buffer_number: u64,
    /// Max buffered bytes; `0` means unbounded
    pub send_buffer_size: u64,
    /// Whether the app refuses new wakers (shutting down)
    pub app_closing: bool,
    /// The app waker queue
    pub waker: &'a mut WakerQueue,
    /// Synthesized responses collected for dispatch by the caller
    pub responses: &'a mut Vec<RoutedResponse>,
}

struct PendingMessage {
    message: Message,
    expire_at: Instant,
}

/// Per-peer routing state. Always lives behind an [EndpointRef] created by
/// [Endpoint::create].
pub struct Endpoint {
    watcher: EndpointWeak,
    closing: bool,
    discovery: Option<Rc<DiscoveryNode>>,
    handles: Vec<HandleRef>,
    pending: VecDeque<PendingMessage>,
    pending_bytes: u64,
    pending_count: u64,
    nearest_wake_at: Option<Instant>,
}

impl Endpoint {
    /// Create a fresh endpoint with no discovery snapshot and no handles.
    pub fn create() -> EndpointRef {
        let endpoint = Rc::new_cyclic(|watcher: &EndpointWeak| {
            RefCell::new(Self {
                watcher: watcher.clone(),
                closing: false,
                discovery: None,
                handles: Vec::new(),
                pending: VecDeque::new(),
                pending_bytes: 0,
                pending_count: 0,
                nearest_wake_at: None,
            })
        });
        tracing::info!("create atapp endpoint {:p}", Rc::as_ptr(&endpoint));
        endpoint
    }

    /// The peer's node id, `0` before any discovery snapshot arrived.
    pub fn id(&self) -> u64 {
        self.discovery.as_ref().map(|d| d.id()).unwrap_or(0)
    }

    /// The peer's node name, empty before any discovery snapshot arrived.
    pub fn name(&self) -> &str {
        self.discovery.as_ref().map(|d| d.name()).unwrap_or("")
    }

    /// The current discovery snapshot.
    pub fn discovery(&self) -> Option<&Rc<DiscoveryNode>> {
        self.discovery.as_ref()
    }

    /// Whether the endpoint is tearing down.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Replace the discovery snapshot.
    pub fn update_discovery(&mut self, discovery: Rc<DiscoveryNode>) {
        if let Some(current) = &self.discovery {
            if Rc::ptr_eq(current, &discovery) {
                return;
            }
        }
        tracing::info!(
            "update atapp endpoint {:p} with {}({})",
            self as *const _,
            discovery.id(),
            discovery.name()
        );
        self.discovery = Some(discovery);
    }

    /// Messages currently buffered.
    pub fn pending_count(&self) -> u64 {
        self.pending_count
    }

    /// Bytes currently buffered.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub(crate) fn add_handle(&mut self, handle: HandleRef) {
        if self.closing {
            return;
        }
        if self.handles.iter().any(|h| h.id() == handle.id()) {
            return;
        }
        self.handles.push(handle);
    }

    pub(crate) fn remove_handle(&mut self, handle_id: u64) {
        self.handles.retain(|h| h.id() != handle_id);
    }

    /// Whether any handle (ready or not) is still bound.
    pub fn has_connection_handle(&self) -> bool {
        !self.handles.is_empty()
    }

    /// The first ready handle in binding order, if any.
    pub fn ready_handle(&self) -> Option<HandleRef> {
        self.handles.iter().find(|h| h.is_ready()).cloned()
    }

    // The handle a synthesized failure is attributed to: a ready one when
    // available, else any still-bound one.
    fn response_handle(&self) -> Option<HandleRef> {
        self.ready_handle().or_else(|| self.handles.first().cloned())
    }

    fn sender_identity(&self) -> MessageSender {
        MessageSender {
            id: self.id(),
            name: self.name().to_string(),
        }
    }

    fn push_response(
        &self,
        responses: &mut Vec<RoutedResponse>,
        message: Message,
        error_code: i32,
    ) {
        responses.push(RoutedResponse {
            source: self.sender_identity(),
            message,
            error_code,
        });
    }

    fn send_through(
        handle: &HandleRef,
        message_type: i32,
        sequence: &mut u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> i32 {
        match handle.connector() {
            Some(connector) => connector.borrow_mut().send_forward_request(
                handle,
                message_type,
                sequence,
                payload,
                metadata,
            ),
            None => AppError::SendFailed.code(),
        }
    }

    /// Queue (or immediately send) an outgoing message. Returns the
    /// sequence as known so far (`0` until a connector assigns one) and a
    /// status code; enqueue failures additionally synthesize a response
    /// through `ops.responses`.
    pub(crate) fn push_forward_message(
        &mut self,
        ops: &mut EndpointOps<'_>,
        message_type: i32,
        mut sequence: u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> (u64, i32) {
        if self.closing {
            if self.ready_handle().is_some() {
                self.push_response(
                    ops.responses,
                    Message::new(message_type, sequence, payload, metadata),
                    AppError::Closing.code(),
                );
            }
            return (sequence, AppError::Closing.code());
        }

        if payload.is_empty() {
            return (sequence, 0);
        }

        // Fast path: nothing buffered and a live connection
        if self.pending.is_empty() {
            if let Some(handle) = self.ready_handle() {
                let ret =
                    Self::send_through(&handle, message_type, &mut sequence, payload, metadata);
                if ret != 0 {
                    self.push_response(
                        ops.responses,
                        Message::new(message_type, sequence, payload, metadata),
                        ret,
                    );
                }
                return (sequence, ret);
            }
        }

        let over_count = ops.send_buffer_number > 0 && self.pending_count + 1 > ops.send_buffer_number;
        let over_bytes =
            ops.send_buffer_size > 0 && self.pending_bytes + payload.len() as u64 > ops.send_buffer_size;
        if over_count || over_bytes {
            let code = AppError::BufferLimit.code();
            if self.response_handle().is_some() {
                self.push_response(
                    ops.responses,
                    Message::new(message_type, sequence, payload, metadata),
                    code,
                );
            }
            return (sequence, code);
        }

        let expire_at = ops.now + ops.message_timeout;
        self.pending.push_back(PendingMessage {
            message: Message::new(message_type, sequence, payload, metadata),
            expire_at,
        });
        self.pending_bytes += payload.len() as u64;
        self.pending_count += 1;

        self.add_waker(expire_at, ops);
        (sequence, 0)
    }

    /// Drain the pending queue: deliver through a ready handle while the
    /// `max_count` budget lasts, expire overdue entries, and re-arm the
    /// waker for whatever remains. Returns the number of entries consumed.
    pub(crate) fn retry_pending_messages(
        &mut self,
        ops: &mut EndpointOps<'_>,
        max_count: i32,
    ) -> i32 {
        if self
            .nearest_wake_at
            .is_some_and(|nearest| nearest <= ops.now)
        {
            self.nearest_wake_at = None;
        }

        if self.pending.is_empty() {
            return 0;
        }

        let mut budget = if max_count <= 0 { i32::MAX } else { max_count };
        let ready = self.ready_handle();
        let mut processed = 0;

        while let Some(front) = self.pending.front_mut() {
            let mut result = AppError::Timeout.code();
            match ready.as_ref() {
                Some(handle) if budget > 0 => {
                    budget -= 1;
                    result = Self::send_through(
                        handle,
                        front.message.message_type,
                        &mut front.message.sequence,
                        &front.message.payload,
                        front.message.metadata.as_ref(),
                    );
                }
                _ if front.expire_at > ops.now => break,
                _ => {}
            }

            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            let entry_bytes = entry.message.payload.len() as u64;
            if result != 0 && self.response_handle().is_some() {
                self.push_response(ops.responses, entry.message, result);
            }

            processed += 1;
            self.pending_bytes = self.pending_bytes.saturating_sub(entry_bytes);
            self.pending_count = self.pending_count.saturating_sub(1);
        }

        if self.pending.is_empty() {
            self.pending_bytes = 0;
            self.pending_count = 0;
        } else if let Some(front) = self.pending.front() {
            let expire_at = front.expire_at;
            self.add_waker(expire_at, ops);
        }

        processed
    }

    /// Register a wake-up iff it is earlier than the one already
    /// scheduled.
    pub(crate) fn add_waker(&mut self, wake_at: Instant, ops: &mut EndpointOps<'_>) {
        if self.nearest_wake_at.is_some_and(|nearest| wake_at >= nearest) {
            return;
        }
        if ops.app_closing {
            return;
        }
        ops.waker.insert(wake_at, self.watcher.clone());
        self.nearest_wake_at = Some(wake_at);
    }

    /// Cancel every pending message with a `Closing` response and unbind
    /// all handles. Idempotent: a second call finds nothing to do.
    pub(crate) fn reset(&mut self, responses: &mut Vec<RoutedResponse>) {
        if self.closing {
            return;
        }
        self.closing = true;

        while let Some(entry) = self.pending.pop_front() {
            self.push_response(responses, entry.message, AppError::Closing.code());
        }
        self.pending_bytes = 0;
        self.pending_count = 0;

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            handle.clear_endpoint();
        }

        self.closing = false;
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        tracing::info!("destroy atapp endpoint {:p}", self as *const _);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryNode, DiscoveryNodeInfo};

    fn ops<'a>(
        now: Instant,
        waker: &'a mut WakerQueue,
        responses: &'a mut Vec<RoutedResponse>,
    ) -> EndpointOps<'a> {
        EndpointOps {
            now,
            message_timeout: Duration::from_secs(5),
            send_buffer_number: 0,
            send_buffer_size: 0,
            app_closing: false,
            waker,
            responses,
        }
    }

    fn test_node(id: u64, name: &str) -> Rc<DiscoveryNode> {
        DiscoveryNode::new(DiscoveryNodeInfo {
            id,
            name: name.to_string(),
            ..DiscoveryNodeInfo::default()
        })
    }

    #[test]
    fn buffered_messages_track_counters() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let now = Instant::now();

        let mut guard = endpoint.borrow_mut();
        for i in 0..3 {
            let (_, code) = guard.push_forward_message(
                &mut ops(now, &mut waker, &mut responses),
                7,
                0,
                &vec![0u8; 10 + i],
                None,
            );
            assert_eq!(0, code);
        }

        assert_eq!(3, guard.pending_count());
        assert_eq!(33, guard.pending_bytes());
        assert!(responses.is_empty());
        // only the earliest wake needed scheduling
        assert_eq!(1, waker.len());
    }

    #[test]
    fn empty_payload_is_a_successful_noop() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();

        let (_, code) = endpoint.borrow_mut().push_forward_message(
            &mut ops(Instant::now(), &mut waker, &mut responses),
            1,
            0,
            b"",
            None,
        );
        assert_eq!(0, code);
        assert_eq!(0, endpoint.borrow().pending_count());
    }

    #[test]
    fn buffer_count_limit_rejects() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let now = Instant::now();

        let mut guard = endpoint.borrow_mut();
        for _ in 0..4 {
            let mut o = ops(now, &mut waker, &mut responses);
            o.send_buffer_number = 4;
            let (_, code) = guard.push_forward_message(&mut o, 1, 0, b"x", None);
            assert_eq!(0, code);
        }

        let mut o = ops(now, &mut waker, &mut responses);
        o.send_buffer_number = 4;
        let (_, code) = guard.push_forward_message(&mut o, 1, 0, b"x", None);
        assert_eq!(AppError::BufferLimit.code(), code);
        assert_eq!(4, guard.pending_count());
    }

    #[test]
    fn buffer_bytes_limit_rejects() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let now = Instant::now();

        let mut guard = endpoint.borrow_mut();
        let mut o = ops(now, &mut waker, &mut responses);
        o.send_buffer_size = 15;
        let (_, code) = guard.push_forward_message(&mut o, 1, 0, &[0u8; 10], None);
        assert_eq!(0, code);

        let mut o = ops(now, &mut waker, &mut responses);
        o.send_buffer_size = 15;
        let (_, code) = guard.push_forward_message(&mut o, 1, 0, &[0u8; 10], None);
        assert_eq!(AppError::BufferLimit.code(), code);
        assert_eq!(10, guard.pending_bytes());
    }

    #[test]
    fn expiry_drops_messages_and_reports_timeout() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let start = Instant::now();

        {
            let mut guard = endpoint.borrow_mut();
            guard.update_discovery(test_node(2, "svc-b"));
            // a bound but never-ready handle: expiry must still report
            let handle = crate::connector::ConnectionHandle::new();
            guard.add_handle(handle);

            let mut o = ops(start, &mut waker, &mut responses);
            o.message_timeout = Duration::from_millis(500);
            let (_, code) = guard.push_forward_message(&mut o, 7, 0, &[0u8; 10], None);
            assert_eq!(0, code);
        }

        let later = start + Duration::from_millis(600);
        let processed = endpoint.borrow_mut().retry_pending_messages(
            &mut ops(later, &mut waker, &mut responses),
            128,
        );

        assert_eq!(1, processed);
        assert_eq!(1, responses.len());
        assert_eq!(AppError::Timeout.code(), responses[0].error_code);
        assert_eq!(2, responses[0].source.id);
        assert_eq!(0, endpoint.borrow().pending_count());
        assert_eq!(0, endpoint.borrow().pending_bytes());
    }

    #[test]
    fn unexpired_messages_survive_retry_without_handle() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let start = Instant::now();

        endpoint.borrow_mut().push_forward_message(
            &mut ops(start, &mut waker, &mut responses),
            1,
            0,
            b"abc",
            None,
        );

        let processed = endpoint.borrow_mut().retry_pending_messages(
            &mut ops(start + Duration::from_millis(1), &mut waker, &mut responses),
            128,
        );
        assert_eq!(0, processed);
        assert_eq!(1, endpoint.borrow().pending_count());
        assert!(responses.is_empty());
    }

    #[test]
    fn reset_cancels_pending_with_closing() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let now = Instant::now();

        {
            let mut guard = endpoint.borrow_mut();
            for _ in 0..2 {
                guard.push_forward_message(
                    &mut ops(now, &mut waker, &mut responses),
                    1,
                    0,
                    b"data",
                    None,
                );
            }
        }

        let mut cancelled = Vec::new();
        endpoint.borrow_mut().reset(&mut cancelled);
        assert_eq!(2, cancelled.len());
        assert!(cancelled
            .iter()
            .all(|r| r.error_code == AppError::Closing.code()));
        assert_eq!(0, endpoint.borrow().pending_count());

        // second reset finds nothing
        let mut again = Vec::new();
        endpoint.borrow_mut().reset(&mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn waker_only_rearms_for_earlier_deadlines() {
        let endpoint = Endpoint::create();
        let mut waker = WakerQueue::default();
        let mut responses = Vec::new();
        let now = Instant::now();

        let mut guard = endpoint.borrow_mut();
        guard.add_waker(
            now + Duration::from_secs(5),
            &mut ops(now, &mut waker, &mut responses),
        );
        assert_eq!(1, waker.len());

        // an equal-or-later deadline is a no-op
        guard.add_waker(
            now + Duration::from_secs(5),
            &mut ops(now, &mut waker, &mut responses),
        );
        guard.add_waker(
            now + Duration::from_secs(6),
            &mut ops(now, &mut waker, &mut responses),
        );
        assert_eq!(1, waker.len());

        guard.add_waker(
            now + Duration::from_secs(1),
            &mut ops(now, &mut waker, &mut responses),
        );
        assert_eq!(2, waker.len());
    }
}
