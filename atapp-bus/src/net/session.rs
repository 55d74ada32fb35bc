// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! One TCP session to one peer: framed reader/writer tasks plus the
//! connector-side bookkeeping record
//!
//! The writer drains an unbounded frame queue; the reader loops on
//! length-prefixed frames and hands each one back to the connector. EOF
//! and connection resets are informational - sockets open, they close,
//! the world goes round - anything else is logged at error level.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Weak;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use atapp::errors::AppError;
use atapp::{HandleRef, Message};

use crate::connector::BusConnector;
use crate::protocol::BusFrame;

/// Handshake progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Server side, waiting for the client hello
    WaitingHello,
    /// Client side, waiting for the server challenge
    WaitingChallenge,
    /// Server side, waiting for the client's challenge answer
    WaitingAck,
    /// Authenticated and open for traffic
    Ready,
}

/// Connector-side record of one live session.
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) is_server: bool,
    pub(crate) state: SessionState,
    pub(crate) peer_id: u64,
    pub(crate) peer_name: String,
    pub(crate) peer_addr: SocketAddr,
    /// Challenge this node issued; the peer must answer it when access
    /// tokens are configured
    pub(crate) our_challenge: u64,
    /// Present on sessions opened through `start_connect`
    pub(crate) handle: Option<HandleRef>,
    writer: mpsc::UnboundedSender<BusFrame>,
    /// Frames queued until the handshake completes
    pending: Vec<BusFrame>,
    /// Sent-but-unacknowledged forwards, by sequence
    pub(crate) in_flight: HashMap<u64, (Instant, Message)>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Queue a frame: straight to the writer once ready, buffered during
    /// the handshake.
    pub(crate) fn send(&mut self, frame: BusFrame) {
        if self.state == SessionState::Ready {
            let _ = self.writer.send(frame);
        } else {
            self.pending.push(frame);
        }
    }

    /// Bypass the ready gate; handshake frames only.
    pub(crate) fn send_raw(&self, frame: BusFrame) {
        let _ = self.writer.send(frame);
    }

    /// A writer-queue sender for tasks that respond asynchronously.
    pub(crate) fn writer_clone(&self) -> mpsc::UnboundedSender<BusFrame> {
        self.writer.clone()
    }

    /// Mark the session ready and release everything buffered behind the
    /// handshake.
    pub(crate) fn mark_ready(&mut self) {
        self.state = SessionState::Ready;
        for frame in self.pending.drain(..) {
            let _ = self.writer.send(frame);
        }
    }

    /// Stop both IO tasks. Dropping the writer channel closes the socket.
    pub(crate) fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Split `stream` into reader/writer tasks wired to `connector` and
/// return the session record (not yet registered).
pub(crate) fn spawn_session(
    connector: Weak<RefCell<BusConnector>>,
    session_id: u64,
    stream: TcpStream,
    is_server: bool,
    handle: Option<HandleRef>,
) -> Session {
    let peer_addr = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<BusFrame>();

    let writer_task = tokio::task::spawn_local(async move {
        while let Some(frame) = writer_rx.recv().await {
            if let Err(write_err) = super::write_frame(&mut write_half, &frame).await {
                tracing::warn!("error writing to the stream '{write_err}'");
                break;
            }
        }
    });

    let reader_connector = connector.clone();
    let reader_task = tokio::task::spawn_local(async move {
        loop {
            match super::read_frame(&mut read_half).await {
                Ok(frame) => {
                    let Some(connector) = reader_connector.upgrade() else {
                        break;
                    };
                    connector.borrow_mut().on_frame(session_id, frame);
                }
                Err(err) => {
                    let code = match err.kind() {
                        tokio::io::ErrorKind::UnexpectedEof
                        | tokio::io::ErrorKind::ConnectionReset => {
                            tracing::trace!("stream closed ({err})");
                            0
                        }
                        _ => {
                            tracing::error!("error on session {session_id} stream: {err}");
                            AppError::SendFailed.code()
                        }
                    };
                    if let Some(connector) = reader_connector.upgrade() {
                        connector.borrow_mut().on_session_closed(session_id, code);
                    }
                    break;
                }
            }
        }
    });

    Session {
        id: session_id,
        is_server,
        state: if is_server {
            SessionState::WaitingHello
        } else {
            SessionState::WaitingChallenge
        },
        peer_id: 0,
        peer_name: String::new(),
        peer_addr,
        our_challenge: rand::random(),
        handle,
        writer: writer_tx,
        pending: Vec::new(),
        in_flight: HashMap::new(),
        tasks: vec![writer_task, reader_task],
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::info!("TCP session closed for {}", self.peer_addr);
        self.close();
    }
}
