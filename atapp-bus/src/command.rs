// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! One-shot command client
//!
//! Implements the CLI side of `stop`/`reload`/`run`: connect to a running
//! instance's listen address, complete the handshake, submit the command
//! words and wait for the response lines. The whole exchange is a single
//! future; callers bound it with a deadline (the app uses its configured
//! stop timeout).

use tokio::net::TcpStream;

use atapp::address::Address;
use atapp::errors::AppError;

use crate::handshake;
use crate::net::{read_frame, write_frame};
use crate::protocol::{
    cmd, frame_body, handshake_stage, BusFrame, BusHeader, CommandData, Handshake,
    PROTOCOL_VERSION,
};

fn frame(node_id: u64, cmd: i32, stage_or_type: i32, body: frame_body::Body) -> BusFrame {
    BusFrame::new(
        BusHeader {
            cmd,
            message_type: stage_or_type,
            ret: 0,
            sequence: 1,
            src_bus_id: node_id,
        },
        body,
    )
}

/// Deliver `words` to the instance listening at `addr` and return its
/// response lines.
pub async fn send_command(
    addr: &Address,
    words: &[String],
    identity: (u64, String),
    tokens: &[String],
) -> Result<Vec<String>, AppError> {
    if words.is_empty() {
        return Err(AppError::CommandIsNull);
    }

    let mut stream = TcpStream::connect(addr.host_port()).await.map_err(|err| {
        tracing::error!("failed to connect to {addr}: {err}");
        AppError::ConnectPeerFailed
    })?;

    let (node_id, node_name) = identity;
    let our_challenge: u64 = rand::random();

    // stage 1: announce ourselves
    let hello = frame(
        node_id,
        cmd::HANDSHAKE,
        handshake_stage::HELLO,
        frame_body::Body::Handshake(Handshake {
            node_id,
            node_name: node_name.clone(),
            version: PROTOCOL_VERSION,
            challenge: our_challenge,
            access_digest: Vec::new(),
            listen_addresses: Vec::new(),
        }),
    );
    write_frame(&mut stream, &hello)
        .await
        .map_err(|_| AppError::ConnectPeerFailed)?;

    // stage 2/3: answer the server challenge, then submit the command
    loop {
        let incoming = read_frame(&mut stream)
            .await
            .map_err(|_| AppError::ConnectPeerFailed)?;
        let header = incoming.header();
        match (header.cmd, incoming.body) {
            (cmd::HANDSHAKE, Some(frame_body::Body::Handshake(challenge))) => {
                if !handshake::verify_digest(tokens, our_challenge, &challenge.access_digest) {
                    tracing::error!("peer {addr} failed our access-token challenge");
                    return Err(AppError::ConnectPeerFailed);
                }

                let ack = frame(
                    node_id,
                    cmd::HANDSHAKE,
                    handshake_stage::ACK,
                    frame_body::Body::Handshake(Handshake {
                        node_id,
                        node_name: node_name.clone(),
                        version: PROTOCOL_VERSION,
                        challenge: 0,
                        access_digest: handshake::answer_digest(tokens, challenge.challenge),
                        listen_addresses: Vec::new(),
                    }),
                );
                write_frame(&mut stream, &ack)
                    .await
                    .map_err(|_| AppError::ConnectPeerFailed)?;

                let request = frame(
                    node_id,
                    cmd::COMMAND_REQUEST,
                    0,
                    frame_body::Body::Command(CommandData {
                        lines: words.to_vec(),
                    }),
                );
                write_frame(&mut stream, &request)
                    .await
                    .map_err(|_| AppError::SendFailed)?;
            }
            (cmd::COMMAND_RESPONSE, Some(frame_body::Body::Command(response))) => {
                return Ok(response.lines);
            }
            (other, _) => {
                tracing::debug!("ignoring frame cmd {other} while waiting for command response");
            }
        }
    }
}
