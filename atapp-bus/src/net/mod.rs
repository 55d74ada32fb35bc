// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Frame IO over byte streams
//!
//! Frames travel as a big-endian `u64` length followed by the
//! prost-encoded [crate::protocol::BusFrame]. Both the session tasks and
//! the one-shot command client read and write through these helpers.

use bytes::Bytes;
use prost::Message as ProstMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::BusFrame;

pub(crate) mod listener;
pub(crate) mod session;

/// Largest frame accepted off the wire. Anything bigger is treated as a
/// protocol violation and tears the session down.
pub(crate) const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R>(stream: &mut R) -> Result<BusFrame, tokio::io::Error>
where
    R: AsyncRead + Unpin,
{
    let length = stream.read_u64().await?;
    if length > MAX_FRAME_BYTES {
        return Err(tokio::io::Error::new(
            tokio::io::ErrorKind::InvalidData,
            format!("oversized frame ({length} bytes)"),
        ));
    }

    let mut buf = vec![0u8; length as usize];
    stream.read_exact(&mut buf).await?;
    tracing::trace!("payload of length({}) received", buf.len());

    BusFrame::decode(Bytes::from(buf)).map_err(|decode_err| {
        tokio::io::Error::new(
            tokio::io::ErrorKind::InvalidData,
            format!("error decoding network message: '{decode_err}'"),
        )
    })
}

/// Write one length-prefixed frame and flush.
pub(crate) async fn write_frame<W>(stream: &mut W, frame: &BusFrame) -> Result<(), tokio::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.to_wire();
    tracing::trace!("writing payload (len={})", buf.len() - 8);
    stream.write_all(&buf).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{cmd, frame_body, BusFrame, BusHeader, CommandData};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = BusFrame::new(
            BusHeader {
                cmd: cmd::COMMAND_REQUEST,
                message_type: 0,
                ret: 0,
                sequence: 9,
                src_bus_id: 3,
            },
            frame_body::Body::Command(CommandData {
                lines: vec!["stop".to_string()],
            }),
        );

        write_frame(&mut client, &frame).await.expect("write");
        let decoded = read_frame(&mut server).await.expect("read");
        assert_eq!(frame, decoded);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_u64(MAX_FRAME_BYTES + 1).await;
        });

        let err = read_frame(&mut server).await.expect_err("must reject");
        assert_eq!(tokio::io::ErrorKind::InvalidData, err.kind());
    }
}
