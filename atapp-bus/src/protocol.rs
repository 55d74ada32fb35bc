// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Over-the-wire protocol for the bus transport
//!
//! Every frame is one [BusFrame]: a fixed [BusHeader] (`cmd`, `type`,
//! `ret`, `sequence`, `src_bus_id`) plus a body variant. Frames travel
//! length-prefixed (a big-endian `u64` byte count, then the prost-encoded
//! frame).

use std::collections::BTreeMap;

use prost::Message as ProstMessage;

/// Protocol revision carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Header `cmd` values.
pub mod cmd {
    /// Handshake stage (stage in `message_type`)
    pub const HANDSHAKE: i32 = 1;
    /// Application message delivery
    pub const FORWARD_REQUEST: i32 = 2;
    /// Delivery receipt for a forward request
    pub const FORWARD_RESPONSE: i32 = 3;
    /// Custom command submission
    pub const COMMAND_REQUEST: i32 = 4;
    /// Custom command response lines
    pub const COMMAND_RESPONSE: i32 = 5;
}

/// Handshake stages, carried in the header `message_type` field.
pub mod handshake_stage {
    /// Client announces itself and offers a challenge
    pub const HELLO: i32 = 0;
    /// Server answers the challenge and offers its own
    pub const CHALLENGE: i32 = 1;
    /// Client answers the server challenge
    pub const ACK: i32 = 2;
}

/// The fixed frame header.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BusHeader {
    /// One of the [cmd] values
    #[prost(int32, tag = "1")]
    pub cmd: i32,
    /// Application message type (or handshake stage)
    #[prost(int32, tag = "2")]
    pub message_type: i32,
    /// Status code; `0` means success
    #[prost(int32, tag = "3")]
    pub ret: i32,
    /// Message sequence
    #[prost(uint64, tag = "4")]
    pub sequence: u64,
    /// Sender's node id
    #[prost(uint64, tag = "5")]
    pub src_bus_id: u64,
}

/// Routing metadata attached to a forwarded message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BusMetadata {
    /// Namespace of the sender
    #[prost(string, tag = "1")]
    pub namespace_name: String,
    /// Free-form labels
    #[prost(btree_map = "string, string", tag = "2")]
    pub labels: BTreeMap<String, String>,
}

impl From<&atapp::Metadata> for BusMetadata {
    fn from(value: &atapp::Metadata) -> Self {
        Self {
            namespace_name: value.namespace_name.clone(),
            labels: value.labels.clone(),
        }
    }
}

impl From<BusMetadata> for atapp::Metadata {
    fn from(value: BusMetadata) -> Self {
        Self {
            namespace_name: value.namespace_name,
            labels: value.labels,
        }
    }
}

/// An application message in flight.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardData {
    /// Originating node id
    #[prost(uint64, tag = "1")]
    pub from: u64,
    /// Destination node id
    #[prost(uint64, tag = "2")]
    pub to: u64,
    /// Opaque payload
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    /// Optional routing metadata
    #[prost(message, optional, tag = "4")]
    pub metadata: Option<BusMetadata>,
}

/// Identity announcement and challenge material.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    /// Announcing node's id
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    /// Announcing node's name
    #[prost(string, tag = "2")]
    pub node_name: String,
    /// Protocol revision
    #[prost(uint32, tag = "3")]
    pub version: u32,
    /// Random challenge the peer must answer when access tokens are
    /// configured
    #[prost(uint64, tag = "4")]
    pub challenge: u64,
    /// HMAC-SHA-256 answer to the peer's previous challenge
    #[prost(bytes = "vec", tag = "5")]
    pub access_digest: Vec<u8>,
    /// Listen addresses other nodes may dial back
    #[prost(string, repeated, tag = "6")]
    pub listen_addresses: Vec<String>,
}

/// Custom command words (request) or response lines (response).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandData {
    /// Words or lines, depending on the header `cmd`
    #[prost(string, repeated, tag = "1")]
    pub lines: Vec<String>,
}

/// One frame on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BusFrame {
    /// The fixed header; always present on valid frames
    #[prost(message, optional, tag = "1")]
    pub header: Option<BusHeader>,
    /// The body matching the header `cmd`
    #[prost(oneof = "frame_body::Body", tags = "2, 3, 4")]
    pub body: Option<frame_body::Body>,
}

/// Body variants of a [BusFrame].
pub mod frame_body {
    /// The oneof payload of a frame.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Handshake material
        #[prost(message, tag = "2")]
        Handshake(super::Handshake),
        /// Forwarded application message
        #[prost(message, tag = "3")]
        Forward(super::ForwardData),
        /// Custom command words or response lines
        #[prost(message, tag = "4")]
        Command(super::CommandData),
    }
}

impl BusFrame {
    /// Build a frame from its header and body.
    pub fn new(header: BusHeader, body: frame_body::Body) -> Self {
        Self {
            header: Some(header),
            body: Some(body),
        }
    }

    /// The header, defaulting when a malformed peer omitted it.
    pub fn header(&self) -> BusHeader {
        self.header.clone().unwrap_or_default()
    }

    /// Encode with the length prefix, ready to write.
    pub fn to_wire(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(len + std::mem::size_of::<u64>());
        buf.extend_from_slice(&(len as u64).to_be_bytes());
        self.encode(&mut buf)
            .expect("buffer should have enough capacity");
        buf
    }
}
