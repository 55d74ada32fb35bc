// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Typed message envelope exchanged between nodes
//!
//! A [Message] is what the router moves around: an application-defined
//! `message_type` discriminator, a transport-assigned `sequence`, an opaque
//! payload and optional routing [Metadata]. The framework never interprets
//! the payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Routing metadata attached to a message or advertised by a node.
///
/// Gateways on remote nodes may constrain which peers can use them by
/// namespace and labels; the same shape is carried per-message so receivers
/// can demultiplex without decoding the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// The namespace this message or node belongs to
    #[serde(default)]
    pub namespace_name: String,
    /// Free-form labels. Ordered so that serialized forms are stable.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    /// Look up a label value by key, treating an empty value as absent.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|v| v.as_str()).filter(|v| !v.is_empty())
    }
}

/// A message moving through the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Application-defined type discriminator
    pub message_type: i32,
    /// Sequence number. `0` means "not yet assigned" - the connector
    /// allocates one when the message actually hits the wire.
    pub sequence: u64,
    /// Opaque payload bytes (owned copy)
    pub payload: Vec<u8>,
    /// Optional routing metadata (owned copy)
    pub metadata: Option<Metadata>,
}

impl Message {
    /// Build a message from borrowed parts, copying the payload and metadata.
    pub fn new(
        message_type: i32,
        sequence: u64,
        payload: &[u8],
        metadata: Option<&Metadata>,
    ) -> Self {
        Self {
            message_type,
            sequence,
            payload: payload.to_vec(),
            metadata: metadata.cloned(),
        }
    }
}

/// Identifies the remote party of a forward request or response.
///
/// `id` is `0` and `name` empty when the transport could not attribute the
/// message to a discovered node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSender {
    /// Numeric node id of the remote party
    pub id: u64,
    /// Node name of the remote party
    pub name: String,
}

impl MessageSender {
    /// A sender known only by id.
    pub fn by_id(id: u64) -> Self {
        Self {
            id,
            name: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_label_lookup_skips_empty() {
        let mut meta = Metadata::default();
        meta.labels.insert("zone".to_string(), "z1".to_string());
        meta.labels.insert("rack".to_string(), String::new());
        assert_eq!(Some("z1"), meta.label("zone"));
        assert_eq!(None, meta.label("rack"));
        assert_eq!(None, meta.label("missing"));
    }

    #[test]
    fn message_copies_parts() {
        let meta = Metadata {
            namespace_name: "ns".to_string(),
            labels: BTreeMap::new(),
        };
        let msg = Message::new(7, 0, b"hi", Some(&meta));
        assert_eq!(7, msg.message_type);
        assert_eq!(b"hi".to_vec(), msg.payload);
        assert_eq!(Some(meta), msg.metadata);
    }
}
