//! Broadcast messages and their wire codec.
//!
//! One UTF-8 JSON object per frame:
//! `{"type": 0|1, "sender": .., "id": [origin, seq], "timestamps": {..},
//! "data": ..}` — a patch mapping for EVENT, a JSON string holding a store
//! snapshot for SYNC.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::causal::vclock::VectorClock;
use crate::ReplicaId;

/// A broadcast message's permanent identity: `(originator, origin sequence)`.
pub type MessageId = (ReplicaId, u64);

/// The two message families, integer-tagged on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    /// A causally ordered store update.
    Event = 0,
    /// An anti-entropy full-state exchange; bypasses ordering.
    Sync = 1,
}

/// Error for an out-of-range message kind tag; a malformed datagram.
#[derive(Debug)]
pub struct UnknownMessageKind(pub u8);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind tag {}", self.0)
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Event),
            1 => Ok(MessageKind::Sync),
            other => Err(UnknownMessageKind(other)),
        }
    }
}

/// The message payload. Untagged: an EVENT carries a patch object, a SYNC
/// carries its snapshot pre-serialised as a string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageData {
    Patch(BTreeMap<String, Option<i64>>),
    Snapshot(String),
}

/// A broadcast message.
///
/// `sender` is the replica the frame came from last (the originator, or a
/// relayer forwarding it); `id.0` is the originator, forever. For an EVENT,
/// `timestamps[id.0] == id.1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: ReplicaId,
    pub id: MessageId,
    pub timestamps: VectorClock,
    pub data: MessageData,
}

/// Encode a message into a datagram frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).context("encoding causal message")
}

/// Decode a datagram frame. Failure means a malformed datagram; the caller
/// logs and drops it.
pub fn decode(frame: &[u8]) -> Result<Message> {
    serde_json::from_slice(frame).context("decoding causal message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn clock(slots: &[(ReplicaId, u64)]) -> VectorClock {
        let mut vc = VectorClock::default();
        for (id, t) in slots {
            vc.set(*id, *t);
        }
        vc
    }

    #[test]
    fn event_round_trip_and_shape() {
        let message = Message {
            kind: MessageKind::Event,
            sender: 1,
            id: (1, 3),
            timestamps: clock(&[(0, 2), (1, 3), (2, 0)]),
            data: MessageData::Patch(btreemap! {
                "x".to_owned() => Some(7),
                "y".to_owned() => None,
            }),
        };
        let frame = encode(&message).unwrap();
        assert_eq!(decode(&frame).unwrap(), message);

        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": 0,
                "sender": 1,
                "id": [1, 3],
                "timestamps": {"0": 2, "1": 3, "2": 0},
                "data": {"x": 7, "y": null},
            })
        );
    }

    #[test]
    fn sync_data_is_a_string() {
        let message = Message {
            kind: MessageKind::Sync,
            sender: 0,
            id: (0, 0),
            timestamps: clock(&[(0, 1)]),
            data: MessageData::Snapshot(r#"{"inserts": {}, "removes": {}}"#.to_owned()),
        };
        let frame = encode(&message).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.kind, MessageKind::Sync);
        match decoded.data {
            MessageData::Snapshot(raw) => assert!(raw.contains("inserts")),
            other => panic!("unexpected data: {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode(b"{{").is_err());
        assert!(decode(br#"{"type": 7, "sender": 0, "id": [0, 1], "timestamps": {}, "data": {}}"#).is_err());
    }
}
