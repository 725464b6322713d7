//! Inter-replica RPC messages and their wire codec.
//!
//! Every frame is one UTF-8 JSON object:
//! `{"sender": .., "term": .., "message_type": "..", "message": {..}}`.
//! Dispatch is a plain `match` over the tagged payload.

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::consensus::log::Entry;
use crate::ReplicaId;

/// The RPC envelope shared by all consensus messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rpc {
    /// The sending replica.
    pub sender: ReplicaId,
    /// The sender's current term.
    pub term: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The message payload, discriminated by the `message_type` wire field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "message", rename_all = "camelCase")]
pub enum Payload {
    AppendEntry(AppendEntry),
    AppendEntryResponse(AppendEntryResponse),
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
}

/// Sent by the leader to replicate one entry, probe a follower, or repair a
/// divergent log. `entry` is `None` for a pure heartbeat probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntry {
    pub entry: Option<Entry>,
    pub prev_entry_idx: u64,
    pub prev_entry_term: u64,
    pub commit_idx: u64,
}

/// A follower's verdict on an `AppendEntry`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    pub success: bool,
}

/// Sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub last_entry_idx: u64,
    pub last_entry_term: u64,
}

/// A replica's verdict on a `RequestVote`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub vote_granted: bool,
}

/// Encode an RPC into a datagram frame.
pub fn encode(rpc: &Rpc) -> Result<Vec<u8>> {
    serde_json::to_vec(rpc).context("encoding consensus rpc")
}

/// Decode a datagram frame. Failure means a malformed datagram; the caller
/// logs and drops it.
pub fn decode(frame: &[u8]) -> Result<Rpc> {
    serde_json::from_slice(frame).context("decoding consensus rpc")
}
