//! The leader's client write path.
//!
//! Requests are appended to the log under the mutex-equivalent of this
//! task's single-threaded ownership, broadcast to all peers, and parked
//! until the commit index passes them; the response is generated from the
//! state machine at apply time.

use crate::consensus::log::Entry;
use crate::consensus::message::AppendEntry;
use crate::consensus::message::Payload;
use crate::consensus::ClientWriteResponse;
use crate::consensus::Command;
use crate::consensus::LeaderState;
use crate::consensus::WriteResponseTx;
use crate::error::ClientWriteError;
use crate::ReplicaId;

/// A client request appended locally and awaiting majority commit.
pub(super) struct AwaitingClient {
    pub index: u64,
    pub tx: WriteResponseTx,
}

impl<'a> LeaderState<'a> {
    /// Append the blank entry new leaders are obligated to create when
    /// first coming to power.
    pub(super) async fn commit_initial_leader_entry(&mut self) {
        let entry = Entry::noop(self.core.current_term);
        self.append_and_replicate(entry).await;
        self.maybe_commit();
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "debug", skip(self, cmd, tx), fields(id = self.core.id))]
    pub(super) async fn handle_client_write(&mut self, cmd: Command, tx: WriteResponseTx) {
        let entry = cmd.into_entry(self.core.current_term);
        let index = self.append_and_replicate(entry).await;
        self.awaiting_committed.push(AwaitingClient { index, tx });
        // A single-replica cluster commits on its own.
        self.maybe_commit();
    }

    /// Append one entry at the tail and broadcast it to every peer.
    /// Returns the index the entry landed at.
    async fn append_and_replicate(&mut self, entry: Entry) -> u64 {
        let prev_idx = self.core.log.size() - 1;
        let prev_term = self.core.log.get(prev_idx).term;
        let index = self.core.log.size();
        if !self.core.log.append(Some(entry.clone()), prev_idx, prev_term) {
            // The tail always matches itself; reaching this is a bug.
            tracing::error!(?entry, "failed to append entry at the log tail");
        }
        self.core.report_metrics();
        self.core
            .broadcast_rpc(Payload::AppendEntry(AppendEntry {
                entry: Some(entry),
                prev_entry_idx: prev_idx,
                prev_entry_term: prev_term,
                commit_idx: self.core.commit_index,
            }))
            .await;
        index
    }

    /// Answer every parked client whose entry the last apply batch covered.
    pub(super) fn complete_awaiting(&mut self, results: &[(u64, Option<i64>)]) {
        if self.awaiting_committed.is_empty() {
            return;
        }
        let commit = self.core.commit_index;
        let mut remaining = Vec::new();
        for client in self.awaiting_committed.drain(..) {
            if client.index <= commit {
                let value = results
                    .iter()
                    .find(|(index, _)| *index == client.index)
                    .and_then(|(_, value)| *value);
                let _ = client.tx.send(Ok(ClientWriteResponse {
                    index: client.index,
                    value,
                }));
            } else {
                remaining.push(client);
            }
        }
        self.awaiting_committed = remaining;
    }

    /// Fail every parked client; used when stepping down mid-flight.
    pub(super) fn fail_awaiting(&mut self, leader: Option<ReplicaId>) {
        for client in self.awaiting_committed.drain(..) {
            let _ = client.tx.send(Err(ClientWriteError::ForwardToLeader(leader)));
        }
    }
}
