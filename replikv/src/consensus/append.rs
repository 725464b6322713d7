//! Log replication: the follower-side append path and the leader-side
//! probe/repair/commit bookkeeping.

use crate::consensus::message::AppendEntry;
use crate::consensus::message::AppendEntryResponse;
use crate::consensus::message::Payload;
use crate::consensus::ConsensusCore;
use crate::consensus::LeaderState;
use crate::consensus::Role;
use crate::quorum;
use crate::ReplicaId;

impl ConsensusCore {
    /// Handle an AppendEntry from the current term's leader: run the log
    /// consistency check, advance the local commit index behind the
    /// leader's, and answer with the verdict.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub(super) async fn handle_append_entry(&mut self, sender: ReplicaId, req: AppendEntry) {
        // Valid leader contact for this term.
        self.current_leader = Some(sender);
        if self.target_role == Role::Candidate {
            self.set_target_role(Role::Follower);
        }
        self.update_next_election_timeout();

        let success = self.log.append(req.entry, req.prev_entry_idx, req.prev_entry_term);
        if success && req.commit_idx > self.commit_index {
            let new_commit = req.commit_idx.min(self.log.size() - 1);
            if new_commit > self.commit_index {
                self.apply_up_to(new_commit);
            }
        }
        self.report_metrics();
        self.send_rpc(sender, Payload::AppendEntryResponse(AppendEntryResponse { success }))
            .await;
    }
}

impl<'a> LeaderState<'a> {
    /// One heartbeat round: probe every peer at its `next_index`.
    pub(super) async fn send_probes(&mut self) {
        let peers: Vec<ReplicaId> = self.next_index.keys().copied().collect();
        for peer in peers {
            self.send_probe(peer).await;
        }
    }

    /// Probe one peer: carry the entry at its `next_index` if one exists,
    /// else an empty heartbeat.
    pub(super) async fn send_probe(&mut self, peer: ReplicaId) {
        let index = match self.next_index.get(&peer) {
            Some(index) => *index,
            None => {
                tracing::error!(peer, "probe requested for unknown peer");
                return;
            }
        };
        let entry = if index < self.core.log.size() {
            Some(self.core.log.get(index).clone())
        } else {
            None
        };
        let prev = index - 1;
        let payload = Payload::AppendEntry(AppendEntry {
            entry,
            prev_entry_idx: prev,
            prev_entry_term: self.core.log.get(prev).term,
            commit_idx: self.core.commit_index,
        });
        self.core.send_rpc(peer, payload).await;
    }

    /// Handle a follower's verdict on a probe.
    ///
    /// Success advances that peer's indexes by one (responses carry no
    /// acknowledged index, so progress is one entry per round trip) and
    /// re-evaluates the majority commit point. Failure backs `next_index`
    /// off by one and re-probes immediately, walking back to the point
    /// where the logs agree.
    #[tracing::instrument(level = "debug", skip(self, resp), fields(id = self.core.id))]
    pub(super) async fn handle_append_response(&mut self, sender: ReplicaId, resp: AppendEntryResponse) {
        if !resp.success {
            if let Some(next) = self.next_index.get_mut(&sender) {
                if *next > 1 {
                    *next -= 1;
                }
                tracing::debug!(sender, next = *next, "log mismatch, backing off");
                self.send_probe(sender).await;
            }
            return;
        }

        let size = self.core.log.size();
        if let Some(next) = self.next_index.get_mut(&sender) {
            *next = (*next + 1).min(size);
        }
        if let Some(matched) = self.match_index.get_mut(&sender) {
            *matched = (*matched + 1).min(size - 1);
        }
        self.maybe_commit();
    }

    /// Find the highest index replicated on a majority under the current
    /// term; apply and commit through it.
    pub(super) fn maybe_commit(&mut self) {
        let size = self.core.log.size();
        let majority = quorum::majority_of(self.core.config.cluster_size());
        for index in ((self.core.commit_index + 1)..size).rev() {
            // The leader itself holds every entry in its log.
            let replicated = 1 + self.match_index.values().filter(|matched| **matched >= index).count();
            if replicated >= majority && self.core.log.get(index).term == self.core.current_term {
                let results = self.core.apply_up_to(index);
                self.core.report_metrics();
                self.complete_awaiting(&results);
                break;
            }
        }
    }
}
