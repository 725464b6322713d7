//! Vote request handling and candidate-side vote counting.

use crate::consensus::message::Payload;
use crate::consensus::message::RequestVote;
use crate::consensus::message::RequestVoteResponse;
use crate::consensus::CandidateState;
use crate::consensus::ConsensusCore;
use crate::consensus::Role;
use crate::quorum;
use crate::ReplicaId;

impl ConsensusCore {
    /// Decide a candidate's vote request.
    ///
    /// Screening already adopted any newer term, so the request's term
    /// equals ours here. The vote is granted iff the candidate's log is at
    /// least as up-to-date as ours (higher last term, or equal last term and
    /// no shorter log) and we have not yet voted for anyone else this term.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub(super) async fn handle_request_vote(&mut self, sender: ReplicaId, req: RequestVote) {
        let last = self.log.last();
        let log_ok = req.last_entry_term > last.term
            || (req.last_entry_term == last.term && req.last_entry_idx >= self.log.size() - 1);
        let granted = log_ok && self.voted_for.map_or(true, |candidate| candidate == sender);
        if granted {
            tracing::info!(sender, term = self.current_term, "voting for candidate");
            self.voted_for = Some(sender);
            self.update_next_election_timeout();
        } else {
            tracing::debug!(sender, log_ok, voted_for = ?self.voted_for, "vote denied");
        }
        self.send_rpc(sender, Payload::RequestVoteResponse(RequestVoteResponse { vote_granted: granted }))
            .await;
    }
}

impl<'a> CandidateState<'a> {
    /// Count one vote response; on reaching a majority, take leadership.
    pub(super) fn handle_vote_response(&mut self, sender: ReplicaId, resp: RequestVoteResponse) {
        if !resp.vote_granted {
            return;
        }
        self.approves.insert(sender);
        let majority = quorum::majority_of(self.core.config.cluster_size());
        if self.approves.len() >= majority {
            tracing::info!(
                term = self.core.current_term,
                votes = self.approves.len(),
                "majority of votes granted"
            );
            self.core.set_target_role(Role::Leader);
        }
    }
}
