//! The strongly consistent variant: a leader-based replicated log applied to
//! a key/value state machine.
//!
//! The engine is a single spawned task ([`ConsensusCore`]) owning the log,
//! the state machine and all role state. It assumes one of three roles and
//! delegates control to the matching state controller, which loops over a
//! `tokio::select!` of its timer, inbound datagrams, client requests, and
//! shutdown. The public [`Consensus`] handle is cheap to clone and talks to
//! the core over channels.

mod append;
mod client;
pub mod log;
pub mod message;
pub mod storage;
mod vote;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::consensus::client::AwaitingClient;
use crate::consensus::log::Entry;
use crate::consensus::log::EventKind;
use crate::consensus::log::Log;
use crate::consensus::message::Payload;
use crate::consensus::message::Rpc;
use crate::consensus::storage::StateMachine;
use crate::error::ClientWriteError;
use crate::error::EngineError;
use crate::metrics::ConsensusMetrics;
use crate::metrics::Wait;
use crate::transport::Datagrams;
use crate::Config;
use crate::ReplicaId;

/// All possible roles of a consensus replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The replica is replicating entries from the leader.
    Follower,
    /// The replica is campaigning to become the cluster leader.
    Candidate,
    /// The replica is the cluster leader.
    Leader,
    /// The replica is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A client operation against the replicated store.
#[derive(Clone, Debug)]
pub enum Command {
    Get { key: String },
    Post { key: String, value: i64 },
    Put { key: String, value: i64 },
    Delete { key: String },
}

impl Command {
    fn into_entry(self, term: u64) -> Entry {
        let (event, key, value) = match self {
            Command::Get { key } => (EventKind::Get, key, None),
            Command::Post { key, value } => (EventKind::Post, key, Some(value)),
            Command::Put { key, value } => (EventKind::Put, key, Some(value)),
            Command::Delete { key } => (EventKind::Delete, key, None),
        };
        Entry {
            term,
            event,
            key: Some(key),
            value,
        }
    }
}

/// The response to a committed client operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index the operation committed at.
    pub index: u64,
    /// The state machine's answer: the value read at apply time for `Get`,
    /// `None` for every other operation.
    pub value: Option<i64>,
}

/// A full replica state snapshot, served on the gateway's `/view` route.
#[derive(Clone, Debug, Serialize)]
pub struct ConsensusView {
    pub id: ReplicaId,
    pub address: Option<SocketAddr>,
    pub role: Role,
    pub current_term: u64,
    pub log: Log,
    pub commit_index: u64,
    pub storage: BTreeMap<String, i64>,
    pub leader_id: Option<ReplicaId>,
    pub voted_for: Option<ReplicaId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approves: Option<Vec<ReplicaId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_index: Option<BTreeMap<ReplicaId, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_index: Option<BTreeMap<ReplicaId, u64>>,
}

pub(crate) type WriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;

/// A message coming from the public API.
pub(crate) enum ApiMsg {
    Write { cmd: Command, tx: WriteResponseTx },
    View { tx: oneshot::Sender<ConsensusView> },
}

struct ConsensusInner {
    tx_api: mpsc::UnboundedSender<ApiMsg>,
    tx_net: mpsc::UnboundedSender<Vec<u8>>,
    rx_metrics: watch::Receiver<ConsensusMetrics>,
    core_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The public handle to a running consensus replica.
///
/// Cheap to clone; all clones address the same spawned core task.
#[derive(Clone)]
pub struct Consensus {
    inner: Arc<ConsensusInner>,
}

impl Consensus {
    /// Create and spawn a new consensus replica task.
    #[tracing::instrument(level = "debug", skip(config, transport), fields(cluster = %config.cluster_name))]
    pub fn spawn(id: ReplicaId, config: Arc<Config>, transport: Arc<dyn Datagrams>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_net, rx_net) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ConsensusMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = ConsensusCore::spawn(id, config, transport, rx_api, rx_net, tx_metrics, rx_shutdown);
        Self {
            inner: Arc::new(ConsensusInner {
                tx_api,
                tx_net,
                rx_metrics,
                core_handle: Mutex::new(Some(core_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
            }),
        }
    }

    /// Feed one raw inbound datagram to the engine.
    pub fn inbound(&self, frame: Vec<u8>) {
        let _ = self.inner.tx_net.send(frame);
    }

    /// Submit a client operation and block until it commits.
    ///
    /// On a non-leader this fails fast with
    /// [`ClientWriteError::ForwardToLeader`]. A `Get` is linearised through
    /// the log: the returned value is the state machine read performed when
    /// the entry is applied, not a local (possibly stale) read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_write(&self, cmd: Command) -> Result<ClientWriteResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Write { cmd, tx })
            .map_err(|_| ClientWriteError::Engine(EngineError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::Engine(EngineError::ShuttingDown))?
    }

    /// Get a full state snapshot of this replica.
    pub async fn view(&self) -> Result<ConsensusView, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(ApiMsg::View { tx }).map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ConsensusMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut down this replica.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            handle.await?;
        }
        Ok(())
    }
}

/// The core task implementing the consensus protocol.
pub(crate) struct ConsensusCore {
    /// This replica's ID.
    id: ReplicaId,
    config: Arc<Config>,
    transport: Arc<dyn Datagrams>,

    /// The replicated log. Mutated only by this task: appended by the
    /// leader's client path, appended/truncated by the follower's
    /// AppendEntry path.
    log: Log,
    /// The state machine fed by committed entries.
    storage: StateMachine,

    /// The role this core should currently be running.
    target_role: Role,
    /// The current term. Increases monotonically; bumped locally on each
    /// election attempt, adopted from any message carrying a newer one.
    current_term: u64,
    /// The candidate which received this replica's vote in `current_term`.
    voted_for: Option<ReplicaId>,
    /// The cluster leader, as far as this replica knows.
    current_leader: Option<ReplicaId>,
    /// The highest log index known to be replicated on a majority. Entries
    /// up to here are applied to the state machine, in index order.
    commit_index: u64,

    /// The deadline of the running election timer, armed lazily while not
    /// leader.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<ApiMsg>,
    rx_net: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_metrics: watch::Sender<ConsensusMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl ConsensusCore {
    pub(crate) fn spawn(
        id: ReplicaId,
        config: Arc<Config>,
        transport: Arc<dyn Datagrams>,
        rx_api: mpsc::UnboundedReceiver<ApiMsg>,
        rx_net: mpsc::UnboundedReceiver<Vec<u8>>,
        tx_metrics: watch::Sender<ConsensusMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let this = Self {
            id,
            config,
            transport,
            log: Log::new(),
            storage: StateMachine::new(),
            target_role: Role::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            next_election_timeout: None,
            rx_api,
            rx_net,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) {
        tracing::debug!("consensus replica is initializing");
        loop {
            match self.target_role {
                Role::Follower => FollowerState::new(&mut self).run().await,
                Role::Candidate => CandidateState::new(&mut self).run().await,
                Role::Leader => LeaderState::new(&mut self).run().await,
                Role::Shutdown => {
                    tracing::info!("replica has shut down");
                    return;
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the replica.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(ConsensusMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.current_term,
            last_log_index: self.log.size() - 1,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
        });
        if let Err(err) = res {
            tracing::error!(error = %err, id = self.id, "error reporting metrics");
        }
    }

    fn set_target_role(&mut self, role: Role) {
        self.target_role = role;
    }

    /// Get the armed election deadline, arming a fresh randomised one if
    /// none is set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(instant) => instant,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let instant = Instant::now() + t;
                self.next_election_timeout = Some(instant);
                instant
            }
        }
    }

    /// Re-arm the election timer for a full, freshly randomised duration.
    fn update_next_election_timeout(&mut self) {
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(Instant::now() + t);
    }

    /// Decode and screen one inbound frame.
    ///
    /// Malformed frames, self-echoes and stale-term messages are dropped
    /// here. A newer term forces a step-down before the message is handed
    /// back for dispatch.
    fn screen(&mut self, frame: &[u8]) -> Option<Rpc> {
        let rpc = match message::decode(frame) {
            Ok(rpc) => rpc,
            Err(err) => {
                tracing::warn!(error = %err, "malformed datagram dropped");
                return None;
            }
        };
        if rpc.sender == self.id {
            return None;
        }
        if rpc.term < self.current_term {
            tracing::trace!(sender = rpc.sender, term = rpc.term, "stale term, ignoring");
            return None;
        }
        if rpc.term > self.current_term {
            tracing::info!(old_term = self.current_term, new_term = rpc.term, "observed newer term, stepping down");
            self.current_term = rpc.term;
            self.voted_for = None;
            self.current_leader = None;
            self.set_target_role(Role::Follower);
            self.update_next_election_timeout();
            self.report_metrics();
        }
        Some(rpc)
    }

    /// Send one RPC under the current term.
    async fn send_rpc(&self, target: ReplicaId, payload: Payload) {
        let rpc = Rpc {
            sender: self.id,
            term: self.current_term,
            payload,
        };
        match message::encode(&rpc) {
            Ok(frame) => {
                if let Err(err) = self.transport.send(target, frame).await {
                    // Lost frames are recovered by the next heartbeat round.
                    tracing::debug!(target, error = %err, "datagram send failed");
                }
            }
            Err(err) => tracing::error!(error = %err, "rpc encode failed"),
        }
    }

    /// Send one RPC to every peer.
    async fn broadcast_rpc(&self, payload: Payload) {
        for peer in self.config.peers_of(self.id) {
            self.send_rpc(peer, payload.clone()).await;
        }
    }

    /// Apply all entries in `(commit_index, new_commit]` to the state
    /// machine, in index order, and advance the commit index. Returns the
    /// apply result per index, for answering awaiting clients on the leader.
    fn apply_up_to(&mut self, new_commit: u64) -> Vec<(u64, Option<i64>)> {
        tracing::info!(from = self.commit_index + 1, to = new_commit, "committing entries");
        let mut results = Vec::new();
        for index in (self.commit_index + 1)..=new_commit {
            let entry = self.log.get(index).clone();
            let value = self.storage.apply(&entry);
            results.push((index, value));
        }
        self.commit_index = new_commit;
        results
    }

    /// The role-independent part of a state snapshot.
    fn view_base(&self) -> ConsensusView {
        ConsensusView {
            id: self.id,
            address: self.config.replicas.get(&self.id).copied(),
            role: self.target_role,
            current_term: self.current_term,
            log: self.log.clone(),
            commit_index: self.commit_index,
            storage: self.storage.data().clone(),
            leader_id: self.current_leader,
            voted_for: self.voted_for,
            approves: None,
            next_index: None,
            match_index: None,
        }
    }

    /// Answer an API message on a replica which is not the leader.
    fn handle_api_non_leader(&mut self, msg: ApiMsg) {
        match msg {
            ApiMsg::Write { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
            }
            ApiMsg::View { tx } => {
                let _ = tx.send(self.view_base());
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a replica in follower role.
struct FollowerState<'a> {
    core: &'a mut ConsensusCore,
}

impl<'a> FollowerState<'a> {
    fn new(core: &'a mut ConsensusCore) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, role = "follower"))]
    async fn run(self) {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_follower() {
                return;
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // Silence from the leader; campaign for the next term.
                _ = election_timeout => self.core.set_target_role(Role::Candidate),
                Some(frame) = self.core.rx_net.recv() => {
                    if let Some(rpc) = self.core.screen(&frame) {
                        match rpc.payload {
                            Payload::AppendEntry(req) => self.core.handle_append_entry(rpc.sender, req).await,
                            Payload::RequestVote(req) => self.core.handle_request_vote(rpc.sender, req).await,
                            _ => tracing::trace!(sender = rpc.sender, "response frame ignored in follower role"),
                        }
                    }
                }
                Some(msg) = self.core.rx_api.recv() => self.core.handle_api_non_leader(msg),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a replica in candidate role.
struct CandidateState<'a> {
    core: &'a mut ConsensusCore,
    /// Replicas which granted their vote this term. A set, so duplicated
    /// response datagrams cannot inflate the tally.
    approves: HashSet<ReplicaId>,
}

impl<'a> CandidateState<'a> {
    fn new(core: &'a mut ConsensusCore) -> Self {
        Self {
            core,
            approves: HashSet::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, role = "candidate"))]
    async fn run(mut self) {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_role.is_candidate() {
                return;
            }

            // Set up the new term: vote for ourselves and solicit the rest.
            self.core.update_next_election_timeout();
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.current_leader = None;
            self.approves.clear();
            self.approves.insert(self.core.id);
            self.core.report_metrics();
            tracing::info!(term = self.core.current_term, "starting election");

            let last_idx = self.core.log.size() - 1;
            let last_term = self.core.log.last().term;
            self.core
                .broadcast_rpc(Payload::RequestVote(message::RequestVote {
                    last_entry_idx: last_idx,
                    last_entry_term: last_term,
                }))
                .await;

            loop {
                if !self.core.target_role.is_candidate() {
                    return;
                }
                let election_timeout = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // This election timed out; start a new term.
                    _ = election_timeout => break,
                    Some(frame) = self.core.rx_net.recv() => {
                        if let Some(rpc) = self.core.screen(&frame) {
                            match rpc.payload {
                                Payload::AppendEntry(req) => self.core.handle_append_entry(rpc.sender, req).await,
                                Payload::RequestVote(req) => self.core.handle_request_vote(rpc.sender, req).await,
                                Payload::RequestVoteResponse(resp) => self.handle_vote_response(rpc.sender, resp),
                                Payload::AppendEntryResponse(_) => {}
                            }
                        }
                    }
                    Some(msg) = self.core.rx_api.recv() => self.handle_api(msg),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
                }
            }
        }
    }

    fn handle_api(&mut self, msg: ApiMsg) {
        match msg {
            ApiMsg::View { tx } => {
                let mut view = self.core.view_base();
                let mut approves: Vec<_> = self.approves.iter().copied().collect();
                approves.sort_unstable();
                view.approves = Some(approves);
                let _ = tx.send(view);
            }
            msg => self.core.handle_api_non_leader(msg),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the cluster leader.
struct LeaderState<'a> {
    core: &'a mut ConsensusCore,
    /// Per peer, the index of the next entry to probe it with.
    next_index: BTreeMap<ReplicaId, u64>,
    /// Per peer, the highest index known to be replicated there.
    match_index: BTreeMap<ReplicaId, u64>,
    /// Client requests appended locally and awaiting majority commit.
    awaiting_committed: Vec<AwaitingClient>,
}

impl<'a> LeaderState<'a> {
    fn new(core: &'a mut ConsensusCore) -> Self {
        let log_size = core.log.size();
        let peers = core.config.peers_of(core.id);
        let next_index = peers.iter().map(|peer| (*peer, log_size)).collect();
        let match_index = peers.iter().map(|peer| (*peer, 0)).collect();
        Self {
            core,
            next_index,
            match_index,
            awaiting_committed: Vec::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, role = "leader"))]
    async fn run(mut self) {
        tracing::info!(term = self.core.current_term, "selected as leader");

        // The election timer rests while leading; the heartbeat takes over.
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id);
        self.core.report_metrics();

        // A leader may only advance the commit index past earlier-term
        // entries by committing an entry of its own term; start one now.
        self.commit_initial_leader_entry().await;

        let mut heartbeat = interval(Duration::from_millis(self.core.config.heartbeat_interval));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.core.target_role.is_leader() {
                // Stepped down; awaiting clients must retry against the new
                // leader.
                let leader = self.core.current_leader;
                self.fail_awaiting(leader);
                return;
            }

            tokio::select! {
                _ = heartbeat.tick() => self.send_probes().await,
                Some(frame) = self.core.rx_net.recv() => {
                    if let Some(rpc) = self.core.screen(&frame) {
                        match rpc.payload {
                            Payload::AppendEntryResponse(resp) => self.handle_append_response(rpc.sender, resp).await,
                            Payload::RequestVote(req) => self.core.handle_request_vote(rpc.sender, req).await,
                            Payload::AppendEntry(req) => {
                                // Only reachable after a step-down forced by
                                // a newer term; dispatch normally then let
                                // the loop exit.
                                if !self.core.target_role.is_leader() {
                                    self.core.handle_append_entry(rpc.sender, req).await;
                                } else {
                                    tracing::error!(sender = rpc.sender, "append entry from a second leader in the current term");
                                }
                            }
                            Payload::RequestVoteResponse(_) => {}
                        }
                    }
                }
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ApiMsg::Write { cmd, tx } => self.handle_client_write(cmd, tx).await,
                    ApiMsg::View { tx } => {
                        let mut view = self.core.view_base();
                        view.next_index = Some(self.next_index.clone());
                        view.match_index = Some(self.match_index.clone());
                        let _ = tx.send(view);
                    }
                },
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_becomes_entry() {
        let entry = Command::Post {
            key: "a".into(),
            value: 7,
        }
        .into_entry(3);
        assert_eq!(entry.term, 3);
        assert_eq!(entry.event, EventKind::Post);
        assert_eq!(entry.key.as_deref(), Some("a"));
        assert_eq!(entry.value, Some(7));

        let entry = Command::Get { key: "a".into() }.into_entry(4);
        assert_eq!(entry.event, EventKind::Get);
        assert_eq!(entry.value, None);

        let entry = Command::Delete { key: "a".into() }.into_entry(4);
        assert_eq!(entry.event, EventKind::Delete);
    }
}
