//! Engine metrics, observed through watch channels.
//!
//! Each engine core publishes a metrics payload on every state change.
//! Gateways use the payload for leader discovery and liveness; tests use the
//! [`Wait`] helpers to block until a cluster reaches some condition.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::causal::VectorClock;
use crate::consensus::Role;
use crate::error::WaitError;
use crate::ReplicaId;

/// A set of metrics describing the current state of a consensus replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    /// The ID of the replica.
    pub id: ReplicaId,
    /// The role of the replica.
    pub role: Role,
    /// The current term of the replica.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the highest log entry known to be committed.
    pub commit_index: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<ReplicaId>,
}

impl ConsensusMetrics {
    pub(crate) fn new_initial(id: ReplicaId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            current_leader: None,
        }
    }
}

/// A set of metrics describing the current state of a causal replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalMetrics {
    /// The ID of the replica.
    pub id: ReplicaId,
    /// The local event counter.
    pub counter: u64,
    /// The delivered vector clock.
    pub clock: VectorClock,
    /// The number of messages received or broadcast but not yet delivered.
    pub pending: usize,
    /// The number of messages delivered so far.
    pub delivered: u64,
}

impl CausalMetrics {
    pub(crate) fn new_initial(id: ReplicaId, clock: VectorClock) -> Self {
        Self {
            id,
            counter: 0,
            clock,
            pending: 0,
            delivered: 0,
        }
    }
}

/// A handle for waiting on consensus metrics to satisfy some condition.
pub struct Wait {
    pub(crate) timeout: Duration,
    pub(crate) rx: watch::Receiver<ConsensusMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ConsensusMetrics, WaitError>
    where T: Fn(&ConsensusMetrics) -> bool + Send {
        wait_on(self.rx.clone(), self.timeout, func, msg).await
    }

    /// Wait for the replica to assume the given role.
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.role == want, msg).await
    }

    /// Wait for the log to reach at least `index`.
    pub async fn log(&self, index: u64, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= index, msg).await
    }

    /// Wait for the commit index to reach at least `index`.
    pub async fn commit(&self, index: u64, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.commit_index >= index, msg).await
    }

    /// Wait for the replica to learn the given leader.
    pub async fn current_leader(&self, leader: ReplicaId, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(leader), msg).await
    }
}

/// A handle for waiting on causal metrics to satisfy some condition.
pub struct CausalWait {
    pub(crate) timeout: Duration,
    pub(crate) rx: watch::Receiver<CausalMetrics>,
}

impl CausalWait {
    /// Wait until the metrics satisfy `func`, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<CausalMetrics, WaitError>
    where T: Fn(&CausalMetrics) -> bool + Send {
        wait_on(self.rx.clone(), self.timeout, func, msg).await
    }

    /// Wait for the replica to have delivered at least `count` messages.
    pub async fn delivered(&self, count: u64, msg: impl ToString) -> Result<CausalMetrics, WaitError> {
        self.metrics(|m| m.delivered >= count, msg).await
    }
}

async fn wait_on<M, T>(
    mut rx: watch::Receiver<M>,
    timeout: Duration,
    func: T,
    msg: impl ToString,
) -> Result<M, WaitError>
where
    M: Clone,
    T: Fn(&M) -> bool + Send,
{
    let deadline = Instant::now() + timeout;
    loop {
        let latest = rx.borrow().clone();
        if func(&latest) {
            return Ok(latest);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::Timeout(timeout, msg.to_string()));
        }
        match tokio::time::timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return Err(WaitError::ShuttingDown),
            Err(_) => return Err(WaitError::Timeout(timeout, msg.to_string())),
        }
    }
}
