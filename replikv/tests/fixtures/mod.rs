//! Fixtures for testing the replication engines.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing_subscriber::prelude::*;

use replikv::causal::Causal;
use replikv::causal::Patch;
use replikv::consensus::Command;
use replikv::consensus::ClientWriteResponse;
use replikv::consensus::Consensus;
use replikv::consensus::Role;
use replikv::error::ClientWriteError;
use replikv::metrics::CausalMetrics;
use replikv::metrics::ConsensusMetrics;
use replikv::Config;
use replikv::Datagrams;
use replikv::ReplicaId;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A cluster config for tests. The datagram addresses are never bound; the
/// in-memory router below carries the frames. Gossip cadences are shortened
/// so anti-entropy tests finish quickly.
pub fn test_config(ids: &[ReplicaId]) -> Arc<Config> {
    let replicas: BTreeMap<ReplicaId, SocketAddr> = ids
        .iter()
        .map(|id| (*id, SocketAddr::from((Ipv4Addr::LOCALHOST, 9000 + *id as u16))))
        .collect();
    let config = Config::build("test".into())
        .replicas(replicas)
        .retransmit_interval(300)
        .sync_interval(300)
        .validate()
        .expect("failed to build test config");
    Arc::new(config)
}

/// An in-memory datagram network. Frames go straight from one engine's
/// transport into the target engine's inbound queue; isolated replicas can
/// neither send nor receive, emulating a partition.
pub struct Router {
    config: Arc<Config>,
    consensus: RwLock<BTreeMap<ReplicaId, Consensus>>,
    causal: RwLock<BTreeMap<ReplicaId, Causal>>,
    isolated: RwLock<HashSet<ReplicaId>>,
}

/// The per-replica send handle: remembers its origin so partitions cut
/// both directions.
struct RouterTransport {
    origin: ReplicaId,
    router: Arc<Router>,
}

#[async_trait]
impl Datagrams for RouterTransport {
    async fn send(&self, target: ReplicaId, payload: Vec<u8>) -> Result<()> {
        self.router.send_from(self.origin, target, payload).await
    }
}

impl Router {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            consensus: RwLock::new(BTreeMap::new()),
            causal: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        })
    }

    async fn send_from(&self, origin: ReplicaId, target: ReplicaId, payload: Vec<u8>) -> Result<()> {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(&origin) || isolated.contains(&target) {
                bail!("replica is isolated");
            }
        }
        if let Some(node) = self.consensus.read().await.get(&target) {
            node.inbound(payload);
            return Ok(());
        }
        if let Some(node) = self.causal.read().await.get(&target) {
            node.inbound(payload);
            return Ok(());
        }
        bail!("replica {} is not routed", target)
    }

    fn transport(self: &Arc<Self>, origin: ReplicaId) -> Arc<dyn Datagrams> {
        Arc::new(RouterTransport {
            origin,
            router: self.clone(),
        })
    }

    /// Spawn one consensus replica per configured ID.
    pub async fn spawn_consensus_cluster(self: &Arc<Self>) {
        let ids: Vec<ReplicaId> = self.config.replicas.keys().copied().collect();
        let mut nodes = self.consensus.write().await;
        for id in ids {
            nodes.insert(id, Consensus::spawn(id, self.config.clone(), self.transport(id)));
        }
    }

    /// Spawn one causal replica per configured ID.
    pub async fn spawn_causal_cluster(self: &Arc<Self>) {
        let ids: Vec<ReplicaId> = self.config.replicas.keys().copied().collect();
        let mut nodes = self.causal.write().await;
        for id in ids {
            nodes.insert(id, Causal::spawn(id, self.config.clone(), self.transport(id)));
        }
    }

    pub async fn consensus(&self, id: ReplicaId) -> Consensus {
        self.consensus.read().await.get(&id).cloned().unwrap_or_else(|| panic!("replica {} does not exist", id))
    }

    pub async fn causal(&self, id: ReplicaId) -> Causal {
        self.causal.read().await.get(&id).cloned().unwrap_or_else(|| panic!("replica {} does not exist", id))
    }

    /// Cut a replica off the network, both directions.
    pub async fn isolate(&self, id: ReplicaId) {
        tracing::info!(id, "--- isolating replica");
        self.isolated.write().await.insert(id);
    }

    /// Reconnect a previously isolated replica.
    pub async fn restore(&self, id: ReplicaId) {
        tracing::info!(id, "--- restoring replica");
        self.isolated.write().await.remove(&id);
    }

    /// Remove a consensus replica from the cluster and stop it, emulating a
    /// crash.
    pub async fn kill_consensus(&self, id: ReplicaId) -> Result<()> {
        let node = self.consensus.write().await.remove(&id).with_context(|| format!("replica {} does not exist", id))?;
        node.shutdown().await
    }

    /// Latest metrics of every live consensus replica.
    pub async fn consensus_metrics(&self) -> Vec<ConsensusMetrics> {
        let nodes = self.consensus.read().await;
        nodes.values().map(|node| node.metrics().borrow().clone()).collect()
    }

    /// Latest metrics of every live causal replica.
    pub async fn causal_metrics(&self) -> Vec<CausalMetrics> {
        let nodes = self.causal.read().await;
        nodes.values().map(|node| node.metrics().borrow().clone()).collect()
    }

    /// The current non-isolated leader, if a replica believes itself one.
    pub async fn leader(&self) -> Option<ReplicaId> {
        let isolated = self.isolated.read().await;
        let nodes = self.consensus.read().await;
        for (id, node) in nodes.iter() {
            if isolated.contains(id) {
                continue;
            }
            let metrics = node.metrics().borrow().clone();
            if metrics.role == Role::Leader {
                return Some(*id);
            }
        }
        None
    }

    /// Block until a leader emerges.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<ReplicaId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until every given replica has committed through `index`.
    pub async fn wait_for_commit(&self, ids: &[ReplicaId], index: u64, timeout: Duration, msg: &str) -> Result<()> {
        for id in ids {
            let node = self.consensus(*id).await;
            node.wait(Some(timeout)).commit(index, format!("{} (replica {})", msg, id)).await?;
        }
        Ok(())
    }

    /// Wait until every live consensus replica reports the same last log
    /// index, fully committed. With no client traffic in flight this is a
    /// stable state: a leader is heartbeating and nothing further changes.
    pub async fn wait_for_quiesce(&self, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let metrics = self.consensus_metrics().await;
            if let Some(first) = metrics.first() {
                let index = first.last_log_index;
                if metrics.iter().all(|m| m.last_log_index == index && m.commit_index == index) {
                    return Ok(index);
                }
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("cluster did not quiesce within {:?}: {:?}", timeout, self.consensus_metrics().await));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Submit one client operation to the given replica.
    pub async fn client_write(&self, target: ReplicaId, cmd: Command) -> Result<ClientWriteResponse, ClientWriteError> {
        let node = self.consensus(target).await;
        node.client_write(cmd).await
    }

    /// Broadcast a patch from the given causal replica.
    pub async fn patch(&self, target: ReplicaId, patch: Patch) -> Result<()> {
        let node = self.causal(target).await;
        node.patch(patch).await?;
        Ok(())
    }

    /// Read a key at one causal replica.
    pub async fn causal_get(&self, target: ReplicaId, key: &str) -> Result<Option<i64>> {
        let node = self.causal(target).await;
        Ok(node.get(key.to_owned()).await?)
    }

    /// Wait until every given causal replica has delivered at least `count`
    /// messages.
    pub async fn wait_for_delivered(&self, ids: &[ReplicaId], count: u64, timeout: Duration, msg: &str) -> Result<()> {
        for id in ids {
            let node = self.causal(*id).await;
            node.wait(Some(timeout)).delivered(count, format!("{} (replica {})", msg, id)).await?;
        }
        Ok(())
    }

    /// Wait until every causal replica reads the same wanted value for a
    /// key. Isolated replicas still answer: isolation only cuts datagrams.
    pub async fn wait_for_agreement(&self, key: &str, want: Option<i64>, timeout: Duration) -> Result<()> {
        let ids: Vec<ReplicaId> = self.config.replicas.keys().copied().collect();
        let deadline = Instant::now() + timeout;
        loop {
            let mut agreed = true;
            for id in &ids {
                if self.causal_get(*id, key).await? != want {
                    agreed = false;
                    break;
                }
            }
            if agreed {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let mut observed = Vec::new();
                for id in &ids {
                    observed.push((*id, self.causal_get(*id, key).await?));
                }
                return Err(anyhow!("no agreement on {:?}={:?} within {:?}; observed {:?}", key, want, timeout, observed));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}
