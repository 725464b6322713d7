//! The eventually consistent variant: reliable causal broadcast over a
//! last-writer-wins add/remove store.
//!
//! The engine is a single spawned task ([`CausalCore`]) owning the broadcast
//! bookkeeping and the store. Any replica serves reads from its own store;
//! writes are broadcast as EVENT messages and applied on delivery, which is
//! duplicate-suppressed, majority-acknowledged, FIFO per originator and
//! causally ordered across originators. A periodic SYNC gossip of the full
//! store recovers convergence even under permanent message loss.

pub mod message;
pub mod store;
pub mod vclock;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;

use crate::causal::message::Message;
use crate::causal::message::MessageData;
use crate::causal::message::MessageId;
use crate::causal::message::MessageKind;
use crate::error::EngineError;
use crate::metrics::CausalMetrics;
use crate::metrics::CausalWait;
use crate::quorum;
use crate::transport::Datagrams;
use crate::Config;
use crate::ReplicaId;

pub use self::store::LwwStore;
pub use self::store::StoreSnapshot;
pub use self::vclock::VectorClock;

/// A patch: keys to set, or to delete where the value is `None`.
pub type Patch = BTreeMap<String, Option<i64>>;

/// A broadcast-state snapshot, part of the `/view` payload.
#[derive(Clone, Debug, Serialize)]
pub struct BroadcastView {
    pub id: ReplicaId,
    pub ct: u64,
    pub pending: Vec<String>,
    pub delivered: Vec<String>,
    pub acks: BTreeMap<String, Vec<ReplicaId>>,
    pub timestamps: VectorClock,
}

/// A full replica state snapshot, served on the gateway's `/view` route.
#[derive(Clone, Debug, Serialize)]
pub struct CausalView {
    pub id: ReplicaId,
    pub network: BroadcastView,
    pub storage: StoreSnapshot,
}

pub(crate) enum ApiMsg {
    Get { key: String, tx: oneshot::Sender<Option<i64>> },
    Patch { patch: Patch, tx: oneshot::Sender<MessageId> },
    View { tx: oneshot::Sender<CausalView> },
}

struct CausalInner {
    tx_api: mpsc::UnboundedSender<ApiMsg>,
    tx_net: mpsc::UnboundedSender<Vec<u8>>,
    rx_metrics: watch::Receiver<CausalMetrics>,
    core_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The public handle to a running causal replica.
///
/// Cheap to clone; all clones address the same spawned core task.
#[derive(Clone)]
pub struct Causal {
    inner: Arc<CausalInner>,
}

impl Causal {
    /// Create and spawn a new causal replica task.
    #[tracing::instrument(level = "debug", skip(config, transport), fields(cluster = %config.cluster_name))]
    pub fn spawn(id: ReplicaId, config: Arc<Config>, transport: Arc<dyn Datagrams>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_net, rx_net) = mpsc::unbounded_channel();
        let clock = VectorClock::new(config.replicas.keys().copied());
        let (tx_metrics, rx_metrics) = watch::channel(CausalMetrics::new_initial(id, clock.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core = CausalCore {
            id,
            config,
            transport,
            counter: 0,
            clock,
            pending: Vec::new(),
            delivered: Vec::new(),
            acks: HashMap::new(),
            messages: HashMap::new(),
            store: LwwStore::new(),
            rx_api,
            rx_net,
            tx_metrics,
            rx_shutdown,
        };
        let core_handle = tokio::spawn(core.main());
        Self {
            inner: Arc::new(CausalInner {
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

    /// Read a key from this replica's own store.
    pub async fn get(&self, key: String) -> Result<Option<i64>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(ApiMsg::Get { key, tx }).map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Broadcast a patch as one EVENT. Returns once the message is on the
    /// wire; delivery (here and everywhere else) is asynchronous.
    pub async fn patch(&self, patch: Patch) -> Result<MessageId, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(ApiMsg::Patch { patch, tx }).map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Get a full state snapshot of this replica.
    pub async fn view(&self) -> Result<CausalView, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(ApiMsg::View { tx }).map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<CausalMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> CausalWait {
        CausalWait {
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

/// The core task implementing reliable causal broadcast, the store it
/// feeds, and the anti-entropy syncer.
struct CausalCore {
    /// This replica's ID.
    id: ReplicaId,
    config: Arc<Config>,
    transport: Arc<dyn Datagrams>,

    /// The local event counter; `(id, counter)` identifies our broadcasts.
    counter: u64,
    /// The delivered clock: `clock[r]` counts EVENTs from `r` delivered
    /// locally.
    clock: VectorClock,
    /// Message IDs seen but not yet delivered, in arrival order.
    pending: Vec<MessageId>,
    /// Message IDs delivered, in delivery order.
    delivered: Vec<MessageId>,
    /// Per message, the replicas known to have seen it.
    acks: HashMap<MessageId, HashSet<ReplicaId>>,
    /// Every message ever seen, keyed by its permanent ID. Doubles as the
    /// duplicate filter: a known ID is never enqueued again.
    messages: HashMap<MessageId, Message>,
    /// The store delivered EVENTs are applied to.
    store: LwwStore,

    rx_api: mpsc::UnboundedReceiver<ApiMsg>,
    rx_net: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_metrics: watch::Sender<CausalMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl CausalCore {
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) {
        tracing::debug!("causal replica is initializing");
        let mut retransmit = interval(Duration::from_millis(self.config.retransmit_interval));
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = interval(Duration::from_millis(self.config.sync_interval));
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = retransmit.tick() => self.retransmit_pending().await,
                _ = sync.tick() => self.broadcast_sync().await,
                Some(frame) = self.rx_net.recv() => self.handle_frame(&frame).await,
                Some(msg) = self.rx_api.recv() => match msg {
                    ApiMsg::Get { key, tx } => {
                        let _ = tx.send(self.store.get(&key));
                    }
                    ApiMsg::Patch { patch, tx } => {
                        let id = self.broadcast_event(patch).await;
                        let _ = tx.send(id);
                    }
                    ApiMsg::View { tx } => {
                        let _ = tx.send(self.view());
                    }
                },
                Ok(_) = &mut self.rx_shutdown => {
                    tracing::info!("replica has shut down");
                    return;
                }
            }
        }
    }

    /// Broadcast one EVENT carrying `patch`, tracking it as pending until
    /// enough of the cluster has echoed it back.
    #[tracing::instrument(level = "debug", skip(self, patch), fields(id = self.id))]
    async fn broadcast_event(&mut self, patch: Patch) -> MessageId {
        self.counter += 1;
        let mut timestamps = self.clock.clone();
        timestamps.set(self.id, self.counter);
        let id = (self.id, self.counter);
        let message = Message {
            kind: MessageKind::Event,
            sender: self.id,
            id,
            timestamps,
            data: MessageData::Patch(patch),
        };
        self.messages.insert(id, message.clone());
        self.pending.push(id);
        let mut acks = HashSet::new();
        acks.insert(self.id);
        self.acks.insert(id, acks);
        self.broadcast(&message).await;
        // A single-replica cluster is its own majority.
        self.deliver();
        self.report_metrics();
        id
    }

    /// Handle one inbound frame.
    async fn handle_frame(&mut self, frame: &[u8]) {
        let message = match message::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "malformed datagram dropped");
                return;
            }
        };
        tracing::debug!(id = ?message.id, sender = message.sender, kind = ?message.kind, "received message");
        match message.kind {
            MessageKind::Sync => self.handle_sync(message),
            MessageKind::Event => self.handle_event(message).await,
        }
        self.report_metrics();
    }

    /// First sight of an EVENT enqueues it and relays it once, so the
    /// cluster learns we have it even if the originator is gone; later
    /// copies only add their sender to the ack set.
    async fn handle_event(&mut self, message: Message) {
        let id = message.id;
        if self.messages.contains_key(&id) {
            if let Some(acks) = self.acks.get_mut(&id) {
                acks.insert(message.sender);
            }
        } else {
            let mut acks = HashSet::new();
            acks.insert(message.sender);
            acks.insert(self.id);
            self.acks.insert(id, acks);
            self.messages.insert(id, message.clone());
            self.pending.push(id);
            if message.sender != self.id {
                let mut relay = message;
                relay.sender = self.id;
                self.broadcast(&relay).await;
            }
        }
        self.deliver();
    }

    /// SYNC bypasses ordering: parse the carried snapshot and merge it
    /// through the store's acceptance rules.
    fn handle_sync(&mut self, message: Message) {
        match message.data {
            MessageData::Snapshot(raw) => match serde_json::from_str::<StoreSnapshot>(&raw) {
                Ok(snapshot) => {
                    tracing::debug!(sender = message.sender, "merging sync snapshot");
                    self.store.merge(snapshot);
                }
                Err(err) => tracing::warn!(error = %err, "malformed sync snapshot dropped"),
            },
            MessageData::Patch(_) => {
                tracing::warn!(sender = message.sender, "sync message with patch payload dropped");
            }
        }
    }

    /// Deliver every pending message whose condition holds, re-scanning
    /// after each delivery until a fixed point: a delivery can unblock
    /// others.
    fn deliver(&mut self) {
        while let Some(pos) = self.next_deliverable() {
            let id = self.pending.remove(pos);
            let message = match self.messages.get(&id) {
                Some(message) => message.clone(),
                None => continue,
            };
            tracing::info!(?id, "delivering message");
            self.apply_event(&message);
            self.delivered.push(id);
            self.clock.set(id.0, message.timestamps.get(id.0));
        }
    }

    /// Find a pending message satisfying the delivery condition: seen by a
    /// majority, next in FIFO order from its originator, and with every
    /// causal predecessor already delivered.
    fn next_deliverable(&self) -> Option<usize> {
        let majority = quorum::majority_of(self.config.cluster_size());
        'pending: for (pos, id) in self.pending.iter().enumerate() {
            let message = match self.messages.get(id) {
                Some(message) => message,
                None => continue,
            };
            if self.acks.get(id).map_or(0, |acks| acks.len()) < majority {
                continue;
            }
            let origin = id.0;
            let timestamps = &message.timestamps;
            if self.clock.get(origin) + 1 != timestamps.get(origin) {
                continue;
            }
            for replica in self.config.replicas.keys().copied() {
                if replica != origin && self.clock.get(replica) < timestamps.get(replica) {
                    continue 'pending;
                }
            }
            return Some(pos);
        }
        None
    }

    /// Apply a delivered EVENT to the store, tagged with its originator and
    /// broadcast-time clock.
    fn apply_event(&mut self, message: &Message) {
        let origin = message.id.0;
        match &message.data {
            MessageData::Patch(patch) => {
                for (key, value) in patch {
                    match value {
                        Some(value) => self.store.put(key, *value, origin, message.timestamps.clone()),
                        None => self.store.delete(key, origin, message.timestamps.clone()),
                    }
                }
            }
            MessageData::Snapshot(_) => {
                // SYNCs are merged on receipt and never enqueued.
                tracing::error!(id = ?message.id, "snapshot payload reached delivery");
            }
        }
    }

    /// Re-broadcast this replica's own messages still awaiting delivery.
    async fn retransmit_pending(&mut self) {
        let own: Vec<Message> = self
            .pending
            .iter()
            .filter(|(origin, _)| *origin == self.id)
            .filter_map(|id| self.messages.get(id).cloned())
            .collect();
        for message in own {
            tracing::debug!(id = ?message.id, "retransmitting pending message");
            self.broadcast(&message).await;
        }
    }

    /// Gossip the full store to every peer.
    async fn broadcast_sync(&mut self) {
        let raw = match serde_json::to_string(&self.store.snapshot()) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(error = %err, "store snapshot encode failed");
                return;
            }
        };
        let message = Message {
            kind: MessageKind::Sync,
            sender: self.id,
            id: (self.id, 0),
            timestamps: self.clock.clone(),
            data: MessageData::Snapshot(raw),
        };
        self.broadcast(&message).await;
    }

    /// Send one message to every peer.
    async fn broadcast(&self, message: &Message) {
        let frame = match message::encode(message) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "message encode failed");
                return;
            }
        };
        for peer in self.config.peers_of(self.id) {
            if let Err(err) = self.transport.send(peer, frame.clone()).await {
                // Lost frames are recovered by retransmission or sync.
                tracing::debug!(peer, error = %err, "datagram send failed");
            }
        }
    }

    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(CausalMetrics {
            id: self.id,
            counter: self.counter,
            clock: self.clock.clone(),
            pending: self.pending.len(),
            delivered: self.delivered.len() as u64,
        });
        if let Err(err) = res {
            tracing::error!(error = %err, id = self.id, "error reporting metrics");
        }
    }

    fn view(&self) -> CausalView {
        let fmt_id = |id: &MessageId| format!("({}, {})", id.0, id.1);
        let mut acks: BTreeMap<String, Vec<ReplicaId>> = BTreeMap::new();
        for (id, senders) in &self.acks {
            let mut senders: Vec<ReplicaId> = senders.iter().copied().collect();
            senders.sort_unstable();
            acks.insert(fmt_id(id), senders);
        }
        CausalView {
            id: self.id,
            network: BroadcastView {
                id: self.id,
                ct: self.counter,
                pending: self.pending.iter().map(fmt_id).collect(),
                delivered: self.delivered.iter().map(fmt_id).collect(),
                acks,
                timestamps: self.clock.clone(),
            },
            storage: self.store.snapshot(),
        }
    }
}
