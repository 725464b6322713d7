//! Cluster runtime configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::ReplicaId;

/// The runtime configuration shared by both engine variants.
///
/// The address tables are static for the lifetime of the process: the
/// cluster never changes membership, so the tables are plain data populated
/// at startup and handed to the engine behind an `Arc`.
///
/// Timing defaults: elections fire after a randomised `150..300` ms
/// silence, heartbeats every `50` ms, and the causal engine retransmits and
/// gossips every `10` s.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster.
    pub cluster_name: String,
    /// UDP address table: replica ID to datagram endpoint.
    pub replicas: BTreeMap<ReplicaId, SocketAddr>,
    /// HTTP gateway table: replica ID to `host:port`, used for redirecting
    /// clients to the leader's gateway.
    pub gateways: BTreeMap<ReplicaId, String>,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The leader's heartbeat cadence in milliseconds. Must be shorter than
    /// `election_timeout_min` or followers will keep starting elections.
    pub heartbeat_interval: u64,
    /// How often the causal engine re-broadcasts its own undelivered
    /// messages, in milliseconds.
    pub retransmit_interval: u64,
    /// How often the causal engine gossips its full store, in milliseconds.
    pub sync_interval: u64,
    /// The largest datagram the transport will attempt to send.
    pub max_datagram_len: usize,
}

impl Config {
    /// Start a builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            replicas: BTreeMap::new(),
            gateways: BTreeMap::new(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            retransmit_interval: None,
            sync_interval: None,
            max_datagram_len: None,
        }
    }

    /// Generate a new random election timeout within the configured range,
    /// in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The number of replicas in the cluster.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// IDs of every replica other than `id`.
    pub fn peers_of(&self, id: ReplicaId) -> Vec<ReplicaId> {
        self.replicas.keys().copied().filter(|peer| *peer != id).collect()
    }
}

/// A builder for the [`Config`] type.
pub struct ConfigBuilder {
    cluster_name: String,
    replicas: BTreeMap<ReplicaId, SocketAddr>,
    gateways: BTreeMap<ReplicaId, String>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    retransmit_interval: Option<u64>,
    sync_interval: Option<u64>,
    max_datagram_len: Option<usize>,
}

impl ConfigBuilder {
    /// Set the full UDP address table.
    pub fn replicas(mut self, replicas: BTreeMap<ReplicaId, SocketAddr>) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set the HTTP gateway table.
    pub fn gateways(mut self, gateways: BTreeMap<ReplicaId, String>) -> Self {
        self.gateways = gateways;
        self
    }

    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat cadence in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the causal retransmit cadence in milliseconds.
    pub fn retransmit_interval(mut self, val: u64) -> Self {
        self.retransmit_interval = Some(val);
        self
    }

    /// Set the anti-entropy cadence in milliseconds.
    pub fn sync_interval(mut self, val: u64) -> Self {
        self.sync_interval = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            cluster_name: self.cluster_name,
            replicas: self.replicas,
            gateways: self.gateways,
            election_timeout_min: self.election_timeout_min.unwrap_or(150),
            election_timeout_max: self.election_timeout_max.unwrap_or(300),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(50),
            retransmit_interval: self.retransmit_interval.unwrap_or(10_000),
            sync_interval: self.sync_interval.unwrap_or(10_000),
            max_datagram_len: self.max_datagram_len.unwrap_or(4096),
        };
        if config.replicas.is_empty() {
            return Err(ConfigError::NoReplicas);
        }
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        if config.heartbeat_interval >= config.election_timeout_min {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if config.retransmit_interval == 0 || config.sync_interval == 0 {
            return Err(ConfigError::InvalidGossipInterval);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: u64) -> BTreeMap<ReplicaId, SocketAddr> {
        (0..n).map(|id| (id, format!("127.0.0.1:{}", 32000 + id).parse().unwrap())).collect()
    }

    #[test]
    fn default_values() {
        let config = Config::build("test".into()).replicas(table(3)).validate().unwrap();
        assert_eq!(config.election_timeout_min, 150);
        assert_eq!(config.election_timeout_max, 300);
        assert_eq!(config.heartbeat_interval, 50);
        assert_eq!(config.max_datagram_len, 4096);
    }

    #[test]
    fn rand_election_timeout_within_range() {
        let config = Config::build("test".into()).replicas(table(3)).validate().unwrap();
        for _ in 0..100 {
            let timeout = config.new_rand_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout < config.election_timeout_max);
        }
    }

    #[test]
    fn invalid_election_timeout() {
        let res = Config::build("test".into())
            .replicas(table(3))
            .election_timeout_min(300)
            .election_timeout_max(150)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn heartbeat_must_undercut_elections() {
        let res = Config::build("test".into())
            .replicas(table(3))
            .heartbeat_interval(200)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidHeartbeatInterval)));
    }

    #[test]
    fn empty_cluster_rejected() {
        let res = Config::build("test".into()).validate();
        assert!(matches!(res, Err(ConfigError::NoReplicas)));
    }

    #[test]
    fn peers_exclude_self() {
        let config = Config::build("test".into()).replicas(table(3)).validate().unwrap();
        assert_eq!(config.peers_of(1), vec![0, 2]);
    }
}
