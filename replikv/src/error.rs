//! Error types exposed by this crate.

use std::time::Duration;

use thiserror::Error;

use crate::ReplicaId;

/// Error variants related to configuration.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The address table holds no replicas.
    #[error("the replica address table is empty")]
    NoReplicas,
    /// The min & max election timeout config values do not form a valid range.
    #[error("given values for election timeout min & max do not form a valid range")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval is not shorter than the minimum election timeout.
    #[error("the heartbeat interval must be shorter than the minimum election timeout")]
    InvalidHeartbeatInterval,
    /// A gossip cadence was set to zero.
    #[error("retransmit and sync intervals must be non-zero")]
    InvalidGossipInterval,
}

/// A fatal engine error.
///
/// Engines only fail by shutting down; everything network-shaped is absorbed
/// by retry paths and never surfaces here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine task is shutting down and can no longer serve requests.
    #[error("the replication engine is shutting down")]
    ShuttingDown,
}

/// An error related to a client write request against the consensus engine.
#[derive(Debug, Error)]
pub enum ClientWriteError {
    /// The handling replica is not the leader; the operation must be
    /// submitted to the given leader's gateway instead, if one is known.
    #[error("this replica is not the leader; current leader: {0:?}")]
    ForwardToLeader(Option<ReplicaId>),
    /// A fatal engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// An error produced while waiting on a metrics condition.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The condition did not hold before the timeout elapsed.
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    /// The engine closed its metrics channel.
    #[error("the engine is shutting down")]
    ShuttingDown,
}
