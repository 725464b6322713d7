//! A replicated key-to-integer store in two independent variants sharing one
//! codebase.
//!
//! The [`consensus`] module holds the strongly consistent variant: a
//! leader-based replicated log in the style of Raft, applied to an in-memory
//! key/value state machine. The [`causal`] module holds the eventually
//! consistent variant: reliable causal broadcast over a last-writer-wins
//! add/remove store, with periodic anti-entropy for convergence recovery.
//!
//! Each engine runs as a spawned tokio task owning all of its mutable state.
//! The public handles ([`consensus::Consensus`], [`causal::Causal`]) talk to
//! the core task over channels, and observe it through a watch-published
//! metrics payload (see [`metrics`]).
//!
//! Replication between cluster members travels as UDP datagrams carrying
//! UTF-8 JSON frames; the [`transport`] module holds the datagram seam and
//! its production implementation.

pub mod causal;
pub mod config;
pub mod consensus;
pub mod error;
pub mod metrics;
pub mod quorum;
pub mod transport;

pub use config::Config;
pub use error::ClientWriteError;
pub use error::ConfigError;
pub use error::EngineError;
pub use metrics::CausalMetrics;
pub use metrics::ConsensusMetrics;
pub use metrics::Wait;
pub use transport::Datagrams;
pub use transport::UdpTransport;

/// A replica's unique ID within the cluster.
///
/// IDs index the statically configured address table and also serve as the
/// tie-breaker for concurrent CRDT updates, so they must be distinct.
pub type ReplicaId = u64;
