//! The datagram transport seam and its UDP implementation.
//!
//! Both engines replicate over unreliable fire-and-forget datagrams;
//! receivers must tolerate duplicates, reordering, and loss. The engines
//! depend only on the [`Datagrams`] trait for the send side, so tests can
//! substitute an in-memory router. Inbound frames are pushed into an engine
//! through its `inbound` method by whoever owns the socket.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::Config;
use crate::ReplicaId;

/// An interface for sending a single datagram to a cluster member.
///
/// Sends are best-effort: an `Err` means the frame was certainly not
/// delivered, an `Ok` means nothing more than that it was handed to the
/// network. Reliability is the caller's concern (heartbeat probes on the
/// consensus side, retransmission and anti-entropy on the causal side).
#[async_trait]
pub trait Datagrams: Send + Sync + 'static {
    /// Send one datagram to the target replica.
    async fn send(&self, target: ReplicaId, payload: Vec<u8>) -> Result<()>;
}

/// The production transport: one bound UDP socket per replica.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: BTreeMap<ReplicaId, SocketAddr>,
    max_datagram_len: usize,
}

impl UdpTransport {
    /// Bind the socket listed for `id` in the config's address table.
    pub async fn bind(id: ReplicaId, config: &Config) -> Result<Self> {
        let addr = config
            .replicas
            .get(&id)
            .with_context(|| format!("replica {} is not in the address table", id))?;
        let socket = UdpSocket::bind(addr).await.with_context(|| format!("binding udp socket at {}", addr))?;
        tracing::info!(%addr, "transport bound");
        Ok(Self {
            socket: Arc::new(socket),
            peers: config.replicas.clone(),
            max_datagram_len: config.max_datagram_len,
        })
    }

    /// Spawn the receive pump: every inbound datagram is handed to `sink`
    /// as a raw frame. Decoding (and dropping of malformed frames) is the
    /// engine's job.
    ///
    /// The task runs until aborted; the returned handle is the shutdown
    /// lever.
    pub fn spawn_receiver<F>(&self, sink: F) -> JoinHandle<()>
    where F: Fn(Vec<u8>) + Send + 'static {
        let socket = self.socket.clone();
        let max_len = self.max_datagram_len;
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_len];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _from)) => sink(buf[..len].to_vec()),
                    Err(err) => {
                        tracing::warn!(error=%err, "udp receive failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Datagrams for UdpTransport {
    async fn send(&self, target: ReplicaId, payload: Vec<u8>) -> Result<()> {
        let addr = self
            .peers
            .get(&target)
            .with_context(|| format!("replica {} is not in the address table", target))?;
        let sent = self.socket.send_to(&payload, addr).await.with_context(|| format!("sending datagram to {}", addr))?;
        if sent != payload.len() {
            // The frame is lost; the retry paths will recover it.
            tracing::error!(target, sent, len = payload.len(), "datagram split");
        }
        Ok(())
    }
}
