//! The compiled-in default cluster: three replicas on loopback.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;

use anyhow::Result;

use replikv::Config;
use replikv::ReplicaId;

fn loopback_table(ids: &[ReplicaId], udp_port: u16) -> BTreeMap<ReplicaId, SocketAddr> {
    // Replicas share a port on distinct loopback addresses, so a whole
    // cluster can run on one machine.
    ids.iter()
        .enumerate()
        .map(|(n, id)| (*id, SocketAddr::from((Ipv4Addr::new(127, 0, 0, 2 + n as u8), udp_port))))
        .collect()
}

fn gateway_table(ids: &[ReplicaId], port_base: u16) -> BTreeMap<ReplicaId, String> {
    ids.iter().map(|id| (*id, format!("localhost:{}", port_base + *id as u16))).collect()
}

/// The consensus service cluster: replicas 2, 3, 4 with gateways on
/// `localhost:3333<id>`.
pub fn consensus_config() -> Result<Config> {
    let ids = [2, 3, 4];
    let config = Config::build("consensus".into())
        .replicas(loopback_table(&ids, 32000))
        .gateways(gateway_table(&ids, 33330))
        .validate()?;
    Ok(config)
}

/// The causal service cluster: replicas 0, 1, 2 with gateways on
/// `localhost:3333<id>`.
pub fn causal_config() -> Result<Config> {
    let ids = [0, 1, 2];
    let config = Config::build("causal".into())
        .replicas(loopback_table(&ids, 32100))
        .gateways(gateway_table(&ids, 33330))
        .validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clusters_validate() {
        let consensus = consensus_config().unwrap();
        assert_eq!(consensus.cluster_size(), 3);
        assert_eq!(consensus.gateways.get(&2).map(String::as_str), Some("localhost:33332"));

        let causal = causal_config().unwrap();
        assert_eq!(causal.cluster_size(), 3);
        assert!(causal.replicas.contains_key(&0));
    }
}
