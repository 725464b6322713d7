//! Process bootstrap shared by the two service binaries.

pub mod cluster;
pub mod gateway;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tracing_subscriber::prelude::*;

use replikv::ReplicaId;

/// The positional arguments every service binary takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerArgs {
    /// The TCP port the HTTP gateway listens on.
    pub http_port: u16,
    /// This replica's ID; indexes the compiled-in address table.
    pub replica_id: ReplicaId,
}

impl ServerArgs {
    /// Parse `<http_port> <replica_id>` from the process arguments.
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let program = args.next().unwrap_or_else(|| "replikv-server".to_owned());
        let usage = format!("usage: {} <http_port> <replica_id>", program);
        let http_port = match args.next() {
            Some(raw) => raw.parse::<u16>().with_context(|| usage.clone())?,
            None => bail!("not enough arguments\n{}", usage),
        };
        let replica_id = match args.next() {
            Some(raw) => raw.parse::<ReplicaId>().with_context(|| usage.clone())?,
            None => bail!("not enough arguments\n{}", usage),
        };
        Ok(Self { http_port, replica_id })
    }
}

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
