//! The eventually consistent service: one causal replica plus its HTTP
//! gateway.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio::net::TcpListener;

use replikv::causal::Causal;
use replikv::UdpTransport;
use replikv_server::cluster;
use replikv_server::gateway;
use replikv_server::init_tracing;
use replikv_server::ServerArgs;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = ServerArgs::parse(env::args())?;
    let config = Arc::new(cluster::causal_config()?);
    tracing::info!(id = args.replica_id, "starting causal replica");

    let transport = Arc::new(UdpTransport::bind(args.replica_id, &config).await?);
    let engine = Causal::spawn(args.replica_id, config.clone(), transport.clone());
    let pump = {
        let engine = engine.clone();
        transport.spawn_receiver(move |frame| engine.inbound(frame))
    };

    let app = gateway::causal_app(engine);
    let listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("binding http gateway on port {}", args.http_port))?;
    tracing::info!(port = args.http_port, "gateway listening");
    axum::serve(listener, app).await.context("serving http gateway")?;

    pump.abort();
    Ok(())
}
