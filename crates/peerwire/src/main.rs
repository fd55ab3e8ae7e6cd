#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use peerwire::config::{Args, NodeConfig};
use peerwire::metrics::{start_metrics_server, NodeStatus};
use peerwire::transport::TcpTransport;
use peerwire::{Communication, RemotePeer};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: NodeConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let transport = Arc::new(TcpTransport::new(config.listen));
    let comm = Arc::new(Communication::new(&config, transport));

    if let Some(metrics_addr) = config.metrics_addr {
        let status: Arc<dyn NodeStatus> = comm.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr, status).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    comm.subscribe_connect(|conn| {
        info!(peer = %conn.identity(), endpoint = %conn.endpoint(), "peer connected");
        Ok(())
    });
    comm.subscribe_disconnect(|event| {
        info!(
            peer = %event.connection.identity(),
            reason = %event.reason,
            by_peer = event.by_peer,
            "peer disconnected"
        );
        Ok(())
    });
    comm.subscribe_message(|incoming| {
        info!(
            peer = %incoming.connection.identity(),
            code = incoming.message.code(),
            bytes = incoming.message.payload().len(),
            "message received"
        );
        Ok(())
    });

    let addr = comm.start().await?;
    info!(identity = %comm.local_identity(), "node listening on {}", addr);

    for endpoint in &config.peers {
        let comm = Arc::clone(&comm);
        let peer = RemotePeer::new(endpoint.clone());
        tokio::spawn(async move {
            match comm.connect(&peer).await {
                Ok(conn) => {
                    info!(peer = %conn.identity(), endpoint = %peer.endpoint(), "dialed peer");
                }
                Err(e) => {
                    warn!(endpoint = %peer.endpoint(), "failed to dial peer: {}", e);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    comm.stop().await?;

    Ok(())
}
