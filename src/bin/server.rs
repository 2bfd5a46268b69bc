//! Relay server launcher: load `ServerProperties` from an optional TOML
//! file, bind the UDP transport, and run [`voxcore::server::RelayServer`]
//! until interrupted.

use std::sync::Arc;

use voxcore::config::ServerProperties;
use voxcore::server::RelayServer;
use voxcore::transport::{Transport, UdpTransport};

fn load_properties() -> anyhow::Result<ServerProperties> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            ServerProperties::from_toml(&raw)
        }
        None => Ok(ServerProperties::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let properties = load_properties()?;
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], properties.port).into();
    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind(addr).await?);
    tracing::info!(%addr, "relay server listening");

    let server = RelayServer::new(properties);
    server.run(transport).await;
    Ok(())
}
