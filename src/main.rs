//! Standalone DHT node.
//!
//! Starts a connection manager (WebSocket server and, with `--nat`, an iroh
//! endpoint), joins through the given entry points and logs telemetry until
//! interrupted.
//!
//! ```bash
//! RUST_LOG=mesh_dht=debug cargo run -- --ws-port-min 23000 --ws-port-max 23010 \
//!     --entry-point 203.0.113.5:23000:<hex node id>
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::time;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesh_dht::config::{NodeConfigFile, PortRange};
use mesh_dht::connection::{ConnectionManager, DefaultConnectorFacade};
use mesh_dht::identifier::{parse_node_id, random_node_id};
use mesh_dht::{ConnectivityMethod, DhtNode, PeerDescriptor};

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "mesh-dht", about = "Run a Kademlia DHT node")]
struct Args {
    /// Host advertised for the WebSocket server.
    #[arg(long, env = "MESH_DHT_WS_HOST")]
    ws_host: Option<String>,

    #[arg(long, requires = "ws_port_max")]
    ws_port_min: Option<u16>,

    #[arg(long, requires = "ws_port_min")]
    ws_port_max: Option<u16>,

    /// Entry point as `host:port:hex-node-id`. May be repeated.
    #[arg(long = "entry-point", value_parser = parse_entry_point)]
    entry_points: Vec<PeerDescriptor>,

    /// JSON file with `dht` and `connection` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable the NAT-traversing iroh endpoint.
    #[arg(long)]
    nat: bool,

    /// Hex node id; random when omitted.
    #[arg(long)]
    node_id: Option<String>,
}

fn parse_entry_point(raw: &str) -> Result<PeerDescriptor> {
    let mut parts = raw.rsplitn(3, ':');
    let (Some(id), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("expected host:port:hex-node-id, got {raw}");
    };
    let node_id = parse_node_id(id).ok_or_else(|| anyhow!("invalid node id {id}"))?;
    let port: u16 = port.parse().with_context(|| format!("invalid port {port}"))?;
    Ok(PeerDescriptor::new(node_id).with_websocket(ConnectivityMethod {
        host: host.to_string(),
        port,
        tls: false,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut file = match &args.config {
        Some(path) => NodeConfigFile::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfigFile::default(),
    };
    if args.ws_host.is_some() {
        file.connection.websocket_host = args.ws_host.clone();
    }
    if let (Some(min), Some(max)) = (args.ws_port_min, args.ws_port_max) {
        file.connection.websocket_port_range = Some(PortRange { min, max });
    }
    file.connection.entry_points.extend(args.entry_points.iter().cloned());
    file.connection.nat_traversal |= args.nat;

    let node_id = match &args.node_id {
        Some(hex_id) => parse_node_id(hex_id).ok_or_else(|| anyhow!("invalid node id {hex_id}"))?,
        None => random_node_id(),
    };

    let facade = Arc::new(DefaultConnectorFacade::new(file.connection.clone()));
    let manager = ConnectionManager::start(file.connection.clone(), node_id, facade).await?;
    let node = DhtNode::attach(manager, file.dht.clone())?;
    let local = node.local_peer().clone();
    info!(
        node_id = %hex::encode(local.node_id),
        websocket = ?local.websocket.as_ref().map(|w| w.url()),
        nat_addr = ?local.nat_addr,
        "node started"
    );

    let entry_points = file.connection.entry_points.clone();
    let join_node = node.clone();
    tokio::spawn(async move {
        join_node.join_dht(&entry_points).await;
        info!(state = ?join_node.join_state(), "join finished");
    });

    let telemetry_node = node.clone();
    let telemetry = tokio::spawn(async move {
        let mut ticker = time::interval(TELEMETRY_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = telemetry_node.telemetry_snapshot().await;
            info!(
                routing_table_size = snapshot.routing_table_size,
                stored_keys = snapshot.stored_keys,
                join_state = ?snapshot.join_state,
                "telemetry"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    telemetry.abort();
    node.stop().await;
    Ok(())
}
