//! peerlite node
//!
//! Runs a single assembled host:
//! 1. Joins the public routing table through the default bootstrap peers
//! 2. Finds local peers through the private routing table
//!
//! Usage:
//!   peerlite-node --listen /ip4/0.0.0.0/tcp/4001 --datastore node.db
//!
//! With `--swarm-key` the node joins a private network and only talks to
//! peers holding the same key.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use peerlite_host::{
    assemble_host, default_agent_version, default_bootstrap_peers, load_or_generate_identity,
    CancellationToken, Multiaddr, PrivateNetworkKey, RoutingMode, RoutingTablePair,
};
use peerlite_node::{build_router, IdentityResponse, NodeConfig};
use peerlite_store::{Datastore, SqliteDatastore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 4001;

#[derive(Parser, Debug)]
#[command(name = "peerlite-node")]
#[command(about = "Standalone peerlite node")]
struct Args {
    /// Address to listen on (repeatable)
    #[arg(short, long)]
    listen: Vec<Multiaddr>,

    /// Path to identity key file
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Path to a swarm.key file; joins the private network it describes
    #[arg(long)]
    swarm_key: Option<PathBuf>,

    /// SQLite file for routing records
    #[arg(long)]
    datastore: Option<PathBuf>,

    /// Routing mode: client, server or auto
    #[arg(long)]
    dht_mode: Option<RoutingMode>,

    /// HTTP API port for identity endpoint
    #[arg(long)]
    http_port: Option<u16>,

    /// Do not contact the default bootstrap peers
    #[arg(long)]
    no_bootstrap: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    info!("peerlite node starting...");
    let identity_path = args
        .identity
        .clone()
        .or_else(|| config.identity.clone())
        .unwrap_or_else(|| PathBuf::from("node-identity.key"));
    let keypair = load_or_generate_identity(&identity_path)?;

    let secret = match args.swarm_key.as_ref().or(config.swarm_key.as_ref()) {
        Some(path) => {
            let key = PrivateNetworkKey::load(path)?;
            info!("Joining private network {}", key.fingerprint());
            Some(key)
        }
        None => None,
    };

    let store: Option<Arc<dyn Datastore>> =
        match args.datastore.as_ref().or(config.datastore.as_ref()) {
            Some(path) => {
                let store = SqliteDatastore::open(path)
                    .with_context(|| format!("Failed to open datastore {}", path.display()))?;
                Some(Arc::new(store))
            }
            None => None,
        };

    let listen_addrs = listen_addrs(&args, &config, secret.is_some())?;
    let mode = args.dht_mode.or(config.dht_mode).unwrap_or_default();

    let cancel = CancellationToken::new();
    let (host, routing) = assemble_host(
        &cancel,
        keypair,
        secret.as_ref().map(|key| &key.as_bytes()[..]),
        listen_addrs,
        store,
        mode,
        config.host_options(),
    )
    .await?;

    let identity_state = Arc::new(IdentityResponse::from_host(&host, &default_agent_version()));
    let http_port = args.http_port.or(config.http_port).unwrap_or(DEFAULT_PORT + 1);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", http_port))?;
    info!("HTTP identity endpoint listening on port {}", http_port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, build_router(identity_state)).await {
            warn!("HTTP server failed: {}", e);
        }
    });

    println!("\n========================================");
    println!("  peerlite node running");
    println!("========================================");
    println!("  PeerId:    {}", host.peer_id());
    println!("  Network:   {}", if host.is_private() { "private" } else { "public" });
    println!("  DHT mode:  {}", mode);
    println!("  HTTP Port: {}", http_port);
    for addr in host.listen_addrs() {
        println!("  Listening: {}/p2p/{}", addr, host.peer_id());
    }
    println!("========================================\n");

    let bootstrap = config.bootstrap.unwrap_or(true) && !args.no_bootstrap;
    if bootstrap && !host.is_private() {
        tokio::spawn(join_public_network(routing.clone()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");
    cancel.cancel();
    host.close().await;
    Ok(())
}

fn listen_addrs(args: &Args, config: &NodeConfig, private: bool) -> Result<Vec<Multiaddr>> {
    if !args.listen.is_empty() {
        return Ok(args.listen.clone());
    }
    if !config.listen.is_empty() {
        return config
            .listen
            .iter()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("Invalid listen address {}", addr))
            })
            .collect();
    }
    let mut addrs = vec![format!("/ip4/0.0.0.0/tcp/{}", DEFAULT_PORT).parse()?];
    if !private {
        addrs.push(format!("/ip4/0.0.0.0/udp/{}/quic-v1", DEFAULT_PORT).parse()?);
    }
    Ok(addrs)
}

async fn join_public_network(routing: RoutingTablePair) {
    for peer in default_bootstrap_peers() {
        for addr in peer.addrs {
            if let Err(e) = routing.public().add_address(peer.peer_id, addr).await {
                warn!("Failed to add bootstrap peer {}: {}", peer.peer_id, e);
            }
        }
    }
    match routing.bootstrap().await {
        Ok(()) => info!("Routing bootstrap completed"),
        Err(e) => warn!("Routing bootstrap failed: {}", e),
    }
}
