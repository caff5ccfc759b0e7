// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use geop2p_core::{
    Clock, GpsLocation, InMemorySpatialDb, MaintenanceScheduler, NetworkEndpoint, NodeConfig,
    NodeContact, NodeId, NodeInfo, NodeProfile, OverlayServer, SpatialDatabase, SqliteSpatialDb,
    SystemClock, TcpProxyFactory,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geop2p")]
#[command(about = "Location-based overlay node")]
struct Cli {
    /// Unique identity of this node.
    #[arg(long)]
    node_id: String,

    /// Fixed latitude of this node, decimal degrees.
    #[arg(long)]
    latitude: f64,

    /// Fixed longitude of this node, decimal degrees.
    #[arg(long)]
    longitude: f64,

    /// Externally visible address of this node.
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port of the node-to-node protocol.
    #[arg(long, default_value_t = 16980)]
    node_port: u16,

    /// Port of the local service and client protocol.
    #[arg(long, default_value_t = 16981)]
    client_port: u16,

    /// Seed endpoints for bootstrap, as ip:port.
    #[arg(long = "seed", value_name = "IP:PORT", num_args = 0..)]
    seeds: Vec<String>,

    /// Path of the spatial database; omit for a memory-only node.
    #[arg(long)]
    db: Option<String>,

    #[arg(long, default_value_t = 5)]
    neighbourhood_size: usize,

    #[arg(long, default_value_t = 60)]
    db_maintenance_secs: u64,

    #[arg(long, default_value_t = 86400)]
    db_expiration_secs: u64,

    #[arg(long, default_value_t = 300)]
    discovery_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let node_info = NodeInfo {
        profile: NodeProfile {
            id: NodeId::new(cli.node_id).context("node id")?,
            contact: NodeContact {
                address: cli.address,
                node_port: cli.node_port,
                client_port: cli.client_port,
            },
        },
        location: GpsLocation::new(cli.latitude, cli.longitude).context("node location")?,
    };

    let mut config = NodeConfig::new(node_info.clone());
    config.neighbourhood_target_size = cli.neighbourhood_size;
    config.db_maintenance_period = Duration::from_secs(cli.db_maintenance_secs);
    config.db_expiration_period = Duration::from_secs(cli.db_expiration_secs);
    config.discovery_period = Duration::from_secs(cli.discovery_secs);
    for seed in &cli.seeds {
        let addr: SocketAddr = seed.parse().with_context(|| format!("seed {seed}"))?;
        config.seed_nodes.push(NetworkEndpoint {
            address: addr.ip(),
            port: addr.port(),
        });
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db: Arc<dyn SpatialDatabase> = match &cli.db {
        Some(path) => SqliteSpatialDb::open(
            path,
            node_info.clone(),
            Arc::clone(&clock),
            config.db_expiration_period,
        )
        .context("open spatial database")?,
        None => InMemorySpatialDb::new(
            node_info.clone(),
            Arc::clone(&clock),
            config.db_expiration_period,
        )
        .context("open spatial database")?,
    };

    let node = geop2p_core::Node::new(config, db, TcpProxyFactory::new());

    let bind_addr = |port| SocketAddr::new("0.0.0.0".parse().expect("valid ip"), port);
    let server = OverlayServer::start(
        Arc::clone(&node),
        bind_addr(cli.node_port),
        bind_addr(cli.client_port),
    )
    .await
    .context("start listeners")?;

    if let Err(err) = node.ensure_map_filled().await {
        info!(%err, "initial bootstrap incomplete, maintenance will retry");
    }
    let scheduler = MaintenanceScheduler::start(Arc::clone(&node));

    info!(node_id = %node.node_info().id(), "node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    info!("shutting down");
    scheduler.shutdown().await;
    server.shutdown().await;
    Ok(())
}
