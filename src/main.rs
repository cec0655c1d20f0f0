use clap::{Arg, Command};
use namestore::{Config, KeepCurrentActives, LocalCluster, NameStoreError};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), NameStoreError> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("NameStore")
        .version("0.1.0")
        .about("Replicated name service running as an in-process cluster")
        .arg(
            Arg::new("nodes")
                .long("nodes")
                .help("Number of name servers to run")
                .default_value("5"),
        )
        .arg(
            Arg::new("controllers")
                .long("controllers")
                .help("Replica controllers per name (defaults to 3)")
                .required(false),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON config whose settings every node starts from")
                .required(false),
        )
        .get_matches();

    let template = match matches.get_one::<String>("config") {
        Some(path) => Some(Config::from_file(path)?),
        None => None,
    };

    let nodes = match &template {
        Some(template) => template.peers.len() as u32,
        None => matches
            .get_one::<String>("nodes")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|e| NameStoreError::InvalidConfig(format!("Invalid node count: {}", e)))?
            .unwrap_or(5),
    };

    let controllers = matches
        .get_one::<String>("controllers")
        .map(|s| s.parse::<usize>())
        .transpose()
        .map_err(|e| NameStoreError::InvalidConfig(format!("Invalid controller count: {}", e)))?;

    info!("Starting NameStore with {} name servers", nodes);

    let mut cluster = LocalCluster::start_with(nodes, Arc::new(KeepCurrentActives), |config| {
        let mut config = match &template {
            Some(template) => {
                let peers = config
                    .peers
                    .iter()
                    .cloned()
                    .map(|mut peer| {
                        peer.latency_ms = template
                            .peers
                            .iter()
                            .find(|known| known.id == peer.id)
                            .and_then(|known| known.latency_ms);
                        peer
                    })
                    .collect();
                Config {
                    node_id: config.node_id,
                    node_ip: config.node_ip,
                    port: config.port,
                    peers,
                    ..template.clone()
                }
            }
            None => config,
        };
        if let Some(controllers) = controllers {
            config.controllers_per_name = controllers;
        }
        config
    })
    .await?;

    info!("Cluster members: {:?}", cluster.node_ids());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cluster.shutdown();
    Ok(())
}
