//! Coordinator server
//!
//! Listens for participant replies, recovers any interrupted commits from
//! the log directory, then reads commit commands from stdin:
//!
//! ```text
//! commit composites/1.jpg img/1.jpg a:1.jpg,b:3.jpg,c:6.jpg
//! ```
//!
//! Runs until killed.

use clap::Parser;
use mosaic_rust::{Coordinator, CoordinatorConfig, Network, NetworkConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coordinator", about = "Mosaic 2PC coordinator")]
struct Args {
    /// Port to listen on
    port: u16,

    /// Participant address, repeatable: --peer <node_id>=<host:port>
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, SocketAddr)>,

    /// Working directory (commit logs and composites live here)
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

fn parse_peer(s: &str) -> Result<(String, SocketAddr), String> {
    let (node, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <node_id>=<host:port>, got {:?}", s))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("bad address {:?}: {}", addr, e))?;
    Ok((node.to_string(), addr))
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let network = Network::new("coordinator", NetworkConfig::default());
    for (node, addr) in &args.peers {
        network.add_peer(node.clone(), *addr);
    }

    let coordinator = Coordinator::new(
        Arc::clone(&network),
        &args.dir,
        CoordinatorConfig::default(),
    );

    let listen_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let bound = network
        .start_listener(listen_addr, coordinator.handler())
        .await?;
    info!(addr = %bound, "coordinator listening");

    coordinator
        .recover()
        .await
        .map_err(|e| format!("recovery failed: {}", e))?;
    info!("ready for commits");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line) {
            Ok((file_name, image_path, sources)) => {
                let image = match std::fs::read(&image_path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(image = %image_path.display(), error = %e,
                               "cannot read image");
                        continue;
                    }
                };
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator.start_commit(&file_name, image, &sources).await;
                });
            }
            Err(e) => error!(error = %e, "bad command"),
        }
    }

    // Stdin closed; keep serving recoveries and in-flight commits.
    std::future::pending::<()>().await;
    Ok(())
}

/// `commit <file_name> <image_path> <node:file>[,<node:file>...]`
fn parse_command(line: &str) -> Result<(String, PathBuf, Vec<String>), String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("commit"), Some(file_name), Some(image), Some(sources), None) => Ok((
            file_name.to_string(),
            PathBuf::from(image),
            sources.split(',').map(|s| s.to_string()).collect(),
        )),
        _ => Err(format!(
            "expected: commit <file_name> <image_path> <sources>, got {:?}",
            line
        )),
    }
}
