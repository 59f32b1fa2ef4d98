//! Participant node
//!
//! Replays the lock log, restores surviving locks, then serves coordinator
//! queries for the source files in its working directory. By default each
//! query is put to the operator on stdin; `--auto-approve` answers yes to
//! everything. Runs until killed.

use clap::Parser;
use mosaic_rust::{ApprovalPolicy, AutoApprove, Network, NetworkConfig, Participant};
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "participant", about = "Mosaic 2PC participant")]
struct Args {
    /// Port to listen on
    port: u16,

    /// This node's identifier (what coordinators call it)
    node_id: String,

    /// Working directory (source files and the lock log live here)
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Approve every query without asking the operator
    #[arg(long)]
    auto_approve: bool,
}

/// Ask the operator on stdin whether to contribute the named files.
struct StdinPrompt;

impl ApprovalPolicy for StdinPrompt {
    fn approve(&self, image: &[u8], files: &[String]) -> bool {
        print!(
            "contribute {:?} to a {}-byte composite? [y/N] ",
            files,
            image.len()
        );
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let policy: Arc<dyn ApprovalPolicy> = if args.auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinPrompt)
    };

    let participant = Participant::new(args.node_id.clone(), &args.dir, policy)
        .map_err(|e| format!("failed to open lock log: {}", e))?;

    let network = Network::new(args.node_id.clone(), NetworkConfig::default());
    let listen_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let bound = network
        .start_listener(listen_addr, participant.handler())
        .await?;
    info!(node = %args.node_id, addr = %bound, "participant listening");

    participant
        .recover()
        .map_err(|e| format!("lock log replay failed: {}", e))?;
    info!(node = %args.node_id, locks = participant.lock_count(), "recovery complete");

    std::future::pending::<()>().await;
    Ok(())
}
