use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use flotilla::config::NodeConfig;
use flotilla::kv::MemoryKvStore;
use flotilla::node::Node;
use flotilla::shutdown::install_shutdown_handler;
use flotilla::supervisor::FakeUnitManager;

#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(about = "Distributed init-system orchestrator (standalone single-node mode)")]
struct Args {
    /// Root of the cluster keyspace
    #[arg(long, default_value = "/flotilla")]
    key_prefix: String,

    /// File to read this machine's boot ID from
    #[arg(long)]
    boot_id_path: Option<PathBuf>,

    /// Address other machines can reach this one at
    #[arg(long)]
    public_ip: Option<String>,

    /// Machine metadata (comma-separated, format: "key=value")
    /// Example: "region=us-east,disk=ssd"
    #[arg(long, default_value = "")]
    metadata: String,

    /// Do not contend for the engine role
    #[arg(long)]
    no_engine: bool,

    /// Machine record TTL in seconds
    #[arg(long, default_value = "60")]
    machine_ttl: u64,

    /// Engine lease TTL in seconds
    #[arg(long, default_value = "10")]
    lease_ttl: u64,

    /// Per-job heartbeat TTL in seconds
    #[arg(long, default_value = "20")]
    job_heartbeat_ttl: u64,
}

fn parse_metadata(metadata: &str) -> BTreeMap<String, String> {
    metadata
        .split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((key, value)) => Some((key.trim().to_string(), value.trim().to_string())),
                None => {
                    tracing::warn!(pair, "Invalid metadata entry, expected key=value");
                    None
                }
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = NodeConfig {
        key_prefix: args.key_prefix,
        boot_id_path: args.boot_id_path,
        public_ip: args.public_ip,
        metadata: parse_metadata(&args.metadata),
        run_engine: !args.no_engine,
        machine_ttl: Duration::from_secs(args.machine_ttl),
        lease_ttl: Duration::from_secs(args.lease_ttl),
        job_heartbeat_ttl: Duration::from_secs(args.job_heartbeat_ttl),
        ..Default::default()
    };

    // Standalone mode: an embedded store and fake supervisor stand in
    // for the external KV cluster and process supervisor.
    let kv = Arc::new(MemoryKvStore::new());
    let manager = Arc::new(FakeUnitManager::new());

    let node = Node::new(config, kv, manager)?;
    tracing::info!(machine = %node.machine_id(), "Starting flotilla in standalone mode");

    let cancel = install_shutdown_handler();
    node.run(cancel).await;

    Ok(())
}
