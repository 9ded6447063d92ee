//! Thin process wrapper around a [`DhtNode`] and a [`PeerService`] for
//! manual runs and integration testing. Not an application front-end in its
//! own right -- it wires the two façades to one HTTP listener and otherwise
//! gets out of the way.

use clap::Parser;
use meshcore::config::MeshConfig;
use meshcore::crypto::IdentityKeyPair;
use meshcore::dht::{self, DhtNode};
use meshcore::node_id::NodeId;
use meshcore::peer_service::{self, PeerService};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshcore-node", about = "Standalone mesh-core peer/DHT node")]
struct Args {
    /// Host to listen on and advertise to peers.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on and advertise to peers.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Directory holding this node's identity seed and config.
    #[arg(long, default_value = "./meshcore-data")]
    data_dir: PathBuf,

    /// `host:port` of a known peer to bootstrap the DHT routing table from.
    /// May be repeated.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Verbosity: repeat for more detail (-v, -vv, -vvv). Overridden by
    /// `RUST_LOG` if that's set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const IDENTITY_FILE: &str = "identity.seed";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_logging(args.verbose);

    tokio::fs::create_dir_all(&args.data_dir).await?;
    let identity = load_or_generate_identity(&args.data_dir).await?;
    let node_id = NodeId::from_bytes(&identity.public_key());
    info!(node_id = %node_id.to_hex(), host = %args.host, port = args.port, "starting meshcore node");

    let config = load_config(&args.data_dir).await?;

    let dht_node = DhtNode::new(node_id, args.host.clone(), args.port, config.dht.clone());
    let dht_tasks = dht_node.spawn_background_tasks();

    let bootstrap_endpoints = parse_bootstrap_endpoints(&args.bootstrap);
    if !bootstrap_endpoints.is_empty() {
        let unreachable = dht_node.bootstrap(&bootstrap_endpoints).await;
        info!(
            attempted = bootstrap_endpoints.len(),
            unreachable, "dht bootstrap complete"
        );
    }

    let peer_service = PeerService::new(identity, config);
    let peer_tasks = peer_service.spawn_background_tasks();

    let app = dht::rpc::router(dht_node.clone()).merge(peer_service::transport::router(peer_service.clone()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dht_node.shutdown();
    peer_service.shutdown();
    for task in dht_tasks.into_iter().chain(peer_tasks) {
        task.abort();
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "meshcore=info",
        1 => "meshcore=debug",
        _ => "meshcore=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn load_or_generate_identity(data_dir: &std::path::Path) -> Result<IdentityKeyPair, BoxError> {
    let path = data_dir.join(IDENTITY_FILE);
    if let Ok(bytes) = tokio::fs::read(&path).await {
        if bytes.len() == 32 {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            return Ok(IdentityKeyPair::from_seed(seed));
        }
    }
    // IdentityKeyPair::generate() doesn't expose its seed, so generate the
    // seed here and derive from it, letting it double as the persisted form.
    let mut seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
    tokio::fs::write(&path, seed).await?;
    Ok(IdentityKeyPair::from_seed(seed))
}

async fn load_config(data_dir: &std::path::Path) -> Result<MeshConfig, BoxError> {
    let path = data_dir.join("config.toml");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(MeshConfig::from_toml_str(&contents)?),
        Err(_) => Ok(MeshConfig::default()),
    }
}

fn parse_bootstrap_endpoints(raw: &[String]) -> Vec<(String, u16)> {
    raw.iter()
        .filter_map(|entry| {
            let (host, port) = entry.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            Some((host.to_string(), port))
        })
        .collect()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
