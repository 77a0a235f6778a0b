//! cubenode: a content-addressed block store and gossip node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use cubenode::config::Settings;
use cubenode::net::manager::NetworkEvent;
use cubenode::net::{NetworkManager, PeerDb};
use cubenode::store::BlockStore;

#[derive(Parser)]
#[command(name = "cubenode", version, about = "Content-addressed block store and gossip node")]
struct Args {
    /// Local listen port. Implies listening unless --light is also set.
    #[arg(long, default_value = "32100")]
    listen_port: u16,

    /// Peer to dial on startup, as host:port. May be repeated.
    #[arg(long = "initial-peer")]
    initial_peers: Vec<String>,

    /// Run as a light client: never listen, never send periodic hash requests.
    #[arg(long)]
    light: bool,

    /// Directory holding the sled database.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Optional TOML config file overriding defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("cubenode=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => match Settings::from_file(path) {
            Ok(settings) => settings,
            Err(err) => {
                error!(%err, "failed to load config file");
                return;
            }
        },
        None => Settings::default(),
    };
    settings.listen = !args.light;
    settings.listen_port = args.listen_port;
    let settings = Arc::new(settings);

    if let Err(err) = std::fs::create_dir_all(&args.data_dir) {
        error!(%err, "failed to create data directory");
        return;
    }
    let db = match sled::open(&args.data_dir) {
        Ok(db) => db,
        Err(err) => {
            error!(%err, "failed to open store");
            return;
        }
    };
    let store = match BlockStore::open(&db, settings.clone()) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(%err, "failed to open block store");
            return;
        }
    };

    let peerdb = Arc::new(PeerDb::new());
    let manager = Arc::new(NetworkManager::new(settings.clone(), store.clone(), peerdb.clone()));

    info!(listen = settings.listen, port = settings.listen_port, "starting cubenode");

    let listen_handle = settings.listen.then(|| {
        let listen_manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = listen_manager.listen().await {
                error!(%err, "listener stopped");
            }
        })
    });

    for peer in &args.initial_peers {
        let Some((host, port)) = peer.rsplit_once(':') else {
            error!(%peer, "initial peer must be host:port");
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            error!(%peer, "invalid port in initial peer");
            continue;
        };
        peerdb.add_candidate((host.to_string(), port));
    }

    let maintain_manager = manager.clone();
    tokio::spawn(maintain_manager.maintain_connections());

    let announce_manager = manager.clone();
    tokio::spawn(announce_manager.announce_peers());

    let mut events = manager.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NetworkEvent::Online => info!("network online"),
                NetworkEvent::Shutdown => info!("network shut down"),
                NetworkEvent::PeerBlacklisted((host, port)) => {
                    info!(%host, port, "peer blacklisted")
                }
            }
        }
    });

    let eviction_store = store.clone();
    let eviction_interval = settings.eviction_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(eviction_interval);
        loop {
            ticker.tick().await;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let evicted = eviction_store.evict_expired(now);
            if evicted > 0 {
                info!(evicted, "evicted expired blocks");
            }
        }
    });

    let status_manager = manager.clone();
    let status_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let connections = status_manager.connection_count().await;
            let blocks = status_store.all_identities().len();
            let peer_stats = status_manager.peer_stats().await;
            let (tx_bytes, rx_bytes) = peer_stats
                .iter()
                .fold((0u64, 0u64), |(tx, rx), (_, s)| (tx + s.tx.total_bytes, rx + s.rx.total_bytes));
            info!(connections, blocks, tx_bytes, rx_bytes, "status");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    if let Some(handle) = listen_handle {
        handle.abort();
    }
    manager.shutdown().await;
}
