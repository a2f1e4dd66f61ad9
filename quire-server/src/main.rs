use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use quire_sync::{ServerConfig, StaticAccessControl, SyncServer};

/// Document sync server: update log, presence registry and change feeds.
#[derive(Debug, Parser)]
#[command(name = "quire-server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "QUIRE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; tables are kept in memory when omitted
    #[arg(long, env = "QUIRE_STORAGE")]
    storage: Option<PathBuf>,

    /// JSON file with sessions, scope memberships and document ownership
    #[arg(long, env = "QUIRE_ACCESS")]
    access: PathBuf,

    /// Seconds after which a presence row without a heartbeat is dropped
    #[arg(long, env = "QUIRE_PRESENCE_TTL", default_value_t = 30)]
    presence_ttl: u64,

    /// Live rows a feed subscriber may fall behind before it is evicted
    #[arg(long, env = "QUIRE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Largest accepted update or presence body, in bytes
    #[arg(long, env = "QUIRE_MAX_PAYLOAD", default_value_t = 16 * 1024 * 1024)]
    max_payload: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.storage.clone(),
            broadcast_capacity: self.broadcast_capacity,
            presence_ttl: Duration::from_secs(self.presence_ttl),
            max_payload_bytes: self.max_payload,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("Starting quire-server...");

    let access = match StaticAccessControl::load(&args.access) {
        Ok(access) => access,
        Err(e) => {
            error!("Cannot load access table {}: {e}", args.access.display());
            std::process::exit(1);
        }
    };

    let server = match SyncServer::new(args.server_config(), Arc::new(access)) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot open storage: {e}");
            std::process::exit(1);
        }
    };

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            stopper.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
