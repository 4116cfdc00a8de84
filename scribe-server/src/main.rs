//! Scribe hub server.
//!
//! Configuration comes from `SCRIBE_*` environment variables, logging from
//! `RUST_LOG`.

use std::time::Duration;
use log::{error, info};
use scribe_hub::{HubServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting Scribe hub on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("RocksDB at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = match HubServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open snapshot store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if !server.shutdown(Duration::from_secs(5)).await {
        error!("Some snapshots were not persisted before exit");
    }
}
