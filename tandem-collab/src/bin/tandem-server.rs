//! Standalone sync server.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]);
//! log filtering from `RUST_LOG`.

use log::{error, info};
use tandem_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No TANDEM_STORAGE_PATH set; documents are kept in memory"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open document store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if let Err(e) = server.service().close() {
        error!("Failed to flush store: {e}");
        std::process::exit(1);
    }
}
