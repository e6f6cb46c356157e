//! Ensemble session server.
//!
//! Usage: `ensemble-server [config.json]`
//!
//! Without a config file the server binds the default address and keeps
//! the ledger in memory. Set `RUST_LOG` to change verbosity.

use log::info;

use ensemble_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {path}");
            ServerConfig::from_json_file(&path)?
        }
        None => ServerConfig::default(),
    };

    match &config.storage {
        Some(storage) => info!("Ledger stored at {}", storage.path.display()),
        None => info!("Ledger kept in memory"),
    }

    let server = SyncServer::new(config)?;
    info!("Starting Ensemble session {}", server.session_id());
    server.run().await?;
    Ok(())
}
