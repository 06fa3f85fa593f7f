//! Development sync server.
//!
//! Usage: `tracker-sync-server [config.json]`
//!
//! The config file overrides any subset of the defaults:
//!
//! ```json
//! {
//!   "bind_addr": "0.0.0.0:9090",
//!   "heartbeat_interval_secs": 20,
//!   "tokens": [{ "token": "dev-ana", "user": "ana", "workspaces": ["P1", "P3"] }]
//! }
//! ```

use std::error::Error;
use std::sync::Arc;

use log::info;
use serde::Deserialize;
use tracker_sync::{ServerConfig, StaticDirectory, SyncServer, WorkspaceId};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    server: ServerConfig,
    tokens: Vec<TokenGrant>,
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    token: String,
    user: String,
    #[serde(default)]
    workspaces: Vec<WorkspaceId>,
}

fn load_config() -> Result<FileConfig, Box<dyn Error + Send + Sync>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            info!("Loaded config from {path}");
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(FileConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();

    let config = load_config()?;
    let directory = Arc::new(StaticDirectory::new());
    for grant in config.tokens {
        let session = directory.insert(grant.token, grant.user.as_str(), grant.workspaces);
        info!("Registered {} as session {session}", grant.user);
    }
    if directory.is_empty() {
        log::warn!("No tokens configured; every handshake will be rejected");
    }

    SyncServer::new(config.server, directory).run().await
}
