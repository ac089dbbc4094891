use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use pulse_live::auth::StaticIdentityVerifier;
use pulse_live::config::ServerConfig;
use pulse_live::core::ServerState;
use pulse_live::handlers::routes;
use pulse_live::storage::{MemoryStorage, StorageProvider};

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, claim window={}s, anonymous={}",
        config.host,
        config.port,
        config.claim_window.as_secs(),
        config.allow_anonymous
    );

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let verifier = StaticIdentityVerifier::new(config.static_tokens.clone());
    if verifier.is_empty() && !config.allow_anonymous {
        warn!("Anonymous access is disabled and no tokens are configured; every handshake will fail");
    }

    let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
    let state = ServerState::new(config, storage, Arc::new(verifier));
    let _tasks = state.start_background_tasks();

    info!("Starting PulseLive server on {}", addr);
    warp::serve(routes(state)).run(addr).await;
}
