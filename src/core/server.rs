//! Shared server state handed to every request handler

use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::auth::identity::IdentityVerifier;
use crate::config::ServerConfig;
use crate::core::collectible::CollectibleEngine;
use crate::core::dispatcher::SessionDispatcher;
use crate::core::rate_limiter::FailureRateLimiter;
use crate::core::registry::ConnectionRegistry;
use crate::core::scheduler::{self, DropPolicy};
use crate::storage::StorageProvider;

/// Everything a handler needs, cheap to clone
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<CollectibleEngine>,
    pub dispatcher: Arc<SessionDispatcher>,
    pub rate_limiter: Arc<FailureRateLimiter>,
    pub storage: Arc<dyn StorageProvider>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn StorageProvider>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
        let engine = Arc::new(CollectibleEngine::new(
            Arc::clone(&storage),
            config.claim_window,
            config.store_timeout,
        ));
        let dispatcher = Arc::new(SessionDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            Arc::clone(&storage),
            &config,
        ));
        let rate_limiter = Arc::new(FailureRateLimiter::new(
            config.rate_limit_max_attempts,
            config.rate_limit_window,
            config.rate_limit_block,
        ));

        Self {
            config: Arc::new(config),
            registry,
            engine,
            dispatcher,
            rate_limiter,
            storage,
            verifier,
        }
    }

    /// Start the expiry sweep, the random drop trigger and rate-limit cleanup
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        info!(
            "Starting background tasks: sweep every {}s, drops every {}s, rate limit cleanup every {}s",
            config.sweep_interval.as_secs(),
            config.drop_interval.as_secs(),
            config.rate_limit_cleanup_interval.as_secs()
        );

        let policy = DropPolicy {
            min_participants: config.drop_min_participants,
            chance: config.drop_chance,
            store_timeout: config.store_timeout,
        };

        vec![
            scheduler::spawn_expiry_sweep(Arc::clone(&self.engine), config.sweep_interval),
            scheduler::spawn_random_drops(
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.storage),
                policy,
                config.drop_interval,
            ),
            scheduler::spawn_rate_limit_cleanup(
                Arc::clone(&self.rate_limiter),
                config.rate_limit_cleanup_interval,
            ),
        ]
    }
}
