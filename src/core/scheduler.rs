//! Background periodic tasks
//!
//! Each task talks to the core only through its public operations. A failed
//! tick is logged and the next tick runs as scheduled.

use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::core::collectible::CollectibleEngine;
use crate::core::dispatcher::SessionDispatcher;
use crate::core::rate_limiter::FailureRateLimiter;
use crate::error::Result;
use crate::storage::{self, StorageProvider};

/// Settings for the random drop trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropPolicy {
    pub min_participants: u32,
    /// Probability of a drop per eligible room per tick
    pub chance: f64,
    pub store_timeout: Duration,
}

/// Deactivate expired collectibles every `period`
pub fn spawn_expiry_sweep(engine: Arc<CollectibleEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match engine.sweep_expired().await {
                Ok(0) => debug!("Expiry sweep: nothing to deactivate"),
                Ok(count) => info!("Expiry sweep deactivated {} collectibles", count),
                Err(e) => error!("Expiry sweep failed: {}", e),
            }
        }
    })
}

/// Drop random collectibles into busy rooms every `period`
pub fn spawn_random_drops(
    dispatcher: Arc<SessionDispatcher>,
    storage: Arc<dyn StorageProvider>,
    policy: DropPolicy,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match run_drop_tick(&dispatcher, storage.as_ref(), &policy, &mut rng).await {
                Ok(0) => debug!("Drop tick: no collectibles dropped"),
                Ok(count) => info!("Drop tick dropped {} collectibles", count),
                Err(e) => error!("Drop tick failed: {}", e),
            }
        }
    })
}

/// One pass of the drop trigger: every active room with enough participants
/// gets a collectible with probability `policy.chance`. Returns the number dropped.
pub async fn run_drop_tick<R>(
    dispatcher: &SessionDispatcher,
    storage: &dyn StorageProvider,
    policy: &DropPolicy,
    rng: &mut R,
) -> Result<usize>
where
    R: Rng + Send,
{
    let rooms = storage::with_deadline(policy.store_timeout, storage.rooms().active_rooms()).await?;

    let mut dropped = 0;
    for room in rooms {
        if room.current_participants < policy.min_participants {
            continue;
        }
        if !rng.gen_bool(policy.chance) {
            continue;
        }
        match dispatcher.drop_collectible(&room).await {
            Ok(_) => dropped += 1,
            Err(e) => error!("Failed to drop a collectible in room {}: {}", room.id, e),
        }
    }
    Ok(dropped)
}

/// Forget idle rate-limit records every `period`
pub fn spawn_rate_limit_cleanup(limiter: Arc<FailureRateLimiter>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let removed = limiter.cleanup().await;
            debug!("Rate limit cleanup removed {} records", removed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::core::position::Coordinates;
    use crate::core::registry::ConnectionRegistry;
    use crate::storage::{CollectibleStorage, MemoryStorage, RoomStorage, StoredRoom};

    fn setup() -> (Arc<SessionDispatcher>, Arc<MemoryStorage>) {
        let config = ServerConfig::for_testing();
        let store = Arc::new(MemoryStorage::new());
        let storage: Arc<dyn StorageProvider> = store.clone();
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
        let engine = Arc::new(CollectibleEngine::new(
            Arc::clone(&storage),
            config.claim_window,
            config.store_timeout,
        ));
        let dispatcher = Arc::new(SessionDispatcher::new(registry, engine, storage, &config));
        (dispatcher, store)
    }

    fn policy(chance: f64) -> DropPolicy {
        DropPolicy {
            min_participants: 3,
            chance,
            store_timeout: Duration::from_millis(500),
        }
    }

    async fn add_room(store: &MemoryStorage, id: &str, participants: u32) {
        let mut room = StoredRoom::public(id, id, "host", Coordinates::new(-74.08, 4.6).unwrap());
        room.current_participants = participants;
        store.upsert_room(room).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_tick_respects_participant_floor() {
        let (dispatcher, store) = setup();
        add_room(&store, "busy", 3).await;
        add_room(&store, "quiet", 2).await;

        let mut rng = StdRng::seed_from_u64(7);
        let dropped = run_drop_tick(&dispatcher, store.as_ref(), &policy(1.0), &mut rng)
            .await
            .unwrap();

        assert_eq!(dropped, 1);
        assert_eq!(store.active_collectibles("busy").await.unwrap().len(), 1);
        assert!(store.active_collectibles("quiet").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_tick_with_zero_chance_drops_nothing() {
        let (dispatcher, store) = setup();
        add_room(&store, "busy", 10).await;

        let mut rng = StdRng::seed_from_u64(7);
        let dropped = run_drop_tick(&dispatcher, store.as_ref(), &policy(0.0), &mut rng)
            .await
            .unwrap();
        assert_eq!(dropped, 0);
    }
}
