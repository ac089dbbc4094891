//! In-memory storage implementation for development and testing
//!
//! Each collection sits behind its own lock. The conditional claim runs under
//! the collectibles write lock, which makes it atomic for every caller in
//! this process; a shared deployment needs a backend with the same
//! guarantee across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::traits::*;
use crate::core::collectible::{ClaimRecord, Collectible};
use crate::core::position::Coordinates;
use crate::error::{PulseError, Result};

pub struct MemoryStorage {
    collectibles: RwLock<HashMap<String, Collectible>>,
    claims: RwLock<Vec<ClaimRecord>>,
    rooms: RwLock<HashMap<String, StoredRoom>>,
    users: RwLock<HashMap<String, UserStats>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            collectibles: RwLock::new(HashMap::new()),
            claims: RwLock::new(Vec::new()),
            rooms: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectibleStorage for MemoryStorage {
    async fn insert_collectible(&self, collectible: Collectible) -> Result<()> {
        let mut collectibles = self.collectibles.write().await;
        if collectibles.contains_key(&collectible.id) {
            return Err(PulseError::StorageError(format!(
                "collectible {} already exists",
                collectible.id
            )));
        }
        collectibles.insert(collectible.id.clone(), collectible);
        Ok(())
    }

    async fn get_collectible(&self, id: &str) -> Result<Option<Collectible>> {
        Ok(self.collectibles.read().await.get(id).cloned())
    }

    async fn increment_claim_attempts(&self, id: &str) -> Result<()> {
        if let Some(collectible) = self.collectibles.write().await.get_mut(id) {
            collectible.metadata.claim_attempts += 1;
        }
        Ok(())
    }

    async fn claim_if_available(
        &self,
        id: &str,
        claimant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Collectible>> {
        let mut collectibles = self.collectibles.write().await;
        match collectibles.get_mut(id) {
            Some(collectible) if collectible.is_claimable(now) => {
                collectible.claimed_by = Some(claimant_id.to_string());
                collectible.claimed_at = Some(now);
                collectible.is_active = false;
                collectible.metadata.successful_claims += 1;
                Ok(Some(collectible.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut collectibles = self.collectibles.write().await;
        let mut count = 0;
        for collectible in collectibles.values_mut() {
            if collectible.is_active && collectible.claimed_by.is_none() && collectible.expires_at <= now {
                collectible.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_collectibles(&self, room_id: &str) -> Result<Vec<Collectible>> {
        let collectibles = self.collectibles.read().await;
        let mut active: Vec<Collectible> = collectibles
            .values()
            .filter(|c| c.room_id == room_id && c.is_active && c.claimed_by.is_none())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.dropped_at.cmp(&b.dropped_at));
        Ok(active)
    }

    async fn insert_claim(&self, claim: ClaimRecord) -> Result<()> {
        self.claims.write().await.push(claim);
        Ok(())
    }

    async fn user_claims(&self, user_id: &str) -> Result<Vec<ClaimRecord>> {
        Ok(self
            .claims
            .read()
            .await
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RoomStorage for MemoryStorage {
    async fn upsert_room(&self, room: StoredRoom) -> Result<()> {
        self.rooms.write().await.insert(room.id.clone(), room);
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<StoredRoom>> {
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| PulseError::RoomNotFound(room_id.to_string()))?;
        if room.participants.iter().any(|p| p == user_id) {
            return Ok(false);
        }
        room.participants.push(user_id.to_string());
        room.current_participants = participant_count(room);
        Ok(true)
    }

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| PulseError::RoomNotFound(room_id.to_string()))?;
        let before = room.participants.len();
        room.participants.retain(|p| p != user_id);
        room.current_participants = participant_count(room);
        Ok(room.participants.len() < before)
    }

    async fn active_rooms(&self) -> Result<Vec<StoredRoom>> {
        let rooms = self.rooms.read().await;
        let mut active: Vec<StoredRoom> = rooms
            .values()
            .filter(|r| r.status == RoomStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

fn participant_count(room: &StoredRoom) -> u32 {
    u32::try_from(room.participants.len()).unwrap_or(u32::MAX)
}

#[async_trait]
impl UserStatsStorage for MemoryStorage {
    async fn increment_stat(&self, user_id: &str, stat: UserStat) -> Result<()> {
        let mut users = self.users.write().await;
        let stats = users.entry(user_id.to_string()).or_default();
        match stat {
            UserStat::CollectiblesCount => stats.collectibles_count += 1,
            UserStat::EventsAttended => stats.events_attended += 1,
        }
        stats.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn get_stats(&self, user_id: &str) -> Result<UserStats> {
        Ok(self
            .users
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_location(&self, user_id: &str, coordinates: Coordinates) -> Result<()> {
        let mut users = self.users.write().await;
        let stats = users.entry(user_id.to_string()).or_default();
        stats.current_location = Some(coordinates);
        stats.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    fn collectibles(&self) -> &dyn CollectibleStorage {
        self
    }

    fn rooms(&self) -> &dyn RoomStorage {
        self
    }

    fn users(&self) -> &dyn UserStatsStorage {
        self
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
