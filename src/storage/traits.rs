//! Abstract storage interfaces for pluggable backends
//!
//! The core only needs a document store with an atomic single-document
//! conditional update. Everything else here is plain reads, writes and
//! counter increments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::collectible::{ClaimRecord, Collectible};
use crate::core::position::Coordinates;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Ended,
    Cancelled,
}

/// Room (event) data as persisted; also the input to access evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRoom {
    pub id: String,
    pub title: String,
    pub creator_id: String,
    pub location: Coordinates,
    pub status: RoomStatus,
    pub is_private: bool,
    pub moderators: Vec<String>,
    pub banned_users: Vec<String>,
    pub invited_users: Vec<String>,
    /// Users counted into the room, live or not
    #[serde(default)]
    pub participants: Vec<String>,
    /// Size of `participants` as of the last join or leave
    pub current_participants: u32,
    pub created_at: DateTime<Utc>,
}

impl StoredRoom {
    /// A public, active room with no moderators or bans
    pub fn public(
        id: impl Into<String>,
        title: impl Into<String>,
        creator_id: impl Into<String>,
        location: Coordinates,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            creator_id: creator_id.into(),
            location,
            status: RoomStatus::Active,
            is_private: false,
            moderators: Vec::new(),
            banned_users: Vec::new(),
            invited_users: Vec::new(),
            participants: Vec::new(),
            current_participants: 0,
            created_at: Utc::now(),
        }
    }
}

/// Per-user counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserStat {
    CollectiblesCount,
    EventsAttended,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub collectibles_count: u64,
    pub events_attended: u64,
    pub current_location: Option<Coordinates>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Collectible documents and the claim inventory
#[async_trait]
pub trait CollectibleStorage: Send + Sync {
    async fn insert_collectible(&self, collectible: Collectible) -> Result<()>;

    async fn get_collectible(&self, id: &str) -> Result<Option<Collectible>>;

    /// Increment the attempt counter; a missing document is not an error
    async fn increment_claim_attempts(&self, id: &str) -> Result<()>;

    /// Atomically: if the collectible is active, unclaimed and `now < expires_at`,
    /// set the winner, stamp the claim time, deactivate it and increment the
    /// successful-claim counter, returning the updated document. Otherwise
    /// change nothing and return `None`.
    ///
    /// Implementations must make the check and the write one indivisible step
    /// for every caller sharing the store, including other processes.
    async fn claim_if_available(
        &self,
        id: &str,
        claimant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Collectible>>;

    /// Deactivate all active, unclaimed collectibles with `expires_at <= now`
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Active, unclaimed collectibles of a room
    async fn active_collectibles(&self, room_id: &str) -> Result<Vec<Collectible>>;

    async fn insert_claim(&self, claim: ClaimRecord) -> Result<()>;

    async fn user_claims(&self, user_id: &str) -> Result<Vec<ClaimRecord>>;
}

/// Room data storage interface
#[async_trait]
pub trait RoomStorage: Send + Sync {
    /// Create or overwrite a room
    async fn upsert_room(&self, room: StoredRoom) -> Result<()>;

    async fn get_room(&self, room_id: &str) -> Result<Option<StoredRoom>>;

    /// Count a user into the room; false if already counted
    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<bool>;

    /// Count a user out of the room; false if they were not counted
    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<bool>;

    async fn active_rooms(&self) -> Result<Vec<StoredRoom>>;
}

/// User counters and last persisted location
#[async_trait]
pub trait UserStatsStorage: Send + Sync {
    async fn increment_stat(&self, user_id: &str, stat: UserStat) -> Result<()>;

    async fn get_stats(&self, user_id: &str) -> Result<UserStats>;

    async fn update_location(&self, user_id: &str, coordinates: Coordinates) -> Result<()>;
}

/// Combined storage provider interface
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn collectibles(&self) -> &dyn CollectibleStorage;

    fn rooms(&self) -> &dyn RoomStorage;

    fn users(&self) -> &dyn UserStatsStorage;

    /// Health check for the storage backend
    async fn health_check(&self) -> Result<bool>;
}
