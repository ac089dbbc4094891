//! Scarce-resource claim engine
//!
//! A collectible is dropped into a room, stays claimable for a fixed window
//! and can be won by exactly one claimant. The single correctness property:
//! across all concurrent claim attempts, from any number of processes
//! sharing the store, at most one attempt observes `Success`. It rests
//! entirely on the store's atomic conditional update
//! ([`CollectibleStorage::claim_if_available`]); nothing here reads and then
//! writes.
//!
//! [`CollectibleStorage::claim_if_available`]: crate::storage::traits::CollectibleStorage::claim_if_available

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::position::Coordinates;
use crate::error::{PulseError, Result};
use crate::storage::{self, StorageProvider, UserStat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Common,
    Rare,
    Epic,
    Legendary,
}

impl Tier {
    pub fn score(&self) -> u32 {
        match self {
            Tier::Common => 10,
            Tier::Rare => 30,
            Tier::Epic => 60,
            Tier::Legendary => 100,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Common => "Bogotá Citizen",
            Tier::Rare => "City Explorer",
            Tier::Epic => "Urban Legend",
            Tier::Legendary => "CityPulse Icon",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Common => "common",
            Tier::Rare => "rare",
            Tier::Epic => "epic",
            Tier::Legendary => "legendary",
        }
    }

    /// Map a uniform roll in `[0, 1)` onto common 50%, rare 30%, epic 15%, legendary 5%
    pub fn from_roll(roll: f64) -> Tier {
        if roll < 0.5 {
            Tier::Common
        } else if roll < 0.8 {
            Tier::Rare
        } else if roll < 0.95 {
            Tier::Epic
        } else {
            Tier::Legendary
        }
    }
}

/// Analytics counters kept on the collectible document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimCounters {
    pub total_available: u32,
    /// Best-effort; incremented outside the atomic claim
    pub claim_attempts: u64,
    pub successful_claims: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collectible {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tier: Tier,
    pub rarity_score: u32,
    pub image_url: String,
    pub description: String,
    pub room_id: String,
    pub drop_location: Coordinates,
    pub dropped_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub metadata: ClaimCounters,
}

/// Where a collectible is in its lifecycle at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectibleState {
    Claimable,
    Claimed,
    /// Past expiry, never won; may or may not have been swept yet
    ExpiredUnclaimed,
    Inactive,
}

impl Collectible {
    pub fn new(
        room_id: impl Into<String>,
        tier: Tier,
        drop_location: Coordinates,
        dropped_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: tier.display_name().to_string(),
            tier,
            rarity_score: tier.score(),
            image_url: format!("/collectibles/{}.png", tier.as_str()),
            description: format!("Limited edition {} collectible", tier.as_str()),
            room_id: room_id.into(),
            drop_location,
            dropped_at,
            expires_at,
            claimed_by: None,
            claimed_at: None,
            is_active: true,
            metadata: ClaimCounters {
                total_available: 1,
                ..ClaimCounters::default()
            },
        }
    }

    /// The exact predicate the store's conditional update must check
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.claimed_by.is_none() && now < self.expires_at
    }

    pub fn state(&self, now: DateTime<Utc>) -> CollectibleState {
        if self.claimed_by.is_some() {
            CollectibleState::Claimed
        } else if now >= self.expires_at {
            CollectibleState::ExpiredUnclaimed
        } else if self.is_active {
            CollectibleState::Claimable
        } else {
            CollectibleState::Inactive
        }
    }
}

/// Inventory entry written for the winner of a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub user_id: String,
    pub collectible_id: String,
    pub room_id: String,
    pub claimed_at: DateTime<Utc>,
    pub claim_order: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Success {
        collectible: Collectible,
        claim_order: u64,
    },
    AlreadyClaimed {
        winner_id: String,
    },
    Expired,
    /// Inactive for another reason (swept, or no such collectible)
    Unavailable,
}

impl ClaimOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClaimOutcome::Success { .. })
    }
}

/// Wire form of a claim outcome, sent back to the claimant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collectible: Option<Collectible>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_order: Option<u64>,
}

impl From<&ClaimOutcome> for ClaimReport {
    fn from(outcome: &ClaimOutcome) -> Self {
        let mut report = ClaimReport {
            success: false,
            message: String::new(),
            claimed_by: None,
            collectible: None,
            claim_order: None,
        };
        match outcome {
            ClaimOutcome::Success {
                collectible,
                claim_order,
            } => {
                report.success = true;
                report.message = "Collectible claimed successfully!".to_string();
                report.collectible = Some(collectible.clone());
                report.claim_order = Some(*claim_order);
            }
            ClaimOutcome::AlreadyClaimed { winner_id } => {
                report.message = "Someone else claimed it first!".to_string();
                report.claimed_by = Some(winner_id.clone());
            }
            ClaimOutcome::Expired => report.message = "Collectible expired".to_string(),
            ClaimOutcome::Unavailable => report.message = "Collectible not available".to_string(),
        }
        report
    }
}

/// A winner's claim joined with the collectible it refers to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryItem {
    pub claim: ClaimRecord,
    pub collectible: Collectible,
}

pub struct CollectibleEngine {
    storage: Arc<dyn StorageProvider>,
    claim_window: Duration,
    store_timeout: Duration,
}

impl CollectibleEngine {
    pub fn new(storage: Arc<dyn StorageProvider>, claim_window: Duration, store_timeout: Duration) -> Self {
        Self {
            storage,
            claim_window,
            store_timeout,
        }
    }

    pub fn claim_window(&self) -> Duration {
        self.claim_window
    }

    async fn with_deadline<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        storage::with_deadline(self.store_timeout, operation).await
    }

    /// Allocate a new active collectible that expires one claim window from now
    pub async fn create(&self, room_id: &str, tier: Tier, drop_point: Coordinates) -> Result<Collectible> {
        let window = chrono::Duration::from_std(self.claim_window)
            .map_err(|_| PulseError::ValidationError("claim window out of range".to_string()))?;
        let now = Utc::now();
        let collectible = Collectible::new(room_id, tier, drop_point, now, now + window);

        self.with_deadline(self.storage.collectibles().insert_collectible(collectible.clone()))
            .await?;
        debug!(
            "Created {} collectible {} in room {}",
            tier.as_str(),
            collectible.id,
            room_id
        );
        Ok(collectible)
    }

    /// Pick a tier from the fixed distribution and create the collectible
    pub async fn drop_random(&self, room_id: &str, drop_point: Coordinates) -> Result<Collectible> {
        let tier = Tier::from_roll(rand::random::<f64>());
        self.create(room_id, tier, drop_point).await
    }

    /// Attempt to win a collectible
    pub async fn claim(&self, collectible_id: &str, claimant_id: &str) -> Result<ClaimOutcome> {
        let collectibles = self.storage.collectibles();

        // Analytics only; not part of the atomic claim
        if let Err(e) = self
            .with_deadline(collectibles.increment_claim_attempts(collectible_id))
            .await
        {
            debug!("Could not count claim attempt on {}: {}", collectible_id, e);
        }

        let now = Utc::now();
        let won = self
            .with_deadline(collectibles.claim_if_available(collectible_id, claimant_id, now))
            .await?;

        let collectible = match won {
            Some(collectible) => collectible,
            None => {
                let current = self
                    .with_deadline(collectibles.get_collectible(collectible_id))
                    .await?;
                let outcome = classify_failed_claim(current.as_ref(), now);
                debug!(
                    "Claim on {} by {} rejected: {:?}",
                    collectible_id, claimant_id, outcome
                );
                return Ok(outcome);
            }
        };

        let claim_order = collectible.metadata.successful_claims;
        info!(
            "Claim won: {} got {} ({}) in room {}",
            claimant_id,
            collectible.name,
            collectible.tier.as_str(),
            collectible.room_id
        );

        let record = ClaimRecord {
            user_id: claimant_id.to_string(),
            collectible_id: collectible.id.clone(),
            room_id: collectible.room_id.clone(),
            claimed_at: collectible.claimed_at.unwrap_or(now),
            claim_order,
        };
        if let Err(e) = self.with_deadline(collectibles.insert_claim(record)).await {
            warn!("Failed to record inventory for {}: {}", claimant_id, e);
        }
        if let Err(e) = self
            .with_deadline(
                self.storage
                    .users()
                    .increment_stat(claimant_id, UserStat::CollectiblesCount),
            )
            .await
        {
            warn!("Failed to update stats for {}: {}", claimant_id, e);
        }

        Ok(ClaimOutcome::Success {
            collectible,
            claim_order,
        })
    }

    /// Deactivate every active, unclaimed collectible past its expiry
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.with_deadline(self.storage.collectibles().deactivate_expired(Utc::now()))
            .await
    }

    /// Active, unclaimed collectibles of a room
    pub async fn active_for_room(&self, room_id: &str) -> Result<Vec<Collectible>> {
        self.with_deadline(self.storage.collectibles().active_collectibles(room_id))
            .await
    }

    /// A user's wins, most recent first
    pub async fn user_inventory(&self, user_id: &str) -> Result<Vec<InventoryItem>> {
        let collectibles = self.storage.collectibles();
        let mut claims = self.with_deadline(collectibles.user_claims(user_id)).await?;
        claims.sort_by(|a, b| b.claimed_at.cmp(&a.claimed_at));

        let mut items = Vec::with_capacity(claims.len());
        for claim in claims {
            match self
                .with_deadline(collectibles.get_collectible(&claim.collectible_id))
                .await?
            {
                Some(collectible) => items.push(InventoryItem { claim, collectible }),
                None => debug!(
                    "Inventory of {} references missing collectible {}",
                    user_id, claim.collectible_id
                ),
            }
        }
        Ok(items)
    }
}

/// Explain why the conditional update matched nothing
fn classify_failed_claim(current: Option<&Collectible>, now: DateTime<Utc>) -> ClaimOutcome {
    match current {
        Some(c) => match &c.claimed_by {
            Some(winner) => ClaimOutcome::AlreadyClaimed {
                winner_id: winner.clone(),
            },
            None if c.is_active && now >= c.expires_at => ClaimOutcome::Expired,
            None => ClaimOutcome::Unavailable,
        },
        None => ClaimOutcome::Unavailable,
    }
}
