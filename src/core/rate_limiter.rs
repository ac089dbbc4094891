//! Failure-based rate limiting to slow down credential guessing
//!
//! Failed attempts are counted per key (usually the client address) inside a
//! rolling window. Reaching the limit blocks the key for a fixed duration.
//! A successful attempt clears the counter but never lifts an active block.

use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{PulseError, Result};

#[derive(Debug, Clone, Default)]
struct RateLimitRecord {
    failed_attempts: u32,
    window_start: Option<Instant>,
    blocked_until: Option<Instant>,
    total_blocks: u32,
}

impl RateLimitRecord {
    fn block_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Forget the counter once the window it belongs to has passed
    fn roll_window(&mut self, now: Instant, window: Duration) {
        if let Some(start) = self.window_start {
            if now.duration_since(start) > window {
                self.failed_attempts = 0;
                self.window_start = None;
            }
        }
    }
}

/// Result of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureVerdict {
    pub attempts: u32,
    pub blocked: bool,
    /// Set when this failure triggered a block
    pub block_duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Clean,
    Monitored,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub status: KeyStatus,
    pub failed_attempts: u32,
    pub remaining_seconds: u64,
    pub total_blocks: u32,
}

pub struct FailureRateLimiter {
    records: RwLock<HashMap<String, RateLimitRecord>>,
    max_attempts: u32,
    window: Duration,
    block_duration: Duration,
}

impl FailureRateLimiter {
    pub fn new(max_attempts: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            window,
            block_duration,
        }
    }

    /// `RateLimitExceeded` with the remaining block time if the key is blocked
    pub async fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(());
        };
        if let Some(remaining) = record.block_remaining(now) {
            return Err(PulseError::RateLimitExceeded {
                retry_after: remaining,
            });
        }
        record.roll_window(now, self.window);
        Ok(())
    }

    pub async fn record_failure(&self, key: &str) -> FailureVerdict {
        self.record_failure_at(key, Instant::now()).await
    }

    async fn record_failure_at(&self, key: &str, now: Instant) -> FailureVerdict {
        let mut records = self.records.write().await;
        let record = records.entry(key.to_string()).or_default();

        record.roll_window(now, self.window);
        if record.window_start.is_none() {
            record.window_start = Some(now);
        }
        record.failed_attempts += 1;

        info!(
            "Failed attempt {}/{} from {}",
            record.failed_attempts, self.max_attempts, key
        );

        if record.failed_attempts >= self.max_attempts {
            record.blocked_until = Some(now + self.block_duration);
            record.total_blocks += 1;
            warn!(
                "SECURITY INCIDENT: {} blocked after {} failed attempts for {}s (total blocks: {})",
                key,
                record.failed_attempts,
                self.block_duration.as_secs(),
                record.total_blocks
            );
            return FailureVerdict {
                attempts: record.failed_attempts,
                blocked: true,
                block_duration: Some(self.block_duration),
            };
        }

        FailureVerdict {
            attempts: record.failed_attempts,
            blocked: record.block_remaining(now).is_some(),
            block_duration: None,
        }
    }

    /// Clear the failure counter; an active block stays in place
    pub async fn record_success(&self, key: &str) {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.failed_attempts = 0;
            record.window_start = None;
        }
    }

    /// Lift a block manually
    pub async fn unblock(&self, key: &str) {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.blocked_until = None;
            record.failed_attempts = 0;
            record.window_start = None;
            info!("{} manually unblocked", key);
        }
    }

    pub async fn status(&self, key: &str) -> RateLimitStatus {
        self.status_at(key, Instant::now()).await
    }

    async fn status_at(&self, key: &str, now: Instant) -> RateLimitStatus {
        let records = self.records.read().await;
        match records.get(key) {
            None => RateLimitStatus {
                key: key.to_string(),
                status: KeyStatus::Clean,
                failed_attempts: 0,
                remaining_seconds: 0,
                total_blocks: 0,
            },
            Some(record) => {
                let remaining = record.block_remaining(now);
                RateLimitStatus {
                    key: key.to_string(),
                    status: if remaining.is_some() {
                        KeyStatus::Blocked
                    } else {
                        KeyStatus::Monitored
                    },
                    failed_attempts: record.failed_attempts,
                    remaining_seconds: remaining.map_or(0, |d| d.as_secs()),
                    total_blocks: record.total_blocks,
                }
            }
        }
    }

    /// Drop records that are unblocked and idle for two block durations
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    async fn cleanup_at(&self, now: Instant) -> usize {
        let idle_limit = self.block_duration * 2;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            let blocked = record.block_remaining(now).is_some();
            let recently_active = record
                .window_start
                .map_or(false, |start| now.duration_since(start) < idle_limit);
            blocked || recently_active
        });
        let removed = before - records.len();
        if removed > 0 {
            info!("Cleaned up {} old rate limit records", removed);
        }
        removed
    }

    pub async fn tracked_keys(&self) -> usize {
        self.records.read().await.len()
    }
}
