//! Persistence seam: store interfaces and the in-process reference store

pub mod memory;
pub mod traits;

// Re-export the main storage types
pub use memory::MemoryStorage;
pub use traits::{
    CollectibleStorage, RoomStatus, RoomStorage, StorageProvider, StoredRoom, UserStat, UserStats,
    UserStatsStorage,
};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Bound a store call so one slow backend cannot stall a sweep or a session
pub async fn with_deadline<T>(deadline: Duration, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(deadline, operation).await?
}
