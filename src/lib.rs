//! PulseLive - real-time coordination core
//!
//! Keeps connected clients informed of each other's positions and room
//! memberships, and awards time-limited collectibles to exactly one
//! claimant no matter how many claim at once.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod storage;

// Re-export main components
pub use config::ServerConfig;
pub use error::{PulseError, Result};
