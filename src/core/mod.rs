//! Core functionality for the coordination server

pub mod collectible;
pub mod connection;
pub mod dispatcher;
pub mod ip_extractor;
pub mod position;
pub mod protocol;
pub mod proximity;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

// Re-export main components for convenience
pub use collectible::{ClaimOutcome, Collectible, CollectibleEngine, Tier};
pub use connection::{ChannelInbound, ChannelTransport, Frame, InboundFrames, Transport};
pub use dispatcher::{SessionDispatcher, SessionState};
pub use position::{Coordinates, PositionMeta, PositionRecord};
pub use rate_limiter::FailureRateLimiter;
pub use registry::{ConnectionRegistry, DisconnectReport, RegistryStats};
pub use server::ServerState;
pub use session::{SessionIdentity, SessionInfo};
