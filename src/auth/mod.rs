//! Identity verification and room authorization

pub mod identity;
pub mod room_access;

// Re-export main components
pub use identity::{IdentityVerifier, StaticIdentityVerifier, VerifiedIdentity};
pub use room_access::{authorize, permissions_of, role_of, AccessDecision, Permission, Role};
