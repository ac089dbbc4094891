//! Room roles and permissions
//!
//! `role_of` resolves a user against a stored room (creator, then banned,
//! then moderator, then the private-room invite check); `authorize` combines
//! it with the static permission table.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::storage::StoredRoom;

/// User roles within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Moderator,
    Participant,
    Viewer,
    Banned,
    /// Private room without an invitation
    #[serde(rename = "none")]
    NoAccess,
}

impl Role {
    /// Returns the permissions associated with this role
    pub fn permissions(&self) -> &'static [Permission] {
        permissions_of(*self)
    }

    /// Check if this role has a specific permission
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Actions that can be performed inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Join,
    Speak,
    ShareScreen,
    Moderate,
    EndEvent,
    DropCollectibles,
}

const CREATOR_PERMISSIONS: &[Permission] = &[
    Permission::Join,
    Permission::Speak,
    Permission::ShareScreen,
    Permission::Moderate,
    Permission::EndEvent,
    Permission::DropCollectibles,
];

const MODERATOR_PERMISSIONS: &[Permission] = &[
    Permission::Join,
    Permission::Speak,
    Permission::ShareScreen,
    Permission::Moderate,
];

const PARTICIPANT_PERMISSIONS: &[Permission] =
    &[Permission::Join, Permission::Speak, Permission::ShareScreen];

const VIEWER_PERMISSIONS: &[Permission] = &[Permission::Join];

pub fn permissions_of(role: Role) -> &'static [Permission] {
    match role {
        Role::Creator => CREATOR_PERMISSIONS,
        Role::Moderator => MODERATOR_PERMISSIONS,
        Role::Participant => PARTICIPANT_PERMISSIONS,
        Role::Viewer => VIEWER_PERMISSIONS,
        Role::Banned | Role::NoAccess => &[],
    }
}

/// Resolve a user's role in a room.
///
/// Precedence: creator, banned, moderator, private-room invitation, then
/// participant for public rooms. A creator who also appears on the ban list
/// is still the creator.
pub fn role_of(user_id: &str, room: &StoredRoom) -> Role {
    let listed = |list: &[String]| list.iter().any(|id| id == user_id);

    if room.creator_id == user_id {
        return Role::Creator;
    }
    if listed(&room.banned_users) {
        return Role::Banned;
    }
    if listed(&room.moderators) {
        return Role::Moderator;
    }
    if room.is_private && !listed(&room.invited_users) {
        return Role::NoAccess;
    }
    Role::Participant
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted(Role),
    Denied { role: Role, reason: String },
    RoomNotFound,
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted(_))
    }
}

/// `role_of` followed by a permission test. A missing room is reported
/// separately from a denial.
pub fn authorize(user_id: &str, room: Option<&StoredRoom>, permission: Permission) -> AccessDecision {
    let Some(room) = room else {
        return AccessDecision::RoomNotFound;
    };

    let role = role_of(user_id, room);
    if role.has_permission(permission) {
        debug!("Room auth for {} on {}: {:?} granted {:?}", user_id, room.id, role, permission);
        return AccessDecision::Granted(role);
    }

    let reason = match role {
        Role::Banned => {
            warn!("Banned user {} attempted {:?} in room {}", user_id, permission, room.id);
            "You are banned from this event".to_string()
        }
        Role::NoAccess => "This is a private event and you are not invited".to_string(),
        _ => format!("Role {:?} lacks permission {:?}", role, permission),
    };
    AccessDecision::Denied { role, reason }
}
