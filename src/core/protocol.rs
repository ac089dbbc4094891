//! Wire messages exchanged with clients
//!
//! Every frame is one JSON object with a `type` discriminator. Inbound
//! frames are decoded into a closed set of [`Command`]s; unknown kinds come
//! back as [`Command::Unrecognized`] instead of an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_CHAT_MESSAGE_LENGTH;
use crate::core::collectible::{ClaimReport, Collectible};
use crate::core::position::{Coordinates, PositionMeta, PositionRecord};
use crate::core::proximity::NearbyEntry;
use crate::error::{PulseError, Result};

/// Client-to-server commands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PositionUpdate {
        coordinates: Coordinates,
        /// Client capture time, when provided
        timestamp: Option<DateTime<Utc>>,
        meta: PositionMeta,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    Chat {
        room_id: String,
        message: String,
    },
    Claim {
        collectible_id: String,
    },
    Unrecognized(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct PositionPayload {
    coordinates: Vec<f64>,
    timestamp: Option<DateTime<Utc>>,
    accuracy: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
}

#[derive(Deserialize)]
struct RoomPayload {
    #[serde(alias = "event_id")]
    room_id: String,
}

#[derive(Deserialize)]
struct ChatPayload {
    #[serde(alias = "event_id")]
    room_id: String,
    message: String,
}

#[derive(Deserialize)]
struct ClaimPayload {
    collectible_id: String,
}

fn non_empty(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(PulseError::ValidationError(format!("{} must not be empty", field)));
    }
    Ok(value)
}

impl Command {
    /// Decode one inbound text frame
    pub fn decode(text: &str) -> Result<Command> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope
            .kind
            .ok_or_else(|| PulseError::ValidationError("missing message type".to_string()))?;

        match kind.as_str() {
            "location_update" => {
                let payload: PositionPayload = serde_json::from_str(text)?;
                let coordinates = match payload.coordinates.as_slice() {
                    [longitude, latitude] => Coordinates::new(*longitude, *latitude)?,
                    _ => {
                        return Err(PulseError::ValidationError(
                            "coordinates must be [longitude, latitude]".to_string(),
                        ))
                    }
                };
                Ok(Command::PositionUpdate {
                    coordinates,
                    timestamp: payload.timestamp,
                    meta: PositionMeta {
                        accuracy: payload.accuracy,
                        speed: payload.speed,
                        heading: payload.heading,
                    },
                })
            }
            "join_event" | "join_room" => {
                let payload: RoomPayload = serde_json::from_str(text)?;
                Ok(Command::JoinRoom {
                    room_id: non_empty("room_id", payload.room_id)?,
                })
            }
            "leave_event" | "leave_room" => {
                let payload: RoomPayload = serde_json::from_str(text)?;
                Ok(Command::LeaveRoom {
                    room_id: non_empty("room_id", payload.room_id)?,
                })
            }
            "chat_message" => {
                let payload: ChatPayload = serde_json::from_str(text)?;
                let message = non_empty("message", payload.message)?;
                if message.chars().count() > MAX_CHAT_MESSAGE_LENGTH {
                    return Err(PulseError::ValidationError(format!(
                        "message longer than {} characters",
                        MAX_CHAT_MESSAGE_LENGTH
                    )));
                }
                Ok(Command::Chat {
                    room_id: non_empty("room_id", payload.room_id)?,
                    message,
                })
            }
            "claim_collectible" => {
                let payload: ClaimPayload = serde_json::from_str(text)?;
                Ok(Command::Claim {
                    collectible_id: non_empty("collectible_id", payload.collectible_id)?,
                })
            }
            _ => Ok(Command::Unrecognized(kind)),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Command::PositionUpdate { .. } => "location_update",
            Command::JoinRoom { .. } => "join_event",
            Command::LeaveRoom { .. } => "leave_event",
            Command::Chat { .. } => "chat_message",
            Command::Claim { .. } => "claim_collectible",
            Command::Unrecognized(kind) => kind,
        }
    }
}

/// Active room near a reported position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyRoom {
    pub id: String,
    pub title: String,
    pub location: Coordinates,
    pub current_participants: u32,
    pub distance_km: f64,
}

/// Server-to-client message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Connected {
        session_key: String,
        connection_id: Uuid,
        authenticated: bool,
        timestamp: DateTime<Utc>,
    },

    LocationUpdate {
        user_id: String,
        coordinates: Coordinates,
        #[serde(skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        timestamp: DateTime<Utc>,
    },

    NearbyUsers {
        users: Vec<NearbyEntry>,
        timestamp: DateTime<Utc>,
    },

    NearbyEvents {
        events: Vec<NearbyRoom>,
        timestamp: DateTime<Utc>,
    },

    UserJoined {
        user_id: String,
        room_id: String,
        timestamp: DateTime<Utc>,
    },

    UserLeft {
        user_id: String,
        room_id: String,
        timestamp: DateTime<Utc>,
    },

    ChatMessage {
        user_id: String,
        room_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Sent to the claimant only
    ClaimResult {
        result: ClaimReport,
        timestamp: DateTime<Utc>,
    },

    /// Sent to everyone after a successful claim
    CollectibleClaimed {
        collectible_id: String,
        winner_id: String,
        timestamp: DateTime<Utc>,
    },

    CollectibleDrop {
        collectible: Collectible,
        expires_in: u64,
        timestamp: DateTime<Utc>,
    },

    /// Presence notice sent to all connections when a session ends
    UserDisconnected {
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    Error {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn location_update(user_id: &str, record: &PositionRecord) -> Self {
        ServerMessage::LocationUpdate {
            user_id: user_id.to_string(),
            coordinates: record.coordinates,
            accuracy: record.meta.accuracy,
            speed: record.meta.speed,
            heading: record.meta.heading,
            timestamp: record.timestamp,
        }
    }

    pub fn error(err: &PulseError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
