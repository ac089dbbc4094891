use std::error::Error;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PulseError {
    // Session errors
    SessionNotFound(String),
    DuplicateSession(String),

    // Transport errors
    TransportError(String),
    Timeout(String),

    // Storage errors
    StorageError(String),
    NotFound(String),

    // Message errors
    MessageParseError(String),
    MessageTooLarge(usize),
    ValidationError(String),

    // Room and access errors
    RoomNotFound(String),
    Forbidden(String),
    Conflict { reason: String, owner: Option<String> },

    // Auth errors
    AuthError(String),
    RateLimitExceeded { retry_after: Duration },

    // Configuration errors
    ConfigError(String),
}

impl PulseError {
    /// Stable machine-readable code carried in outbound `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "not_connected",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::TransportError(_) => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::StorageError(_) => "storage_error",
            Self::NotFound(_) => "not_found",
            Self::MessageParseError(_) => "invalid_message",
            Self::MessageTooLarge(_) => "message_too_large",
            Self::ValidationError(_) => "validation_error",
            Self::RoomNotFound(_) => "room_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict { .. } => "conflict",
            Self::AuthError(_) => "unauthorized",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// Errors that only affect the message being processed
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::MessageParseError(_)
                | Self::MessageTooLarge(_)
                | Self::ValidationError(_)
                | Self::RoomNotFound(_)
                | Self::Forbidden(_)
                | Self::NotFound(_)
        )
    }
}

impl fmt::Display for PulseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(key) => write!(f, "Session not connected: {}", key),
            Self::DuplicateSession(key) => write!(f, "Session already active: {}", key),
            Self::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Self::Timeout(what) => write!(f, "Deadline exceeded: {}", what),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Self::RoomNotFound(id) => write!(f, "Room not found: {}", id),
            Self::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Self::Conflict { reason, owner } => match owner {
                Some(owner) => write!(f, "Conflict: {} (held by {})", reason, owner),
                None => write!(f, "Conflict: {}", reason),
            },
            Self::AuthError(msg) => write!(f, "Authentication error: {}", msg),
            Self::RateLimitExceeded { retry_after } => write!(
                f,
                "Too many failed attempts, blocked for {} more seconds",
                retry_after.as_secs()
            ),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for PulseError {}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::MessageParseError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PulseError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PulseError::Timeout("operation did not complete in time".to_string())
    }
}

// Generic result type for the crate
pub type Result<T> = std::result::Result<T, PulseError>;
