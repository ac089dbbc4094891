use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::connection::Transport;

/// Resolved identity of whoever opened a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_key: String,
    pub authenticated: bool,
}

impl SessionIdentity {
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            session_key: user_id.into(),
            authenticated: true,
        }
    }

    pub fn anonymous(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            authenticated: false,
        }
    }
}

/// One live connection as held by the registry
#[derive(Clone)]
pub struct Session {
    pub key: String,
    /// Distinguishes successive connections that reuse the same key
    pub connection_id: Uuid,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl Session {
    pub fn new(identity: SessionIdentity, transport: Arc<dyn Transport>) -> Self {
        Self {
            key: identity.session_key,
            connection_id: Uuid::new_v4(),
            authenticated: identity.authenticated,
            created_at: Utc::now(),
            transport,
        }
    }

    /// Copy of the session without its transport handle
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            connection_id: self.connection_id,
            authenticated: self.authenticated,
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("authenticated", &self.authenticated)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Transport-free view of a session handed out to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub connection_id: Uuid,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
}
