//! Live connection registry
//!
//! Single source of truth for who is connected, which rooms they joined and
//! where they were last seen. Each logical map has its own guard so a slow
//! delivery never stalls membership or position updates. Operations that
//! span maps take their guards in one global order:
//! `connections -> memberships -> positions`.
//! No transport I/O happens while a guard is held; recipients are copied
//! out first.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::constants::{CLOSE_NORMAL, CLOSE_REPLACED, CLOSE_SEND_FAILED};
use crate::core::connection::Transport;
use crate::core::position::{Coordinates, PositionMeta, PositionRecord};
use crate::core::session::{Session, SessionIdentity, SessionInfo};
use crate::error::{PulseError, Result};

/// What a teardown removed
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReport {
    pub session: SessionInfo,
    /// Rooms the session was a member of, sorted
    pub rooms: Vec<String>,
    pub had_position: bool,
}

/// Monitoring counters; each map is read separately so figures may drift
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub active_rooms: usize,
    pub total_memberships: usize,
    pub positioned_users: usize,
}

type Recipient = (String, Uuid, Arc<dyn Transport>);

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Session>>,
    memberships: RwLock<HashMap<String, HashSet<String>>>,
    positions: RwLock<HashMap<String, PositionRecord>>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Register a new live session; fails if the key is already active
    pub async fn connect(
        &self,
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
    ) -> Result<SessionInfo> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&identity.session_key) {
            return Err(PulseError::DuplicateSession(identity.session_key));
        }

        let session = Session::new(identity, transport);
        let info = session.info();
        connections.insert(session.key.clone(), session);
        info!(
            "Session connected: {} (connections: {})",
            info.key,
            connections.len()
        );
        Ok(info)
    }

    /// Register a session, replacing and closing any prior one with the same key.
    /// The prior session's derived state is purged along with it. An anonymous
    /// identity never displaces an authenticated session.
    pub async fn replace(
        &self,
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
    ) -> Result<(SessionInfo, Option<DisconnectReport>)> {
        let (info, previous) = {
            let mut connections = self.connections.write().await;
            if let Some(current) = connections.get(&identity.session_key) {
                if current.authenticated && !identity.authenticated {
                    warn!(
                        "Anonymous connection refused for {}: an authenticated session holds the key",
                        identity.session_key
                    );
                    return Err(PulseError::DuplicateSession(identity.session_key));
                }
            }

            let mut memberships = self.memberships.write().await;
            let mut positions = self.positions.write().await;

            let session = Session::new(identity, transport);
            let info = session.info();
            let previous = connections.remove(&session.key).map(|old| {
                let rooms = purge_memberships(&mut memberships, &old.key);
                let had_position = positions.remove(&old.key).is_some();
                (old, rooms, had_position)
            });
            connections.insert(session.key.clone(), session);
            (info, previous)
        };

        let report = match previous {
            Some((old, rooms, had_position)) => {
                info!("Session {} replaced by a newer connection", old.key);
                old.transport
                    .close(CLOSE_REPLACED, "replaced by a newer connection")
                    .await;
                Some(DisconnectReport {
                    session: old.info(),
                    rooms,
                    had_position,
                })
            }
            None => None,
        };

        Ok((info, report))
    }

    /// Remove a session and all derived state. Idempotent.
    pub async fn disconnect(&self, session_key: &str) -> Option<DisconnectReport> {
        self.remove_session(session_key, None, CLOSE_NORMAL, "session closed")
            .await
    }

    /// Remove a session only if it is still the given connection.
    /// Used by teardown paths so a stale connection cannot evict its replacement.
    pub async fn disconnect_connection(
        &self,
        session_key: &str,
        connection_id: Uuid,
    ) -> Option<DisconnectReport> {
        self.remove_session(session_key, Some(connection_id), CLOSE_NORMAL, "session closed")
            .await
    }

    /// Drop a connection whose transport failed
    async fn evict(&self, session_key: &str, connection_id: Uuid) -> Option<DisconnectReport> {
        self.remove_session(session_key, Some(connection_id), CLOSE_SEND_FAILED, "delivery failed")
            .await
    }

    async fn remove_session(
        &self,
        session_key: &str,
        expected: Option<Uuid>,
        close_code: u16,
        close_reason: &str,
    ) -> Option<DisconnectReport> {
        let (session, rooms, had_position, remaining) = {
            let mut connections = self.connections.write().await;
            match connections.get(session_key) {
                Some(current) if expected.map_or(true, |id| id == current.connection_id) => {}
                _ => return None,
            }
            let session = connections.remove(session_key)?;

            let mut memberships = self.memberships.write().await;
            let rooms = purge_memberships(&mut memberships, session_key);

            let mut positions = self.positions.write().await;
            let had_position = positions.remove(session_key).is_some();

            (session, rooms, had_position, connections.len())
        };

        info!(
            "Session disconnected: {} (connections: {})",
            session_key, remaining
        );
        session.transport.close(close_code, close_reason).await;

        Some(DisconnectReport {
            session: session.info(),
            rooms,
            had_position,
        })
    }

    /// Deliver to one session. `SessionNotFound` when it is not connected;
    /// a failed send removes the session and reports `TransportError`.
    pub async fn send_to(&self, session_key: &str, message: &str) -> Result<()> {
        let (connection_id, transport) = {
            let connections = self.connections.read().await;
            match connections.get(session_key) {
                Some(session) => (session.connection_id, Arc::clone(&session.transport)),
                None => return Err(PulseError::SessionNotFound(session_key.to_string())),
            }
        };

        match self.send_with_deadline(&transport, message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Failed to send to {}: {}, removing session", session_key, e);
                self.evict(session_key, connection_id).await;
                Err(e)
            }
        }
    }

    /// Deliver to every connected session not in `exclude`; returns delivered count
    pub async fn broadcast_all(&self, message: &str, exclude: &HashSet<String>) -> usize {
        let recipients: Vec<Recipient> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|s| !exclude.contains(&s.key))
                .map(|s| (s.key.clone(), s.connection_id, Arc::clone(&s.transport)))
                .collect()
        };
        self.deliver(recipients, message).await
    }

    /// Deliver to the room's membership as of this call; returns delivered count
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        message: &str,
        exclude: Option<&str>,
    ) -> usize {
        let members: Vec<String> = {
            let memberships = self.memberships.read().await;
            match memberships.get(room_id) {
                Some(members) => members
                    .iter()
                    .filter(|key| Some(key.as_str()) != exclude)
                    .cloned()
                    .collect(),
                None => return 0,
            }
        };

        let recipients: Vec<Recipient> = {
            let connections = self.connections.read().await;
            members
                .iter()
                .filter_map(|key| connections.get(key))
                .map(|s| (s.key.clone(), s.connection_id, Arc::clone(&s.transport)))
                .collect()
        };
        self.deliver(recipients, message).await
    }

    /// Send to all recipients concurrently; failures are isolated and evicted afterwards
    async fn deliver(&self, recipients: Vec<Recipient>, message: &str) -> usize {
        let sends = recipients.into_iter().map(|(key, connection_id, transport)| async move {
            let result = self.send_with_deadline(&transport, message).await;
            (key, connection_id, result)
        });
        let results = join_all(sends).await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (key, connection_id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", key, e);
                    failed.push((key, connection_id));
                }
            }
        }

        for (key, connection_id) in failed {
            if self.evict(&key, connection_id).await.is_some() {
                debug!("Removed {} after failed delivery", key);
            }
        }

        delivered
    }

    async fn send_with_deadline(&self, transport: &Arc<dyn Transport>, message: &str) -> Result<()> {
        match tokio::time::timeout(self.send_timeout, transport.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(PulseError::Timeout("transport send".to_string())),
        }
    }

    /// Add a connected session to a room; returns false if it was already a member
    pub async fn join_room(&self, session_key: &str, room_id: &str) -> Result<bool> {
        let connections = self.connections.read().await;
        if !connections.contains_key(session_key) {
            return Err(PulseError::SessionNotFound(session_key.to_string()));
        }
        let mut memberships = self.memberships.write().await;
        let joined = memberships
            .entry(room_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(session_key.to_string());
        if joined {
            debug!("Session {} joined room {}", session_key, room_id);
        }
        Ok(joined)
    }

    /// Remove a session from a room; returns false if it was not a member
    pub async fn leave_room(&self, session_key: &str, room_id: &str) -> bool {
        let mut memberships = self.memberships.write().await;
        let left = match memberships.get_mut(room_id) {
            Some(members) => {
                let removed = members.remove(session_key);
                if members.is_empty() {
                    memberships.remove(room_id);
                }
                removed
            }
            None => false,
        };
        if left {
            debug!("Session {} left room {}", session_key, room_id);
        }
        left
    }

    /// Apply a position update under last-writer-wins by capture time.
    /// Returns whichever record is authoritative afterwards.
    pub async fn update_position(
        &self,
        session_key: &str,
        coordinates: Coordinates,
        timestamp: DateTime<Utc>,
        meta: PositionMeta,
    ) -> Result<PositionRecord> {
        let incoming = PositionRecord::new(coordinates, timestamp, meta);

        let connections = self.connections.read().await;
        if !connections.contains_key(session_key) {
            return Err(PulseError::SessionNotFound(session_key.to_string()));
        }
        let mut positions = self.positions.write().await;

        match positions.get(session_key) {
            Some(current) if !current.is_superseded_by(&incoming) => {
                debug!(
                    "Stale position for {} ignored ({} < {})",
                    session_key, incoming.timestamp, current.timestamp
                );
                Ok(current.clone())
            }
            _ => {
                positions.insert(session_key.to_string(), incoming.clone());
                Ok(incoming)
            }
        }
    }

    /// Point-in-time copy of every known position
    pub async fn snapshot_positions(&self) -> HashMap<String, PositionRecord> {
        self.positions.read().await.clone()
    }

    pub async fn position_of(&self, session_key: &str) -> Option<PositionRecord> {
        self.positions.read().await.get(session_key).cloned()
    }

    pub async fn is_connected(&self, session_key: &str) -> bool {
        self.connections.read().await.contains_key(session_key)
    }

    pub async fn session(&self, session_key: &str) -> Option<SessionInfo> {
        self.connections.read().await.get(session_key).map(Session::info)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sorted copy of a room's members
    pub async fn room_members(&self, room_id: &str) -> Vec<String> {
        let memberships = self.memberships.read().await;
        let mut members: Vec<String> = memberships
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn is_member(&self, session_key: &str, room_id: &str) -> bool {
        self.memberships
            .read()
            .await
            .get(room_id)
            .map_or(false, |m| m.contains(session_key))
    }

    /// Sorted rooms a session belongs to
    pub async fn rooms_of(&self, session_key: &str) -> Vec<String> {
        let memberships = self.memberships.read().await;
        let mut rooms: Vec<String> = memberships
            .iter()
            .filter(|(_, members)| members.contains(session_key))
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub async fn stats(&self) -> RegistryStats {
        let connections = self.connections.read().await.len();
        let (active_rooms, total_memberships) = {
            let memberships = self.memberships.read().await;
            (memberships.len(), memberships.values().map(HashSet::len).sum::<usize>())
        };
        let positioned_users = self.positions.read().await.len();

        RegistryStats {
            connections,
            active_rooms,
            total_memberships,
            positioned_users,
        }
    }
}

/// Drop a key from every room, removing rooms left empty; returns the rooms it was in
fn purge_memberships(memberships: &mut HashMap<String, HashSet<String>>, session_key: &str) -> Vec<String> {
    let mut rooms = Vec::new();
    memberships.retain(|room_id, members| {
        if members.remove(session_key) {
            rooms.push(room_id.clone());
        }
        !members.is_empty()
    });
    rooms.sort();
    rooms
}
