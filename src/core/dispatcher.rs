//! Per-session protocol driver
//!
//! Each live connection runs one `run_session` task: register, then decode
//! and route inbound frames until the transport closes, then tear down.
//! Errors in a single message are answered with an `error` frame and never
//! close the connection. The room, claim and drop operations here are also
//! what the HTTP handlers call, so both surfaces share one code path.

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::room_access::{authorize, AccessDecision, Permission, Role};
use crate::config::ServerConfig;
use crate::constants::CLOSE_SESSION_IN_USE;
use crate::core::collectible::{ClaimOutcome, ClaimReport, Collectible, CollectibleEngine};
use crate::core::connection::{Frame, InboundFrames, Transport};
use crate::core::position::{Coordinates, PositionMeta};
use crate::core::protocol::{Command, NearbyRoom, ServerMessage};
use crate::core::proximity::{distance_km, nearby_positions};
use crate::core::registry::{ConnectionRegistry, DisconnectReport};
use crate::core::session::{SessionIdentity, SessionInfo};
use crate::error::{PulseError, Result};
use crate::storage::{self, StorageProvider, StoredRoom, UserStat};

const MAX_NEARBY_EVENTS: usize = 20;

/// Lifecycle of one session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Result of a successful room join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub role: Role,
    /// False when the membership already existed
    pub newly_joined: bool,
    /// False when the user has no live session (HTTP join)
    pub live: bool,
}

pub struct SessionDispatcher {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<CollectibleEngine>,
    storage: Arc<dyn StorageProvider>,
    nearby_radius_km: f64,
    max_message_bytes: usize,
    store_timeout: Duration,
}

impl SessionDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<CollectibleEngine>,
        storage: Arc<dyn StorageProvider>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            storage,
            nearby_radius_km: config.nearby_radius_km,
            max_message_bytes: config.max_message_bytes,
            store_timeout: config.store_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<CollectibleEngine> {
        &self.engine
    }

    /// Drive one connection until it closes; returns the final state
    pub async fn run_session<I>(
        &self,
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
        mut inbound: I,
    ) -> SessionState
    where
        I: InboundFrames,
    {
        let mut state = SessionState::Connecting;
        trace!("Session {} is {:?}", identity.session_key, state);

        let session = match self
            .registry
            .connect(identity.clone(), Arc::clone(&transport))
            .await
        {
            Ok(info) => info,
            Err(PulseError::DuplicateSession(key)) => {
                debug!("Session {} already live, replacing it", key);
                match self.registry.replace(identity, Arc::clone(&transport)).await {
                    Ok((info, previous)) => {
                        if let Some(report) = previous {
                            self.release_rooms(&report).await;
                        }
                        info
                    }
                    Err(e) => {
                        self.refuse(transport.as_ref(), &e).await;
                        return SessionState::Closed;
                    }
                }
            }
            Err(e) => {
                error!("Could not register session {}: {}", identity.session_key, e);
                return SessionState::Closed;
            }
        };

        state = SessionState::Open;
        trace!("Session {} is {:?}", session.key, state);

        self.send(
            &session.key,
            &ServerMessage::Connected {
                session_key: session.key.clone(),
                connection_id: session.connection_id,
                authenticated: session.authenticated,
                timestamp: Utc::now(),
            },
        )
        .await;

        while state == SessionState::Open {
            match inbound.receive().await {
                Ok(Frame::Text(text)) => {
                    if !self.still_current(&session).await {
                        debug!("Session {} was superseded, stopping its reader", session.key);
                        state = SessionState::Closed;
                        continue;
                    }
                    self.dispatch(&session.key, &text).await;
                }
                Ok(Frame::Closed) => state = SessionState::Closed,
                Err(e) => {
                    warn!("Transport error for {}: {}", session.key, e);
                    state = SessionState::Closed;
                }
            }
        }

        self.teardown(&session).await;
        state
    }

    /// Tell an unregistered connection why it was turned away, then close it
    async fn refuse(&self, transport: &dyn Transport, err: &PulseError) {
        match ServerMessage::error(err).to_json() {
            Ok(text) => {
                if let Err(e) = transport.send(&text).await {
                    debug!("Refusal notice not delivered: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize refusal: {}", e),
        }
        transport.close(CLOSE_SESSION_IN_USE, "session key in use").await;
    }

    async fn still_current(&self, session: &SessionInfo) -> bool {
        self.registry
            .session(&session.key)
            .await
            .map_or(false, |live| live.connection_id == session.connection_id)
    }

    /// Remove the session (if it is still this connection) and announce the departure to everyone
    async fn teardown(&self, session: &SessionInfo) {
        let Some(report) = self
            .registry
            .disconnect_connection(&session.key, session.connection_id)
            .await
        else {
            return;
        };

        self.release_rooms(&report).await;

        let notice = ServerMessage::UserDisconnected {
            user_id: session.key.clone(),
            timestamp: Utc::now(),
        };
        self.broadcast_all(&notice).await;
    }

    /// Count a removed session out of every room it was a live member of
    async fn release_rooms(&self, report: &DisconnectReport) {
        for room_id in &report.rooms {
            if let Err(e) = self
                .bounded(
                    self.storage
                        .rooms()
                        .remove_participant(room_id, &report.session.key),
                )
                .await
            {
                warn!(
                    "Failed to release {} from room {}: {}",
                    report.session.key, room_id, e
                );
            }
        }
    }

    /// Handle one inbound frame. Failures are reported to the sender only.
    pub async fn dispatch(&self, session_key: &str, text: &str) {
        if let Err(e) = self.handle_frame(session_key, text).await {
            if e.is_per_message() {
                warn!("Message from {} dropped: {}", session_key, e);
            } else {
                error!("Failed to handle message from {}: {}", session_key, e);
            }
            self.send(session_key, &ServerMessage::error(&e)).await;
        }
    }

    async fn handle_frame(&self, session_key: &str, text: &str) -> Result<()> {
        if text.len() > self.max_message_bytes {
            return Err(PulseError::MessageTooLarge(text.len()));
        }

        let command = Command::decode(text)?;
        trace!("{} sent {}", session_key, command.kind());

        match command {
            Command::PositionUpdate {
                coordinates,
                timestamp,
                meta,
            } => {
                self.update_position(session_key, coordinates, timestamp, meta)
                    .await
            }
            Command::JoinRoom { room_id } => self.join_room(session_key, &room_id).await.map(|_| ()),
            Command::LeaveRoom { room_id } => self.leave_room(session_key, &room_id).await.map(|_| ()),
            Command::Chat { room_id, message } => self.chat(session_key, &room_id, message).await,
            Command::Claim { collectible_id } => self
                .claim_and_announce(session_key, &collectible_id)
                .await
                .map(|_| ()),
            Command::Unrecognized(kind) => {
                warn!("Unknown message type from {}: {}", session_key, kind);
                Ok(())
            }
        }
    }

    async fn update_position(
        &self,
        session_key: &str,
        coordinates: Coordinates,
        timestamp: Option<DateTime<Utc>>,
        meta: PositionMeta,
    ) -> Result<()> {
        let record = self
            .registry
            .update_position(
                session_key,
                coordinates,
                timestamp.unwrap_or_else(Utc::now),
                meta,
            )
            .await?;

        if let Err(e) = self
            .bounded(self.storage.users().update_location(session_key, record.coordinates))
            .await
        {
            warn!("Failed to persist location for {}: {}", session_key, e);
        }

        self.broadcast_all(&ServerMessage::location_update(session_key, &record))
            .await;

        match self.nearby_rooms(&record.coordinates).await {
            Ok(events) => {
                self.send(
                    session_key,
                    &ServerMessage::NearbyEvents {
                        events,
                        timestamp: Utc::now(),
                    },
                )
                .await
            }
            Err(e) => warn!("Nearby events lookup failed for {}: {}", session_key, e),
        }

        let snapshot = self.registry.snapshot_positions().await;
        let users = nearby_positions(&record.coordinates, self.nearby_radius_km, &snapshot)
            .into_iter()
            .filter(|entry| entry.id != session_key)
            .collect();
        self.send(
            session_key,
            &ServerMessage::NearbyUsers {
                users,
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok(())
    }

    /// Active rooms within the nearby radius, closest first
    pub async fn nearby_rooms(&self, origin: &Coordinates) -> Result<Vec<NearbyRoom>> {
        let rooms = self.bounded(self.storage.rooms().active_rooms()).await?;

        let mut nearby: Vec<NearbyRoom> = rooms
            .into_iter()
            .filter_map(|room| {
                let distance = distance_km(origin, &room.location);
                (distance <= self.nearby_radius_km).then(|| NearbyRoom {
                    id: room.id,
                    title: room.title,
                    location: room.location,
                    current_participants: room.current_participants,
                    distance_km: distance,
                })
            })
            .collect();
        nearby.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.id.cmp(&b.id))
        });
        nearby.truncate(MAX_NEARBY_EVENTS);
        Ok(nearby)
    }

    /// Authorize and join a room, then update the stored counters and tell the room.
    /// Works for users without a live session too; they just get no live membership.
    pub async fn join_room(&self, user_id: &str, room_id: &str) -> Result<JoinOutcome> {
        let room = self.bounded(self.storage.rooms().get_room(room_id)).await?;

        let role = match authorize(user_id, room.as_ref(), Permission::Join) {
            AccessDecision::Granted(role) => role,
            AccessDecision::Denied { reason, .. } => return Err(PulseError::Forbidden(reason)),
            AccessDecision::RoomNotFound => return Err(PulseError::RoomNotFound(room_id.to_string())),
        };

        let (live_joined, live) = match self.registry.join_room(user_id, room_id).await {
            Ok(joined) => (joined, true),
            Err(PulseError::SessionNotFound(_)) => (false, false),
            Err(e) => return Err(e),
        };

        let counted = match self
            .bounded(self.storage.rooms().add_participant(room_id, user_id))
            .await
        {
            Ok(added) => added,
            Err(e) => {
                warn!("Failed to count {} into room {}: {}", user_id, room_id, e);
                false
            }
        };
        if counted {
            if let Err(e) = self
                .bounded(self.storage.users().increment_stat(user_id, UserStat::EventsAttended))
                .await
            {
                warn!("Failed to update stats for {}: {}", user_id, e);
            }
        }

        let newly_joined = live_joined || counted;
        if newly_joined {
            self.broadcast_to_room(
                room_id,
                &ServerMessage::UserJoined {
                    user_id: user_id.to_string(),
                    room_id: room_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
        }

        info!("{} joined room {} as {:?}", user_id, room_id, role);
        Ok(JoinOutcome {
            role,
            newly_joined,
            live,
        })
    }

    /// Leave a room; returns whether a live membership was removed
    pub async fn leave_room(&self, user_id: &str, room_id: &str) -> Result<bool> {
        let left = self.registry.leave_room(user_id, room_id).await;
        let uncounted = self
            .bounded(self.storage.rooms().remove_participant(room_id, user_id))
            .await?;

        if left || uncounted {
            self.broadcast_to_room(
                room_id,
                &ServerMessage::UserLeft {
                    user_id: user_id.to_string(),
                    room_id: room_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
            info!("{} left room {}", user_id, room_id);
        } else {
            debug!("{} left room {} without being in it", user_id, room_id);
        }
        Ok(left)
    }

    async fn chat(&self, session_key: &str, room_id: &str, message: String) -> Result<()> {
        if !self.registry.is_member(session_key, room_id).await {
            return Err(PulseError::Forbidden(format!(
                "join {} before sending messages to it",
                room_id
            )));
        }

        let delivered = self
            .broadcast_to_room(
                room_id,
                &ServerMessage::ChatMessage {
                    user_id: session_key.to_string(),
                    room_id: room_id.to_string(),
                    message,
                    timestamp: Utc::now(),
                },
            )
            .await;
        debug!("Chat from {} in {} reached {} members", session_key, room_id, delivered);
        Ok(())
    }

    /// Run a claim, tell the claimant, and announce a win to everyone
    pub async fn claim_and_announce(&self, claimant_id: &str, collectible_id: &str) -> Result<ClaimOutcome> {
        let outcome = self.engine.claim(collectible_id, claimant_id).await?;

        let result = ServerMessage::ClaimResult {
            result: ClaimReport::from(&outcome),
            timestamp: Utc::now(),
        };
        self.send(claimant_id, &result).await;

        if outcome.is_success() {
            self.broadcast_all(&ServerMessage::CollectibleClaimed {
                collectible_id: collectible_id.to_string(),
                winner_id: claimant_id.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(outcome)
    }

    /// Drop a random collectible at the room's location and announce it to the room
    pub async fn drop_collectible(&self, room: &StoredRoom) -> Result<Collectible> {
        let collectible = self.engine.drop_random(&room.id, room.location).await?;

        self.broadcast_to_room(
            &room.id,
            &ServerMessage::CollectibleDrop {
                collectible: collectible.clone(),
                expires_in: self.engine.claim_window().as_secs(),
                timestamp: Utc::now(),
            },
        )
        .await;

        info!(
            "Dropped {} collectible {} in room {}",
            collectible.tier.as_str(),
            collectible.id,
            room.id
        );
        Ok(collectible)
    }

    async fn bounded<T>(&self, operation: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        storage::with_deadline(self.store_timeout, operation).await
    }

    /// Send to one session; absence is expected (HTTP callers) and only logged
    async fn send(&self, session_key: &str, message: &ServerMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                return;
            }
        };
        match self.registry.send_to(session_key, &text).await {
            Ok(()) => {}
            Err(PulseError::SessionNotFound(_)) => {
                trace!("{} is not connected, message not delivered", session_key)
            }
            Err(e) => debug!("Delivery to {} failed: {}", session_key, e),
        }
    }

    async fn broadcast_all(&self, message: &ServerMessage) -> usize {
        match message.to_json() {
            Ok(text) => self.registry.broadcast_all(&text, &HashSet::new()).await,
            Err(e) => {
                error!("Failed to serialize broadcast: {}", e);
                0
            }
        }
    }

    async fn broadcast_to_room(&self, room_id: &str, message: &ServerMessage) -> usize {
        match message.to_json() {
            Ok(text) => self.registry.broadcast_to_room(room_id, &text, None).await,
            Err(e) => {
                error!("Failed to serialize room broadcast: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::{ChannelInbound, ChannelTransport};
    use crate::storage::{MemoryStorage, RoomStorage, UserStatsStorage};
    use tokio::sync::mpsc;
    use warp::ws::Message;

    fn dispatcher() -> (SessionDispatcher, Arc<MemoryStorage>) {
        let config = ServerConfig::for_testing();
        let store = Arc::new(MemoryStorage::new());
        let storage: Arc<dyn StorageProvider> = store.clone();
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
        let engine = Arc::new(CollectibleEngine::new(
            Arc::clone(&storage),
            config.claim_window,
            config.store_timeout,
        ));
        (SessionDispatcher::new(registry, engine, storage, &config), store)
    }

    async fn connect(
        dispatcher: &SessionDispatcher,
        key: &str,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher
            .registry()
            .connect(SessionIdentity::anonymous(key), Arc::new(ChannelTransport::new(tx)))
            .await
            .unwrap();
        rx
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let msg = rx.try_recv().expect("expected a frame");
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    fn room(id: &str, creator: &str) -> StoredRoom {
        StoredRoom::public(id, "Plaza", creator, Coordinates::new(-74.08, 4.6).unwrap())
    }

    #[tokio::test]
    async fn test_bad_message_gets_error_reply_and_session_survives() {
        let (dispatcher, _) = dispatcher();
        let mut rx = connect(&dispatcher, "u1").await;

        dispatcher.dispatch("u1", "{broken").await;
        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "invalid_message");
        assert!(dispatcher.registry().is_connected("u1").await);

        dispatcher.dispatch("u1", r#"{"type":"teleport"}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_counts_participants_and_notifies_room() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();
        let mut rx = connect(&dispatcher, "u1").await;

        dispatcher.dispatch("u1", r#"{"type":"join_event","event_id":"r1"}"#).await;
        let joined = next_json(&mut rx);
        assert_eq!(joined["type"], "user_joined");
        assert_eq!(joined["room_id"], "r1");

        // repeat join is idempotent
        dispatcher.dispatch("u1", r#"{"type":"join_event","event_id":"r1"}"#).await;
        assert!(rx.try_recv().is_err());

        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 1);
        assert_eq!(store.get_stats("u1").await.unwrap().events_attended, 1);
    }

    #[tokio::test]
    async fn test_offline_join_and_leave_are_counted_once() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();

        for _ in 0..3 {
            let outcome = dispatcher.join_room("ghost", "r1").await.unwrap();
            assert!(!outcome.live);
        }
        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 1);
        assert_eq!(store.get_stats("ghost").await.unwrap().events_attended, 1);

        // a user who never joined leaves nothing behind
        assert!(!dispatcher.leave_room("never_joined", "r1").await.unwrap());
        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 1);

        dispatcher.leave_room("ghost", "r1").await.unwrap();
        dispatcher.leave_room("ghost", "r1").await.unwrap();
        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 0);
    }

    #[tokio::test]
    async fn test_offline_join_then_live_join_counts_once() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();

        let first = dispatcher.join_room("u1", "r1").await.unwrap();
        assert!(first.newly_joined);

        let mut rx = connect(&dispatcher, "u1").await;
        let second = dispatcher.join_room("u1", "r1").await.unwrap();
        assert!(second.live);
        assert!(second.newly_joined);
        assert_eq!(next_json(&mut rx)["type"], "user_joined");

        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 1);
        assert_eq!(store.get_stats("u1").await.unwrap().events_attended, 1);
    }

    #[tokio::test]
    async fn test_anonymous_session_cannot_take_authenticated_key() {
        let (dispatcher, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let (owner_frames, owner_rx) = mpsc::unbounded_channel();
        let (owner_tx, mut owner_out) = mpsc::unbounded_channel();
        let owner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .run_session(
                        SessionIdentity::authenticated("u1"),
                        Arc::new(ChannelTransport::new(owner_tx)),
                        ChannelInbound::new(owner_rx),
                    )
                    .await
            })
        };
        let hello = owner_out.recv().await.unwrap();
        assert!(hello.to_str().unwrap().contains("\"connected\""));

        let (_intruder_frames, intruder_rx) = mpsc::unbounded_channel();
        let (intruder_tx, mut intruder_out) = mpsc::unbounded_channel();
        let state = dispatcher
            .run_session(
                SessionIdentity::anonymous("u1"),
                Arc::new(ChannelTransport::new(intruder_tx)),
                ChannelInbound::new(intruder_rx),
            )
            .await;
        assert_eq!(state, SessionState::Closed);

        let refusal = next_json(&mut intruder_out);
        assert_eq!(refusal["type"], "error");
        assert_eq!(refusal["code"], "duplicate_session");
        assert!(intruder_out.try_recv().unwrap().is_close());

        let live = dispatcher.registry().session("u1").await.unwrap();
        assert!(live.authenticated);
        assert!(owner_out.try_recv().is_err());

        owner_frames.send(Ok(Frame::Closed)).unwrap();
        assert_eq!(owner.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_banned_user_is_refused() {
        let (dispatcher, store) = dispatcher();
        let mut r = room("r1", "host");
        r.banned_users = vec!["u1".to_string()];
        store.upsert_room(r).await.unwrap();
        let mut rx = connect(&dispatcher, "u1").await;

        dispatcher.dispatch("u1", r#"{"type":"join_event","event_id":"r1"}"#).await;
        let reply = next_json(&mut rx);
        assert_eq!(reply["code"], "forbidden");
        assert!(!dispatcher.registry().is_member("u1", "r1").await);

        dispatcher.dispatch("u1", r#"{"type":"join_event","event_id":"nope"}"#).await;
        assert_eq!(next_json(&mut rx)["code"], "room_not_found");
    }

    #[tokio::test]
    async fn test_chat_requires_membership() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();
        let mut rx = connect(&dispatcher, "u1").await;

        dispatcher
            .dispatch("u1", r#"{"type":"chat_message","event_id":"r1","message":"hi"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["code"], "forbidden");

        dispatcher.join_room("u1", "r1").await.unwrap();
        let _ = next_json(&mut rx);
        dispatcher
            .dispatch("u1", r#"{"type":"chat_message","event_id":"r1","message":"hi"}"#)
            .await;
        let chat = next_json(&mut rx);
        assert_eq!(chat["type"], "chat_message");
        assert_eq!(chat["message"], "hi");
    }

    #[tokio::test]
    async fn test_position_update_replies_with_nearby() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();
        let mut rx1 = connect(&dispatcher, "u1").await;
        let mut rx2 = connect(&dispatcher, "u2").await;

        dispatcher
            .dispatch("u2", r#"{"type":"location_update","coordinates":[-74.081,4.601]}"#)
            .await;
        let seen_by_u1 = next_json(&mut rx1);
        assert_eq!(seen_by_u1["type"], "location_update");
        while rx2.try_recv().is_ok() {}

        dispatcher
            .dispatch("u1", r#"{"type":"location_update","coordinates":[-74.08,4.6]}"#)
            .await;
        assert_eq!(next_json(&mut rx1)["type"], "location_update");
        let events = next_json(&mut rx1);
        assert_eq!(events["type"], "nearby_events");
        assert_eq!(events["events"][0]["id"], "r1");
        let users = next_json(&mut rx1);
        assert_eq!(users["type"], "nearby_users");
        assert_eq!(users["users"].as_array().unwrap().len(), 1);
        assert_eq!(users["users"][0]["id"], "u2");

        let stored = store.get_stats("u1").await.unwrap();
        assert!(stored.current_location.is_some());
    }

    #[tokio::test]
    async fn test_session_teardown_releases_rooms_and_announces() {
        let (dispatcher, store) = dispatcher();
        store.upsert_room(room("r1", "host")).await.unwrap();
        let mut watcher = connect(&dispatcher, "watcher").await;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(dispatcher);
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .run_session(
                        SessionIdentity::anonymous("u1"),
                        Arc::new(ChannelTransport::new(out_tx)),
                        ChannelInbound::new(frame_rx),
                    )
                    .await
            })
        };

        frame_tx
            .send(Ok(Frame::Text(r#"{"type":"join_event","event_id":"r1"}"#.to_string())))
            .unwrap();
        frame_tx.send(Ok(Frame::Closed)).unwrap();
        assert_eq!(task.await.unwrap(), SessionState::Closed);

        assert!(!dispatcher.registry().is_connected("u1").await);
        assert_eq!(store.get_room("r1").await.unwrap().unwrap().current_participants, 0);

        let mut kinds = Vec::new();
        while let Ok(msg) = watcher.try_recv() {
            let value: serde_json::Value = serde_json::from_str(msg.to_str().unwrap()).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.last().map(String::as_str), Some("user_disconnected"));
    }
}
