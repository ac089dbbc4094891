// Integration tests for the connection registry and proximity queries

use chrono::{Duration as ChronoDuration, Utc};
use pulse_live::core::position::{Coordinates, PositionMeta};
use pulse_live::core::proximity::nearby_positions;
use pulse_live::core::{ChannelTransport, ConnectionRegistry, SessionIdentity, Transport};
use pulse_live::error::{PulseError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warp::ws::Message;

fn registry() -> ConnectionRegistry {
    ConnectionRegistry::new(Duration::from_millis(200))
}

fn channel() -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelTransport::new(tx)), rx)
}

/// Transport whose sends always fail
struct BrokenTransport;

#[async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _message: &str) -> Result<()> {
        Err(PulseError::TransportError("peer went away".to_string()))
    }

    async fn close(&self, _code: u16, _reason: &str) {}
}

fn point(lng: f64, lat: f64) -> Coordinates {
    Coordinates::new(lng, lat).unwrap()
}

#[tokio::test]
async fn test_double_disconnect_is_noop() {
    let registry = registry();
    let (t, _rx) = channel();
    registry.connect(SessionIdentity::anonymous("u1"), t).await.unwrap();

    assert!(registry.disconnect("u1").await.is_some());
    assert!(registry.disconnect("u1").await.is_none());
    assert_eq!(registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_disconnected_session_leaves_no_trace() {
    let registry = registry();
    let (t1, _rx1) = channel();
    let (t2, _rx2) = channel();
    registry.connect(SessionIdentity::anonymous("u1"), t1).await.unwrap();
    registry.connect(SessionIdentity::anonymous("u2"), t2).await.unwrap();

    registry.join_room("u1", "plaza").await.unwrap();
    registry.join_room("u2", "plaza").await.unwrap();
    registry.join_room("u1", "park").await.unwrap();
    registry
        .update_position("u1", point(-74.08, 4.6), Utc::now(), PositionMeta::default())
        .await
        .unwrap();

    let report = registry.disconnect("u1").await.unwrap();
    assert_eq!(report.rooms, vec!["park".to_string(), "plaza".to_string()]);
    assert!(report.had_position);

    assert!(!registry.snapshot_positions().await.contains_key("u1"));
    assert_eq!(registry.room_members("plaza").await, vec!["u2".to_string()]);
    assert!(registry.room_members("park").await.is_empty());
    assert!(registry.rooms_of("u1").await.is_empty());

    let stats = registry.stats().await;
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.total_memberships, 1);
    assert_eq!(stats.positioned_users, 0);
}

#[tokio::test]
async fn test_position_last_writer_wins_regardless_of_arrival() {
    let t1 = Utc::now();
    let t2 = t1 + ChronoDuration::seconds(5);
    let early = point(-74.08, 4.60);
    let late = point(-74.07, 4.61);

    for order in [[(t1, early), (t2, late)], [(t2, late), (t1, early)]] {
        let registry = registry();
        let (t, _rx) = channel();
        registry.connect(SessionIdentity::anonymous("u1"), t).await.unwrap();

        for (ts, coords) in order {
            registry
                .update_position("u1", coords, ts, PositionMeta::default())
                .await
                .unwrap();
        }

        let stored = registry.position_of("u1").await.unwrap();
        assert_eq!(stored.timestamp, t2);
        assert_eq!(stored.coordinates, late);
    }
}

#[tokio::test]
async fn test_stale_update_returns_current_record() {
    let registry = registry();
    let (t, _rx) = channel();
    registry.connect(SessionIdentity::anonymous("u1"), t).await.unwrap();

    let now = Utc::now();
    registry
        .update_position("u1", point(1.0, 1.0), now, PositionMeta::default())
        .await
        .unwrap();
    let authoritative = registry
        .update_position(
            "u1",
            point(2.0, 2.0),
            now - ChronoDuration::seconds(1),
            PositionMeta::default(),
        )
        .await
        .unwrap();
    assert_eq!(authoritative.coordinates, point(1.0, 1.0));
}

#[tokio::test]
async fn test_send_to_absent_session_is_not_connected() {
    let registry = registry();
    assert_eq!(
        registry.send_to("ghost", "{}").await,
        Err(PulseError::SessionNotFound("ghost".to_string()))
    );
}

#[tokio::test]
async fn test_broadcast_isolates_failures_and_evicts() {
    let registry = registry();
    let (good, mut good_rx) = channel();
    registry.connect(SessionIdentity::anonymous("good"), good).await.unwrap();
    registry
        .connect(SessionIdentity::anonymous("broken"), Arc::new(BrokenTransport))
        .await
        .unwrap();
    registry.join_room("broken", "plaza").await.unwrap();

    let delivered = registry.broadcast_all("{\"type\":\"ping\"}", &HashSet::new()).await;
    assert_eq!(delivered, 1);
    assert!(good_rx.recv().await.unwrap().is_text());

    assert!(!registry.is_connected("broken").await);
    assert!(registry.room_members("plaza").await.is_empty());
}

#[tokio::test]
async fn test_broadcast_respects_exclusions_and_room_scope() {
    let registry = registry();
    let (a, mut rx_a) = channel();
    let (b, mut rx_b) = channel();
    registry.connect(SessionIdentity::anonymous("a"), a).await.unwrap();
    registry.connect(SessionIdentity::anonymous("b"), b).await.unwrap();
    registry.join_room("a", "plaza").await.unwrap();

    let exclude: HashSet<String> = ["a".to_string()].into_iter().collect();
    assert_eq!(registry.broadcast_all("{}", &exclude).await, 1);
    assert!(rx_b.try_recv().is_ok());
    assert!(rx_a.try_recv().is_err());

    assert_eq!(registry.broadcast_to_room("plaza", "{}", None).await, 1);
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err());
    assert_eq!(registry.broadcast_to_room("empty", "{}", None).await, 0);
}

#[tokio::test]
async fn test_concurrent_disconnects_and_joins() {
    let registry = Arc::new(registry());
    let mut receivers = Vec::new();
    for i in 0..20 {
        let (t, rx) = channel();
        receivers.push(rx);
        registry
            .connect(SessionIdentity::anonymous(format!("u{}", i)), t)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            let key = format!("u{}", i);
            let _ = registry.join_room(&key, "plaza").await;
            registry.disconnect(&key).await;
            registry.disconnect(&key).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.connection_count().await, 0);
    assert!(registry.room_members("plaza").await.is_empty());
}

#[tokio::test]
async fn test_nearby_over_registry_snapshot() {
    let registry = registry();
    let origin = point(-74.08, 4.60);
    // roughly 1, 4 and 6 km due north
    let offsets = [("near", 0.009), ("mid", 0.036), ("far", 0.054)];
    let mut receivers = Vec::new();
    for (key, d_lat) in offsets {
        let (t, rx) = channel();
        receivers.push(rx);
        registry.connect(SessionIdentity::anonymous(key), t).await.unwrap();
        registry
            .update_position(key, point(-74.08, 4.60 + d_lat), Utc::now(), PositionMeta::default())
            .await
            .unwrap();
    }

    let snapshot = registry.snapshot_positions().await;
    let ids: Vec<String> = nearby_positions(&origin, 5.0, &snapshot)
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["near".to_string(), "mid".to_string()]);
}
