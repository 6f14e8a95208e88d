use super::*;
use tokio::time::{Duration, timeout};

fn limits() -> ViewLimits {
    ViewLimits { min_zoom: -1, max_zoom: 2, pan_degrees_per_pixel: 1.0 }
}

fn spawn_hub() -> SyncHub {
    let (hub, _task) = SyncHub::spawn(MapViewState::new("official_map", &limits()), limits(), 64);
    hub
}

async fn connect(hub: &SyncHub, depth: usize) -> (SessionId, mpsc::Receiver<ServerMessage>) {
    let session_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(depth);
    hub.join(session_id, tx).await.expect("join should succeed");
    (session_id, rx)
}

/// Connect and consume the bootstrap plus the join's own count update.
async fn connect_drained(hub: &SyncHub) -> (SessionId, mpsc::Receiver<ServerMessage>) {
    let (id, mut rx) = connect(hub, 64).await;
    assert!(matches!(recv(&mut rx).await, ServerMessage::MapChange { .. }));
    assert!(matches!(recv(&mut rx).await, ServerMessage::ClientCountUpdate { .. }));
    (id, rx)
}

async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("hub message receive timed out")
        .expect("session channel closed unexpectedly")
}

async fn assert_no_message(rx: &mut mpsc::Receiver<ServerMessage>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no hub message"
    );
}

fn state_update(lat: f64, lng: f64, zoom: i32) -> Command {
    Command::StateUpdate { lat, lng, zoom }
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

#[tokio::test]
async fn join_sends_bootstrap_before_client_count() {
    let hub = spawn_hub();
    let (_id, mut rx) = connect(&hub, 8).await;

    assert_eq!(
        recv(&mut rx).await,
        ServerMessage::MapChange { map_name: "official_map".into(), lat: 0.0, lng: 0.0, zoom: 0, version: 0 }
    );
    assert_eq!(recv(&mut rx).await, ServerMessage::ClientCountUpdate { count: 1 });
}

#[tokio::test]
async fn client_count_follows_joins_and_leaves() {
    let hub = spawn_hub();
    let (_a, mut rx_a) = connect_drained(&hub).await;

    let (b, _rx_b) = connect_drained(&hub).await;
    assert_eq!(recv(&mut rx_a).await, ServerMessage::ClientCountUpdate { count: 2 });

    hub.leave(b).await.unwrap();
    assert_eq!(recv(&mut rx_a).await, ServerMessage::ClientCountUpdate { count: 1 });
    assert_eq!(hub.snapshot().await.unwrap().clients(), 1);
}

#[tokio::test]
async fn leaving_twice_broadcasts_once() {
    let hub = spawn_hub();
    let (_a, mut rx_a) = connect_drained(&hub).await;
    let (b, _rx_b) = connect_drained(&hub).await;
    recv(&mut rx_a).await;

    hub.leave(b).await.unwrap();
    hub.leave(b).await.unwrap();
    assert_eq!(recv(&mut rx_a).await, ServerMessage::ClientCountUpdate { count: 1 });
    assert_no_message(&mut rx_a).await;
}

#[tokio::test]
async fn late_joiner_bootstraps_with_current_state() {
    let hub = spawn_hub();
    hub.submit_external(state_update(1.0, 1.0, 1)).await.unwrap();
    hub.submit_external(Command::PanBy { dx: Some(2.0), dy: Some(0.0) }).await.unwrap();
    hub.submit_external(Command::ZoomIn).await.unwrap();
    hub.submit_external(Command::JumpTo { lat: 12.5, lng: -8.25 }).await.unwrap();
    hub.submit_external(Command::MapChange { map_name: "cave".into(), lat: 3.0, lng: 4.0, zoom: 2 })
        .await
        .unwrap();

    let (_id, mut rx) = connect(&hub, 8).await;
    assert_eq!(
        recv(&mut rx).await,
        ServerMessage::MapChange { map_name: "cave".into(), lat: 3.0, lng: 4.0, zoom: 2, version: 5 }
    );
}

// =============================================================================
// BROADCAST
// =============================================================================

#[tokio::test]
async fn state_update_reaches_everyone_but_the_sender() {
    let hub = spawn_hub();
    let (a, mut rx_a) = connect_drained(&hub).await;
    let (_b, mut rx_b) = connect_drained(&hub).await;
    let (_c, mut rx_c) = connect_drained(&hub).await;
    // Drain the count updates caused by later joins.
    recv(&mut rx_a).await;
    recv(&mut rx_a).await;
    recv(&mut rx_b).await;

    hub.submit(a, state_update(10.0, 20.0, 1)).await.unwrap();

    let expected = ServerMessage::StateUpdate { lat: 10.0, lng: 20.0, zoom: 1, version: 1 };
    assert_eq!(recv(&mut rx_b).await, expected);
    assert_eq!(recv(&mut rx_c).await, expected);
    assert_no_message(&mut rx_a).await;
}

#[tokio::test]
async fn map_change_reaches_the_sender_too() {
    let hub = spawn_hub();
    let (a, mut rx_a) = connect_drained(&hub).await;

    hub.submit(a, Command::MapChange { map_name: "cave".into(), lat: 1.0, lng: 2.0, zoom: 0 })
        .await
        .unwrap();

    assert_eq!(
        recv(&mut rx_a).await,
        ServerMessage::MapChange { map_name: "cave".into(), lat: 1.0, lng: 2.0, zoom: 0, version: 1 }
    );
}

#[tokio::test]
async fn last_writer_wins_in_receipt_order() {
    let hub = spawn_hub();
    let (a, _rx_a) = connect_drained(&hub).await;
    let (b, _rx_b) = connect_drained(&hub).await;
    let (_c, mut rx_c) = connect_drained(&hub).await;

    hub.submit(a, state_update(1.0, 1.0, 0)).await.unwrap();
    hub.submit(b, state_update(2.0, 2.0, 1)).await.unwrap();

    assert_eq!(recv(&mut rx_c).await, ServerMessage::StateUpdate { lat: 1.0, lng: 1.0, zoom: 0, version: 1 });
    assert_eq!(recv(&mut rx_c).await, ServerMessage::StateUpdate { lat: 2.0, lng: 2.0, zoom: 1, version: 2 });

    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!((snapshot.state.lat, snapshot.state.lng, snapshot.state.zoom), (2.0, 2.0, 1));
    assert_eq!(snapshot.state.version, 2);
}

#[tokio::test]
async fn external_submission_reaches_every_session_and_returns_state() {
    let hub = spawn_hub();
    let (_a, mut rx_a) = connect_drained(&hub).await;
    let (_b, mut rx_b) = connect_drained(&hub).await;
    recv(&mut rx_a).await;

    let state = hub.submit_external(state_update(5.0, 6.0, 2)).await.unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(state.map_name, "official_map");

    let expected = ServerMessage::StateUpdate { lat: 5.0, lng: 6.0, zoom: 2, version: 1 };
    assert_eq!(recv(&mut rx_a).await, expected);
    assert_eq!(recv(&mut rx_b).await, expected);
}

#[tokio::test]
async fn non_finite_commands_are_rejected_before_reaching_the_sequencer() {
    let hub = spawn_hub();
    let (a, mut rx_a) = connect_drained(&hub).await;

    let err = hub
        .submit_external(Command::JumpTo { lat: f64::INFINITY, lng: 0.0 })
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Rejected(MalformedCommand::NonFinite { kind: "jumpTo", field: "lat" })));
    assert_eq!(err.error_code(), "E_MALFORMED_COMMAND");

    let err = hub.submit(a, state_update(0.0, f64::NAN, 1)).await.unwrap_err();
    assert!(matches!(err, HubError::Rejected(_)));

    assert_no_message(&mut rx_a).await;
    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.state.version, 0);
    assert!(snapshot.state.lat.is_finite() && snapshot.state.lng.is_finite());
}

#[tokio::test]
async fn out_of_range_zoom_is_clamped_for_every_session() {
    let hub = spawn_hub();
    let (a, _rx_a) = connect_drained(&hub).await;
    let (_b, mut rx_b) = connect_drained(&hub).await;

    hub.submit(a, state_update(1.0, 1.0, -2000)).await.unwrap();
    assert_eq!(
        recv(&mut rx_b).await,
        ServerMessage::StateUpdate { lat: 1.0, lng: 1.0, zoom: -1, version: 1 }
    );
    assert_eq!(hub.snapshot().await.unwrap().state.zoom, -1);
}

#[tokio::test]
async fn zoom_at_bound_still_bumps_version_and_broadcasts() {
    let hub = spawn_hub();
    let (_a, mut rx_a) = connect_drained(&hub).await;

    for _ in 0..3 {
        hub.submit_external(Command::ZoomIn).await.unwrap();
    }
    let mut last = None;
    for _ in 0..3 {
        last = Some(recv(&mut rx_a).await);
    }
    assert_eq!(last, Some(ServerMessage::ZoomIn { lat: 0.0, lng: 0.0, zoom: 2, version: 3 }));
}

// =============================================================================
// EVICTION
// =============================================================================

#[tokio::test]
async fn full_session_is_evicted_without_stalling_others() {
    let hub = spawn_hub();
    let (_healthy, mut rx_healthy) = connect_drained(&hub).await;

    // Capacity 2 is filled by the bootstrap and the join's count update.
    let (_slow, _rx_slow) = connect(&hub, 2).await;
    assert_eq!(recv(&mut rx_healthy).await, ServerMessage::ClientCountUpdate { count: 2 });

    hub.submit_external(Command::JumpTo { lat: 1.0, lng: 1.0 }).await.unwrap();
    assert_eq!(
        recv(&mut rx_healthy).await,
        ServerMessage::JumpTo { lat: 1.0, lng: 1.0, zoom: 0, version: 1 }
    );
    assert_eq!(recv(&mut rx_healthy).await, ServerMessage::ClientCountUpdate { count: 1 });

    for i in 2..=20u32 {
        hub.submit_external(Command::JumpTo { lat: f64::from(i), lng: 0.0 }).await.unwrap();
        assert_eq!(recv(&mut rx_healthy).await.version(), Some(u64::from(i)));
    }
    assert_eq!(hub.snapshot().await.unwrap().clients(), 1);
}

#[tokio::test]
async fn dropped_receiver_is_evicted_on_next_broadcast() {
    let hub = spawn_hub();
    let (_a, mut rx_a) = connect_drained(&hub).await;
    let (_b, rx_b) = connect_drained(&hub).await;
    recv(&mut rx_a).await;
    drop(rx_b);

    hub.submit_external(Command::ZoomOut).await.unwrap();
    assert!(matches!(recv(&mut rx_a).await, ServerMessage::ZoomOut { version: 1, .. }));
    assert_eq!(recv(&mut rx_a).await, ServerMessage::ClientCountUpdate { count: 1 });
}

#[tokio::test]
async fn join_with_dropped_receiver_is_not_registered() {
    let hub = spawn_hub();
    let (tx, rx) = mpsc::channel(4);
    drop(rx);
    hub.join(Uuid::new_v4(), tx).await.unwrap();
    assert_eq!(hub.snapshot().await.unwrap().clients(), 0);
}

// =============================================================================
// SNAPSHOT / SHUTDOWN
// =============================================================================

#[tokio::test]
async fn snapshot_lists_sessions_oldest_first() {
    let hub = spawn_hub();
    let (a, _rx_a) = connect(&hub, 8).await;
    let (b, _rx_b) = connect(&hub, 8).await;

    let snapshot = hub.snapshot().await.unwrap();
    let ids: Vec<SessionId> = snapshot.sessions.iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&a) && ids.contains(&b));
    assert!(snapshot.sessions[0].joined_at <= snapshot.sessions[1].joined_at);
}

#[tokio::test]
async fn shutdown_closes_sessions_and_rejects_requests() {
    let (hub, task) = SyncHub::spawn(MapViewState::new("m", &limits()), limits(), 8);
    let (_a, mut rx_a) = connect_drained(&hub).await;

    hub.shutdown().await.unwrap();
    timeout(Duration::from_millis(500), task)
        .await
        .expect("sequencer should stop")
        .expect("sequencer should not panic");

    assert!(rx_a.recv().await.is_none());
    assert!(matches!(hub.snapshot().await, Err(HubError::Closed)));
    assert_eq!(HubError::Closed.error_code(), "E_HUB_CLOSED");
}
