//! Integration tests for unauthorized tunnel handling
//!
//! A tunnel that comes up without a matching connect from this controller
//! must be torn down, whether it is noticed through a status event or by the
//! periodic monitor.

mod common;

use common::{drain, identity, settle, Harness};
use tokio_test::assert_ok;
use tunnelguard_core::config::MONITOR_INTERVAL;
use tunnelguard_core::tunnel::{Stage, TunnelStatus};
use tunnelguard_core::types::{ConnectionIntent, SessionConfig};

const CONFIG: &str = "client\nremote vpn.example.com 1194";

#[tokio::test(start_paused = true)]
async fn test_unrequested_connected_is_forced_down() {
    let h = Harness::new();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);

    h.provider.emit(TunnelStatus::Connected);
    settle().await;

    assert_eq!(drain(&mut stages), vec![Stage::Disconnected]);
    assert_eq!(h.provider.stop_count(), 1);

    let snapshot = h.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.intent, ConnectionIntent::IDLE);
    assert!(snapshot.manual_disconnect);
    assert!(!snapshot.reconnect_pending);
    assert_eq!(h.persisted_intent(), ConnectionIntent::IDLE);
}

#[tokio::test(start_paused = true)]
async fn test_unrequested_connecting_is_forced_down() {
    let h = Harness::new();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);

    h.provider.emit(TunnelStatus::Connecting);
    settle().await;

    assert_eq!(drain(&mut stages), vec![Stage::Disconnected]);
    assert_eq!(h.provider.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stray_connected_after_disconnect_is_forced_down() {
    let h = Harness::new();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);
    assert_ok!(h.controller.connect(SessionConfig::new(CONFIG)).await);
    h.controller.disconnect().await;

    h.provider.emit(TunnelStatus::Connected);
    settle().await;

    let seen = drain(&mut stages);
    assert_eq!(seen, vec![Stage::Disconnected]);
    assert!(!seen.contains(&Stage::Connected));
    // One stop from disconnect, one from the forced path
    assert_eq!(h.provider.stop_count(), 2);
    assert_eq!(h.controller.snapshot().await.unwrap().intent, ConnectionIntent::IDLE);
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect_never_schedules_reconnect() {
    let h = Harness::new();
    assert_ok!(h.controller.initialize(identity(), true).await);

    h.provider.emit(TunnelStatus::Connected);
    h.provider.emit(TunnelStatus::Disconnected);
    settle().await;

    let snapshot = h.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.reconnects_scheduled, 0);
    // The Disconnected that followed the forced stop settled it
    assert!(!snapshot.manual_disconnect);
    assert_eq!(snapshot.intent, ConnectionIntent::IDLE);
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect_tolerates_stop_failure() {
    let h = Harness::new();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);
    h.provider.fail_stop(Some("operation not permitted"));

    h.provider.emit(TunnelStatus::Connected);
    settle().await;

    assert_eq!(drain(&mut stages), vec![Stage::Disconnected]);
    assert_eq!(h.controller.snapshot().await.unwrap().intent, ConnectionIntent::IDLE);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_catches_silent_activation() {
    let h = Harness::autonomous();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);

    // A stale system profile comes up without telling anyone
    h.provider.set_status(Some(TunnelStatus::Connected));
    settle().await;
    assert_eq!(h.provider.stop_count(), 0);

    tokio::time::sleep(MONITOR_INTERVAL).await;
    settle().await;

    assert_eq!(h.provider.stop_count(), 1);
    assert_eq!(
        drain(&mut stages),
        vec![Stage::Disconnected, Stage::Disconnecting, Stage::Disconnected]
    );
    let snapshot = h.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.intent, ConnectionIntent::IDLE);
    assert!(!snapshot.manual_disconnect);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_leaves_owned_tunnel_alone() {
    let h = Harness::autonomous();
    let mut stages = h.controller.subscribe_stages();
    assert_ok!(h.controller.initialize(identity(), true).await);
    assert_ok!(h.controller.connect(SessionConfig::new(CONFIG)).await);
    settle().await;

    tokio::time::sleep(MONITOR_INTERVAL * 5).await;

    assert_eq!(h.provider.stop_count(), 0);
    assert_eq!(drain(&mut stages), vec![Stage::Connecting, Stage::Connected]);
    assert_eq!(h.persisted_intent(), ConnectionIntent::CONNECT);
}

#[tokio::test(start_paused = true)]
async fn test_reinitialize_runs_single_monitor() {
    let h = Harness::new();
    assert_ok!(h.controller.initialize(identity(), false).await);
    assert_ok!(h.controller.initialize(identity(), false).await);
    assert_ok!(h.controller.initialize(identity(), false).await);

    h.provider.set_status(Some(TunnelStatus::Connected));
    tokio::time::sleep(MONITOR_INTERVAL).await;
    settle().await;

    // Three stacked monitors would have stopped three times
    assert_eq!(h.provider.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_stops_on_dispose() {
    let h = Harness::new();
    assert_ok!(h.controller.initialize(identity(), false).await);
    h.controller.dispose().await;

    h.provider.set_status(Some(TunnelStatus::Connected));
    tokio::time::sleep(MONITOR_INTERVAL * 3).await;

    assert_eq!(h.provider.stop_count(), 0);
}
