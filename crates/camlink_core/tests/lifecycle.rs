/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use camlink_core::coordinator::{StartError, StopResult};
use camlink_core::media::SampleFeedDevice;
use camlink_core::peer_session::PeerState;
use camlink_core::signal_store::{now_ms, NewSession, SignalStore};
use camlink_protocol::{FailureReason, Role, SessionStatus, SignalKind, StartSessionRequest};
use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn open_rows(db: &std::path::Path, endpoint: &str) -> i64 {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE endpoint_id = ?1 AND status IN ('pending', 'active')",
        [endpoint],
        |r| r.get(0),
    )
    .unwrap()
}

fn all_rows(db: &std::path::Path, endpoint: &str) -> i64 {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.query_row("SELECT COUNT(*) FROM sessions WHERE endpoint_id = ?1", [endpoint], |r| r.get(0))
        .unwrap()
}

async fn pending_session(store: &dyn SignalStore, endpoint: &str) -> String {
    let (rec, created) = store
        .create_or_get_open(NewSession {
            id: format!("{endpoint}-session"),
            endpoint_id: endpoint.to_string(),
            viewer_id: "viewer".to_string(),
            expires_at_ms: now_ms() + 60_000,
        })
        .await
        .unwrap();
    assert!(created);
    rec.id
}

#[tokio::test]
async fn concurrent_starts_share_one_session() {
    let (_dir, store) = temp_store();
    let tf = FakeTransportFactory::new("viewer", false);
    let viewer = viewer(fast_settings(), store.clone(), tf.clone());

    let (a, b) = tokio::join!(
        viewer.start(Role::Viewer, request("cam-1", "alice")),
        viewer.start(Role::Viewer, request("cam-1", "alice")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.session_id, b.session_id);
    assert_eq!([a.reused, b.reused].iter().filter(|r| **r).count(), 1);
    assert_eq!(tf.created().len(), 1);
    assert_eq!(open_rows(store.db_path(), "cam-1"), 1);

    let snap = viewer.metrics();
    assert_eq!(snap.sessions_started, 1);
    assert_eq!(snap.sessions_reused, 1);

    viewer.stop(&a.session_id).await.unwrap();
}

#[tokio::test]
async fn second_process_reuses_fresh_open_session() {
    let (_dir, store) = temp_store();
    let first = viewer(fast_settings(), store.clone(), FakeTransportFactory::new("a", false));
    let second = viewer(fast_settings(), store.clone(), FakeTransportFactory::new("b", false));

    let t1 = first.start(Role::Viewer, request("cam-2", "alice")).await.unwrap();
    let t2 = second.start(Role::Viewer, request("cam-2", "alice")).await.unwrap();
    assert_eq!(t1.session_id, t2.session_id);
    assert!(t2.reused);
    assert_eq!(open_rows(store.db_path(), "cam-2"), 1);

    first.stop(&t1.session_id).await.unwrap();
    second.stop(&t2.session_id).await.unwrap();
}

#[tokio::test]
async fn old_active_session_blocks_new_start() {
    let (_dir, store) = temp_store();
    let sid = pending_session(store.as_ref(), "cam-3").await;
    store.set_status(&sid, SessionStatus::Active, None).await.unwrap();

    let mut settings = fast_settings();
    settings.recency_window = Duration::from_millis(50);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let viewer = viewer(settings, store.clone(), FakeTransportFactory::new("viewer", false));
    match viewer.start(Role::Viewer, request("cam-3", "alice")).await {
        Err(StartError::AlreadyActive { session_id }) => assert_eq!(session_id, sid),
        other => panic!("expected AlreadyActive, got {other:?}"),
    }
    assert_eq!(open_rows(store.db_path(), "cam-3"), 1);
}

#[tokio::test]
async fn stale_pending_session_is_replaced() {
    let (_dir, store) = temp_store();
    let stale = pending_session(store.as_ref(), "cam-4").await;

    let mut settings = fast_settings();
    settings.recency_window = Duration::from_millis(50);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let viewer = viewer(settings, store.clone(), FakeTransportFactory::new("viewer", false));
    let ticket = viewer.start(Role::Viewer, request("cam-4", "alice")).await.unwrap();
    assert_ne!(ticket.session_id, stale);
    assert!(!ticket.reused);

    let old = store.get_session(&stale).await.unwrap().unwrap();
    assert_eq!(old.status, SessionStatus::Failed);
    assert_eq!(old.failure_reason, Some(FailureReason::Expired));
    assert_eq!(open_rows(store.db_path(), "cam-4"), 1);

    viewer.stop(&ticket.session_id).await.unwrap();
}

#[tokio::test]
async fn invalid_request_is_rejected() {
    let (_dir, store) = temp_store();
    let viewer = viewer(fast_settings(), store, FakeTransportFactory::new("viewer", false));
    let err = viewer.start(Role::Viewer, request("  ", "alice")).await.unwrap_err();
    assert!(matches!(err, StartError::Invalid(_)));
}

#[tokio::test]
async fn missing_microphone_still_starts_with_video_only() {
    let (_dir, store) = temp_store();
    let sid = pending_session(store.as_ref(), "cam-5").await;
    let device = Arc::new(SampleFeedDevice::new(true, false));
    let tf = FakeTransportFactory::new("capture", false);
    let capture = capture(fast_settings(), store.clone(), tf.clone(), device.clone());

    let ticket = capture
        .start(
            Role::Capture,
            StartSessionRequest {
                session_id: Some(sid.clone()),
                ..request("cam-5", "viewer")
            },
        )
        .await
        .unwrap();
    assert_eq!(ticket.session_id, sid);
    assert!(ticket.reused);

    let session = live_session(&capture, &sid).await;
    eventually("offer sent", || tf.created().len() == 1 && tf.last().calls().contains(&Call::CreateOffer)).await;
    assert_eq!(tf.last().calls()[0], Call::AttachCapture(1));
    assert!(device.current_video().is_some());
    assert!(device.current_audio().is_none());
    assert_eq!(session.state(), PeerState::Connecting);

    capture.stop(&sid).await.unwrap();
    assert!(device.current_video().is_none());
}

#[tokio::test]
async fn no_camera_fails_the_start_and_the_session() {
    let (_dir, store) = temp_store();
    let sid = pending_session(store.as_ref(), "cam-6").await;
    let device = Arc::new(SampleFeedDevice::new(false, true));
    let tf = FakeTransportFactory::new("capture", false);
    let capture = capture(fast_settings(), store.clone(), tf.clone(), device.clone());

    let err = capture
        .start(
            Role::Capture,
            StartSessionRequest {
                session_id: Some(sid.clone()),
                ..request("cam-6", "viewer")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::Hardware(_)), "{err}");
    assert!(tf.created().is_empty());
    assert!(device.current_audio().is_none());

    let rec = store.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Failed);
    assert_eq!(rec.failure_reason, Some(FailureReason::HardwareUnavailable));
    assert_eq!(capture.metrics().acquire_failures, 1);
}

#[tokio::test]
async fn concurrent_starts_share_one_failed_attempt() {
    let (_dir, store) = temp_store();
    let device = Arc::new(SampleFeedDevice::new(false, true));
    let tf = FakeTransportFactory::new("capture", false);
    let capture = capture(fast_settings(), store.clone(), tf.clone(), device);

    let (a, b) = tokio::join!(
        capture.start(Role::Capture, request("cam-6b", "viewer")),
        capture.start(Role::Capture, request("cam-6b", "viewer")),
    );
    assert!(matches!(a, Err(StartError::Hardware(_))), "{a:?}");
    assert!(matches!(b, Err(StartError::Hardware(_))), "{b:?}");
    assert_eq!(all_rows(store.db_path(), "cam-6b"), 1);
    assert_eq!(open_rows(store.db_path(), "cam-6b"), 0);
    assert_eq!(capture.metrics().acquire_failures, 1);
    assert!(tf.created().is_empty());

    // A fresh explicit start runs a new attempt.
    let err = capture.start(Role::Capture, request("cam-6b", "viewer")).await.unwrap_err();
    assert!(matches!(err, StartError::Hardware(_)));
    assert_eq!(all_rows(store.db_path(), "cam-6b"), 2);
    assert_eq!(capture.metrics().acquire_failures, 2);
}

#[tokio::test]
async fn undeliverable_offer_fails_the_capture_session() {
    let (_dir, sqlite) = temp_store();
    let store = RefusingStore::new(sqlite.clone(), SignalKind::Offer);
    let device = Arc::new(SampleFeedDevice::new(true, true));
    let tf = FakeTransportFactory::new("capture", true);
    let capture = capture_on(fast_settings(), store.clone(), tf.clone(), device.clone());

    let ticket = capture.start(Role::Capture, request("cam-6c", "viewer")).await.unwrap();
    let session = live_session(&capture, &ticket.session_id).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.wait()).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::SignalingFailed));

    let rec = sqlite.get_session(&ticket.session_id).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Failed);
    assert_eq!(rec.failure_reason, Some(FailureReason::SignalingFailed));
    assert!(!store.statuses().contains(&SessionStatus::Active));
    assert_eq!(store.refused(), fast_settings().append_retry.max_attempts);
    assert_eq!(capture.metrics().append_failures, 1);

    assert!(device.current_video().is_none());
    assert!(device.current_audio().is_none());
    assert!(tf.last().is_closed());
}

#[tokio::test]
async fn connect_timeout_releases_hardware_and_transport() {
    let (_dir, store) = temp_store();
    let sid = pending_session(store.as_ref(), "cam-7").await;
    let device = Arc::new(SampleFeedDevice::new(true, true));
    let tf = FakeTransportFactory::new("capture", false);
    let mut settings = fast_settings();
    settings.connect_timeout = Duration::from_millis(300);
    let capture = capture(settings, store.clone(), tf.clone(), device.clone());

    capture
        .start(
            Role::Capture,
            StartSessionRequest {
                session_id: Some(sid.clone()),
                ..request("cam-7", "viewer")
            },
        )
        .await
        .unwrap();
    let session = live_session(&capture, &sid).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.wait()).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::Timeout));

    let rec = store.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Failed);
    assert_eq!(rec.failure_reason, Some(FailureReason::Timeout));
    assert!(rec.ended_at_ms.is_some());

    assert!(device.current_video().is_none());
    assert!(device.current_audio().is_none());
    assert!(tf.last().is_closed());
    eventually("slot released", || capture.session(&sid).is_none()).await;

    let snap = capture.metrics();
    assert_eq!(snap.sessions_failed, 1);
    assert_eq!(snap.live_sessions, 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (_dir, store) = temp_store();
    let tf = FakeTransportFactory::new("viewer", false);
    let viewer = viewer(fast_settings(), store.clone(), tf.clone());

    let ticket = viewer.start(Role::Viewer, request("cam-8", "alice")).await.unwrap();
    let sid = ticket.session_id;
    let first = viewer.stop(&sid).await.unwrap();
    match first {
        StopResult::Stopped(o) => {
            assert_eq!(o.status, SessionStatus::Ended);
            assert_eq!(o.reason, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    eventually("slot released", || viewer.session(&sid).is_none()).await;

    let second = viewer.stop(&sid).await.unwrap();
    assert_eq!(second, StopResult::AlreadySettled(SessionStatus::Ended));
    let closes = tf.last().calls().iter().filter(|c| **c == Call::Close).count();
    assert_eq!(closes, 1);
    assert_eq!(viewer.metrics().sessions_ended, 1);

    assert_eq!(viewer.stop("no-such-session").await.unwrap(), StopResult::Unknown);
}

#[tokio::test]
async fn stopping_a_session_owned_elsewhere_marks_it_ended() {
    let (_dir, store) = temp_store();
    let sid = pending_session(store.as_ref(), "cam-9").await;
    let viewer = viewer(fast_settings(), store.clone(), FakeTransportFactory::new("viewer", false));

    match viewer.stop(&sid).await.unwrap() {
        StopResult::Marked(rec) => assert_eq!(rec.status, SessionStatus::Ended),
        other => panic!("expected Marked, got {other:?}"),
    }
    let rec = store.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Ended);
}

#[tokio::test]
async fn cancel_before_connect_ends_as_cancelled() {
    let (_dir, store) = temp_store();
    let tf = FakeTransportFactory::new("viewer", false);
    let viewer = viewer(fast_settings(), store.clone(), tf.clone());

    let ticket = viewer.start(Role::Viewer, request("cam-10", "alice")).await.unwrap();
    let session = live_session(&viewer, &ticket.session_id).await;
    wait_for_state(&session, PeerState::Connecting).await;
    assert!(viewer.cancel("cam-10").await);

    let outcome = session.wait().await;
    assert_eq!(outcome.status, SessionStatus::Ended);
    assert_eq!(outcome.reason, Some(FailureReason::Cancelled));
    assert!(tf.last().is_closed());

    eventually("slot released", || viewer.session(&ticket.session_id).is_none()).await;
    assert!(!viewer.cancel("cam-10").await);
}

#[tokio::test]
async fn cancel_acknowledged_mid_start_always_cancels() {
    let (_dir, sqlite) = temp_store();
    let store = RefusingStore::slow_create(sqlite.clone(), Duration::from_millis(300));
    let tf = FakeTransportFactory::new("viewer", false);
    let viewer = viewer(fast_settings(), store, tf.clone());

    let start = {
        let viewer = viewer.clone();
        tokio::spawn(async move { viewer.start(Role::Viewer, request("cam-10b", "alice")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(viewer.cancel("cam-10b").await);

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, StartError::Cancelled), "{err}");
    assert!(tf.created().is_empty());
    assert_eq!(all_rows(sqlite.db_path(), "cam-10b"), 1);
    assert_eq!(open_rows(sqlite.db_path(), "cam-10b"), 0);
    assert!(!viewer.cancel("cam-10b").await);
}

#[tokio::test]
async fn next_start_waits_out_the_session_gap() {
    let (_dir, store) = temp_store();
    let mut settings = fast_settings();
    settings.min_session_gap = Duration::from_millis(300);
    let tf = FakeTransportFactory::new("viewer", false);
    let viewer = viewer(settings, store.clone(), tf.clone());

    let t1 = viewer.start(Role::Viewer, request("cam-11", "alice")).await.unwrap();
    viewer.stop(&t1.session_id).await.unwrap();
    eventually("slot released", || viewer.session(&t1.session_id).is_none()).await;

    let began = Instant::now();
    let t2 = viewer.start(Role::Viewer, request("cam-11", "alice")).await.unwrap();
    assert!(began.elapsed() >= Duration::from_millis(250), "{:?}", began.elapsed());
    assert_ne!(t1.session_id, t2.session_id);
    assert!(!t2.reused);

    viewer.stop(&t2.session_id).await.unwrap();
}

#[tokio::test]
async fn hardware_check_reports_without_capturing() {
    let (_dir, store) = temp_store();
    let device = Arc::new(SampleFeedDevice::new(true, false));
    let capture = capture(fast_settings(), store, FakeTransportFactory::new("capture", false), device.clone());

    let report = capture.hardware_check().await;
    assert!(report.video_present);
    assert!(!report.audio_present);
    assert!(device.current_video().is_none());
}

#[tokio::test]
async fn expired_session_ends_with_expired_reason() {
    let (_dir, store) = temp_store();
    let viewer = viewer(fast_settings(), store.clone(), FakeTransportFactory::new("viewer", false));

    let ticket = viewer
        .start(
            Role::Viewer,
            StartSessionRequest {
                ttl_secs: Some(1),
                ..request("cam-12", "alice")
            },
        )
        .await
        .unwrap();
    // One second of ttl runs out before the three second connect timeout.
    let session = live_session(&viewer, &ticket.session_id).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.wait()).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Ended);
    assert_eq!(outcome.reason, Some(FailureReason::Expired));
}
