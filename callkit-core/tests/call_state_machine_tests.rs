//! Call lifecycle tests
//!
//! Participants run full controllers on one loopback network; every
//! transition below is driven by real signaling and transport callbacks.

mod common;

use callkit_core::loopback::RecordOp;
use callkit_core::prelude::*;
use callkit_core::{CallStatus, MediaError, SignalingEvent};
use common::{connect_direct, eventually, TestNet};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn direct_call_reaches_connected_and_ends() {
    let net = TestNet::new();
    let mut alice = net.join("alice");
    let bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert_eq!(alice.state(), Some(CallState::Outgoing));
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    let ringing = bob.controller.session().unwrap();
    assert_eq!(ringing.direction, CallDirection::Incoming);
    assert_eq!(ringing.remote_party, Some(alice.id.clone()));

    bob.controller.accept_call().await.unwrap();
    assert!(eventually(|| alice.state() == Some(CallState::Connected)).await);
    assert!(eventually(|| bob.state() == Some(CallState::Connected)).await);

    assert_eq!(alice.member_ids(), vec![bob.id.clone()]);
    let bob_seen_by_alice = alice.controller.members().remove(0);
    assert!(bob_seen_by_alice.voice_track.is_some());
    assert!(alice.controller.session().unwrap().connected_at.is_some());

    bob.controller.end_call(EndReason::Hangup).await.unwrap();
    assert_eq!(bob.state(), Some(CallState::Ended));
    assert!(eventually(|| alice.state() == Some(CallState::Ended)).await);

    let transitions: Vec<(CallState, CallState)> = alice
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => Some((old_state, new_state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CallState::Outgoing, CallState::Connecting),
            (CallState::Connecting, CallState::Connected),
            (CallState::Connected, CallState::Ended),
        ]
    );
    assert!(eventually(|| alice.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Ended)]).await);
    assert!(eventually(|| bob.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Ended)]).await);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_is_withdrawn_after_answer_timeout() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(alice.state(), Some(CallState::Outgoing));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(eventually(|| alice.state() == Some(CallState::Canceled)).await);
    assert!(eventually(|| bob.state() == Some(CallState::Missed)).await);

    let withdrawn = net.hub.sent_by(&alice.id).into_iter().any(|event| {
        matches!(event, SignalingEvent::Reject(ref r) if r.call_id == call_id && r.is_caller_cancel)
    });
    assert!(withdrawn);

    assert!(eventually(|| alice.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Missed)]).await);
    assert_eq!(alice.devices.live_tracks(), 0);
    assert!(!alice.controller.is_busy());
}

#[tokio::test]
async fn callee_decline_ends_both_sides_as_rejected() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::video_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    bob.controller.reject_call(false).await.unwrap();
    assert_eq!(bob.state(), Some(CallState::Rejected));
    assert!(eventually(|| alice.state() == Some(CallState::Rejected)).await);

    assert!(eventually(|| alice.record_ops() == vec![RecordOp::MarkDeclined(call_id)]).await);
    assert_eq!(alice.devices.live_tracks(), 0);
    assert_eq!(bob.devices.live_tracks(), 0);
}

#[tokio::test]
async fn caller_cancel_leaves_callee_with_missed_call() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    alice.controller.reject_call(true).await.unwrap();
    assert_eq!(alice.state(), Some(CallState::Canceled));
    assert!(eventually(|| bob.state() == Some(CallState::Missed)).await);
    assert!(eventually(|| alice.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Canceled)]).await);
    assert!(eventually(|| bob.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Missed)]).await);
}

#[tokio::test]
async fn permission_denied_on_accept_fails_call_and_declines() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    bob.devices.deny(MediaKind::Audio);

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    let err = bob.controller.accept_call().await.unwrap_err();
    assert_eq!(err, CallError::PermissionDenied(MediaKind::Audio));
    assert_eq!(err.failure_kind(), Some(FailureKind::PermissionDenied));
    assert_eq!(bob.state(), Some(CallState::Failed));
    assert!(eventually(|| bob.record_ops() == vec![RecordOp::MarkFailed(call_id)]).await);

    assert!(eventually(|| alice.state() == Some(CallState::Rejected)).await);
    assert_eq!(alice.devices.live_tracks(), 0);
}

#[tokio::test]
async fn unavailable_device_fails_start_before_ringing() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    for _ in 0..2 {
        alice
            .devices
            .fail_next(MediaKind::Audio, MediaError::unavailable(MediaKind::Audio, "in use"));
    }

    let err = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), Some(FailureKind::DeviceUnavailable));
    assert_eq!(alice.state(), Some(CallState::Failed));
    assert_eq!(alice.devices.acquisitions(MediaKind::Audio), 2);

    let call_id = alice.call_id();
    assert!(eventually(|| alice.record_ops() == vec![RecordOp::MarkFailed(call_id)]).await);
    assert!(net
        .hub
        .sent_by(&alice.id)
        .iter()
        .all(|event| !matches!(event, SignalingEvent::Initiate(_))));
    assert!(bob.controller.session().is_none());
}

#[tokio::test]
async fn relaxed_retry_recovers_unavailable_device() {
    let net = TestNet::new();
    let alice = net.join("alice");
    alice
        .devices
        .fail_next(MediaKind::Audio, MediaError::unavailable(MediaKind::Audio, "overconstrained"));

    alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert_eq!(alice.state(), Some(CallState::Outgoing));
    assert!(!alice.controller.local_device_state().is_muted);
}

#[tokio::test]
async fn concurrent_end_call_tears_down_once() {
    let net = TestNet::new();
    let mut alice = net.join("alice");
    let bob = net.join("bob");
    let call_id = connect_direct(&alice, &bob, CallOptions::video_call()).await;
    alice.drain_events();

    let results = futures::future::join_all(
        (0..8).map(|_| alice.controller.end_call(EndReason::Hangup)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(alice.state(), Some(CallState::Ended));

    let ended = alice
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, CallEvent::CallEnded { .. }))
        .count();
    assert_eq!(ended, 1);
    assert!(eventually(|| alice.record_ops() == vec![RecordOp::Update(call_id, CallStatus::Ended)]).await);
}

#[tokio::test]
async fn no_orphaned_tracks_after_end() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    connect_direct(&alice, &bob, CallOptions::video_call()).await;

    alice.controller.toggle_screen_share().await.unwrap();
    bob.controller.toggle_screen_share().await.unwrap();
    assert!(alice.controller.media().indicator_active());

    alice.controller.end_call(EndReason::Hangup).await.unwrap();
    assert!(eventually(|| bob.state() == Some(CallState::Ended)).await);

    for participant in [&alice, &bob] {
        assert_eq!(participant.devices.live_tracks(), 0);
        assert!(!participant.controller.media().indicator_active());
        assert!(participant.controller.members().is_empty());
        assert!(!participant.controller.is_busy());
    }
    assert_eq!(net.network.open_links(), 0);
}

#[tokio::test]
async fn link_failure_after_connect_ends_call() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    connect_direct(&alice, &bob, CallOptions::audio_call()).await;

    assert!(net.network.fail_link(&alice.id, &bob.id));
    assert!(eventually(|| alice.state() == Some(CallState::Ended)).await);
    assert!(eventually(|| bob.state() == Some(CallState::Ended)).await);
}

#[tokio::test]
async fn negotiation_failure_before_connect_fails_call() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    net.network.refuse_peers(&alice.id, true);

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);
    bob.controller.accept_call().await.unwrap();

    assert!(eventually(|| alice.state() == Some(CallState::Failed)).await);
    assert!(eventually(|| alice.record_ops() == vec![RecordOp::MarkFailed(call_id)]).await);
    assert!(eventually(|| bob.state() == Some(CallState::Failed)).await);
    assert_eq!(bob.devices.live_tracks(), 0);
}

#[tokio::test]
async fn new_call_allowed_after_previous_one_ends() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    let first = connect_direct(&alice, &bob, CallOptions::audio_call()).await;

    alice.controller.end_call(EndReason::Hangup).await.unwrap();
    assert!(eventually(|| !bob.controller.is_busy()).await);

    let second = connect_direct(&bob, &alice, CallOptions::audio_call()).await;
    assert_ne!(first, second);
    assert_eq!(bob.controller.session().unwrap().direction, CallDirection::Outgoing);
}
