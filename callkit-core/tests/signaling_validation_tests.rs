//! Signaling validation and edge case tests

mod common;

use callkit_core::prelude::*;
use callkit_core::signaling::{CallInitiate, CallResponse, MemberUpdatePayload, SessionPayload};
use common::{connect_direct, eventually, TestNet};
use pretty_assertions::assert_eq;

fn response(call_id: CallId, chat_id: &ChatId, is_caller_cancel: bool) -> CallResponse {
    CallResponse {
        call_id,
        chat_id: chat_id.clone(),
        is_caller_cancel,
    }
}

#[tokio::test]
async fn signal_for_unknown_call_is_ignored() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    let stranger = CallId::new();
    alice
        .controller
        .handle_signal(bob.id.clone(), SignalingEvent::Accept(response(stranger, &net.chat, false)))
        .await
        .unwrap();
    alice
        .controller
        .handle_signal(bob.id.clone(), SignalingEvent::Reject(response(stranger, &net.chat, false)))
        .await
        .unwrap();
    alice
        .controller
        .handle_signal(
            bob.id.clone(),
            SignalingEvent::Offer(SessionPayload {
                call_id: stranger,
                chat_id: net.chat.clone(),
                sdp: "v=0".to_string(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(alice.state(), Some(CallState::Outgoing));
    assert_eq!(alice.call_id(), call_id);
}

#[tokio::test]
async fn own_echo_is_ignored() {
    let net = TestNet::new();
    let alice = net.join("alice");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();

    alice
        .controller
        .handle_signal(alice.id.clone(), SignalingEvent::Reject(response(call_id, &net.chat, false)))
        .await
        .unwrap();
    alice
        .controller
        .handle_signal(alice.id.clone(), SignalingEvent::Accept(response(call_id, &net.chat, false)))
        .await
        .unwrap();

    assert_eq!(alice.state(), Some(CallState::Outgoing));
}

#[tokio::test]
async fn duplicate_initiate_rings_once() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let mut bob = net.join("bob");

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::video_call())
        .await
        .unwrap();
    assert!(eventually(|| bob.controller.call_id() == Some(call_id)).await);

    let initiate = SignalingEvent::Initiate(CallInitiate {
        call_id,
        chat_id: net.chat.clone(),
        is_video_call: true,
        is_group_call: false,
    });
    bob.controller
        .handle_signal(alice.id.clone(), initiate)
        .await
        .unwrap();

    let incoming = bob
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, CallEvent::IncomingCall { .. }))
        .count();
    assert_eq!(incoming, 1);
    assert_eq!(bob.state(), Some(CallState::Outgoing));
    assert!(net
        .hub
        .sent_by(&bob.id)
        .iter()
        .all(|event| !matches!(event, SignalingEvent::Reject(_))));
}

#[tokio::test]
async fn busy_participant_declines_new_call() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");

    let other = ChatId::new("other");
    net.hub.join(&other, &bob.id);
    let own_call = bob
        .controller
        .start_call(other, CallOptions::audio_call())
        .await
        .unwrap();

    let call_id = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert!(eventually(|| alice.state() == Some(CallState::Rejected)).await);

    assert_eq!(bob.call_id(), own_call);
    assert_eq!(bob.state(), Some(CallState::Outgoing));
    let declined = net.hub.sent_by(&bob.id).into_iter().any(|event| {
        matches!(event, SignalingEvent::Reject(ref r) if r.call_id == call_id && !r.is_caller_cancel)
    });
    assert!(declined);
}

#[tokio::test]
async fn member_update_about_someone_else_is_ignored() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    let call_id = connect_direct(&alice, &bob, CallOptions::audio_call()).await;
    assert!(eventually(|| alice.controller.members().first().is_some_and(|m| !m.is_muted)).await);

    let forged = SignalingEvent::MemberUpdate(MemberUpdatePayload {
        call_id,
        member_id: bob.id.clone(),
        is_muted: Some(true),
        is_video_enabled: Some(true),
        is_screen_sharing: None,
    });
    alice
        .controller
        .handle_signal(MemberId::new("mallory"), forged)
        .await
        .unwrap();

    let seen = alice.controller.members().remove(0);
    assert!(!seen.is_muted);
    assert!(!seen.is_video_enabled);
}

#[tokio::test]
async fn member_update_from_the_member_is_applied() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    let call_id = connect_direct(&alice, &bob, CallOptions::audio_call()).await;
    assert!(eventually(|| alice.controller.members().first().is_some_and(|m| !m.is_muted)).await);

    let update = SignalingEvent::MemberUpdate(MemberUpdatePayload {
        call_id,
        member_id: bob.id.clone(),
        is_muted: None,
        is_video_enabled: None,
        is_screen_sharing: Some(true),
    });
    alice
        .controller
        .handle_signal(bob.id.clone(), update)
        .await
        .unwrap();

    let seen = alice.controller.members().remove(0);
    assert!(seen.is_screen_sharing);
    assert!(!seen.is_muted);
}

#[tokio::test]
async fn accept_without_ringing_call_is_refused() {
    let net = TestNet::new();
    let alice = net.join("alice");

    assert_eq!(
        alice.controller.accept_call().await.unwrap_err(),
        CallError::NoActiveCall
    );

    alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap();
    assert_eq!(
        alice.controller.accept_call().await.unwrap_err(),
        CallError::InvalidState(CallState::Outgoing)
    );
    assert_eq!(alice.state(), Some(CallState::Outgoing));
}

#[tokio::test]
async fn accept_from_another_callee_after_connect_is_ignored() {
    let net = TestNet::new();
    let alice = net.join("alice");
    let bob = net.join("bob");
    let call_id = connect_direct(&alice, &bob, CallOptions::audio_call()).await;

    alice
        .controller
        .handle_signal(
            MemberId::new("carol"),
            SignalingEvent::Accept(response(call_id, &net.chat, false)),
        )
        .await
        .unwrap();

    assert_eq!(alice.state(), Some(CallState::Connected));
    assert_eq!(alice.member_ids(), vec![bob.id.clone()]);
}

#[tokio::test]
async fn failed_signaling_send_fails_the_call() {
    let net = TestNet::new();
    let alice = net.join("alice");
    net.hub.fail_sends(&alice.id, true);

    let err = alice
        .controller
        .start_call(net.chat.clone(), CallOptions::audio_call())
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), Some(FailureKind::ConnectionFailed));
    assert_eq!(alice.state(), Some(CallState::Failed));
    assert_eq!(alice.devices.live_tracks(), 0);
}

#[test]
fn wire_names_and_json_shape() {
    let call_id = CallId::new();
    let chat_id = ChatId::new("chat-1");
    let events = [
        (
            SignalingEvent::Initiate(CallInitiate {
                call_id,
                chat_id: chat_id.clone(),
                is_video_call: true,
                is_group_call: false,
            }),
            "call.initiate",
        ),
        (SignalingEvent::Accept(response(call_id, &chat_id, false)), "call.accept"),
        (SignalingEvent::Reject(response(call_id, &chat_id, true)), "call.reject"),
        (
            SignalingEvent::MemberUpdate(MemberUpdatePayload {
                call_id,
                member_id: MemberId::new("bob"),
                is_muted: Some(true),
                is_video_enabled: None,
                is_screen_sharing: None,
            }),
            "call.member-update",
        ),
    ];

    for (event, name) in events {
        assert_eq!(event.event_type(), name);
        let json = event.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], name);
        assert_eq!(value["callId"], call_id.to_string());
        assert_eq!(SignalingEvent::from_json(&json).unwrap(), event);
    }

    let update = serde_json::json!({
        "type": "call.member-update",
        "callId": call_id.to_string(),
        "memberId": "bob",
        "isMuted": false
    });
    let parsed = SignalingEvent::from_json(&update.to_string()).unwrap();
    assert!(matches!(
        parsed,
        SignalingEvent::MemberUpdate(MemberUpdatePayload {
            is_muted: Some(false),
            is_video_enabled: None,
            ..
        })
    ));

    assert!(SignalingEvent::from_json(r#"{"type":"call.hangup"}"#).is_err());
}
