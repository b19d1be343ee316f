//! Call signaling protocol
//!
//! Defines the events exchanged between participants (call setup, SDP
//! exchange, ICE candidates and member state) and the narrow gateway contract
//! the core needs from whatever transport carries them.

use crate::identity::{ChatId, MemberId};
use crate::types::{CallId, IceCandidate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// Send was not acknowledged in time
    #[error("Signaling send timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Event could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Where a signaling event is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalTarget {
    /// Every participant of a conversation
    Chat(ChatId),
    /// A single participant
    Member(MemberId),
}

/// Payload of `call.initiate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiate {
    /// Call identifier chosen by the caller
    pub call_id: CallId,
    /// Conversation being called
    pub chat_id: ChatId,
    /// Video call flag
    pub is_video_call: bool,
    /// Group call flag
    pub is_group_call: bool,
}

/// Payload of `call.accept` and `call.reject`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    /// Call identifier
    pub call_id: CallId,
    /// Conversation of the call
    pub chat_id: ChatId,
    /// The caller withdrew the call (as opposed to the callee declining)
    pub is_caller_cancel: bool,
}

/// Payload of `call.offer` and `call.answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Call identifier
    pub call_id: CallId,
    /// Conversation of the call
    pub chat_id: ChatId,
    /// SDP text
    pub sdp: String,
}

/// Payload of `call.ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// Call identifier
    pub call_id: CallId,
    /// Conversation of the call
    pub chat_id: ChatId,
    /// The candidate
    pub candidate: IceCandidate,
}

/// Payload of `call.member-update`
///
/// Absent fields mean "unchanged"; `Some(false)` is an explicit clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberUpdatePayload {
    /// Call identifier
    pub call_id: CallId,
    /// Member whose state changed
    pub member_id: MemberId,
    /// Microphone muted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    /// Camera sending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video_enabled: Option<bool>,
    /// Screen capture sending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

/// Signaling events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEvent {
    /// Caller places a call
    #[serde(rename = "call.initiate")]
    Initiate(CallInitiate),

    /// Callee answered
    #[serde(rename = "call.accept")]
    Accept(CallResponse),

    /// Callee declined or caller withdrew
    #[serde(rename = "call.reject")]
    Reject(CallResponse),

    /// SDP offer (mesh)
    #[serde(rename = "call.offer")]
    Offer(SessionPayload),

    /// SDP answer (mesh)
    #[serde(rename = "call.answer")]
    Answer(SessionPayload),

    /// ICE candidate (mesh)
    #[serde(rename = "call.ice-candidate")]
    IceCandidate(CandidatePayload),

    /// Advertised media flags of a member changed
    #[serde(rename = "call.member-update")]
    MemberUpdate(MemberUpdatePayload),
}

impl SignalingEvent {
    /// The call this event belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Initiate(p) => p.call_id,
            Self::Accept(p) | Self::Reject(p) => p.call_id,
            Self::Offer(p) | Self::Answer(p) => p.call_id,
            Self::IceCandidate(p) => p.call_id,
            Self::MemberUpdate(p) => p.call_id,
        }
    }

    /// Wire name of the event
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Initiate(_) => "call.initiate",
            Self::Accept(_) => "call.accept",
            Self::Reject(_) => "call.reject",
            Self::Offer(_) => "call.offer",
            Self::Answer(_) => "call.answer",
            Self::IceCandidate(_) => "call.ice-candidate",
            Self::MemberUpdate(_) => "call.member-update",
        }
    }

    /// Whether this event is part of mesh SDP/ICE negotiation
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Offer(_) | Self::Answer(_) | Self::IceCandidate(_)
        )
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the document is not a known event
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Codec(e.to_string()))
    }
}

/// Signaling gateway trait
///
/// Implement this for the transport that carries call signaling (websocket,
/// message bus, ...). Inbound events are handed to
/// [`CallSessionController::handle_signal`](crate::call::CallSessionController::handle_signal)
/// together with the sending member.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Send an event and wait for the transport to accept it
    async fn send(&self, target: SignalTarget, event: SignalingEvent)
        -> Result<(), SignalingError>;
}

/// Inbound signaling of one participant: `(sender, event)`
pub type SignalInbox = mpsc::UnboundedReceiver<(MemberId, SignalingEvent)>;

/// Signaling handler with a bounded send time
#[derive(Clone)]
pub struct SignalingHandler {
    gateway: Arc<dyn SignalingGateway>,
    send_timeout: Duration,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(gateway: Arc<dyn SignalingGateway>, send_timeout: Duration) -> Self {
        Self {
            gateway,
            send_timeout,
        }
    }

    /// Send a signaling event
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Timeout`] if the gateway does not accept the
    /// event in time, or the gateway's own error
    #[tracing::instrument(skip_all, fields(to = ?target, event_type = event.event_type()))]
    pub async fn send(
        &self,
        target: SignalTarget,
        event: SignalingEvent,
    ) -> Result<(), SignalingError> {
        tracing::trace!("Sending signaling event");
        match tokio::time::timeout(self.send_timeout, self.gateway.send(target, event)).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    tracing::warn!(error = %e, "Signaling send failed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.send_timeout.as_millis(), "Signaling send timed out");
                Err(SignalingError::Timeout(self.send_timeout))
            }
        }
    }

    /// Get access to the underlying gateway
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn SignalingGateway> {
        &self.gateway
    }
}
