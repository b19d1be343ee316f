//! Call record service contract
//!
//! The record service stores call metadata (status, timestamps) remotely. The
//! core calls it fire-and-forget: failures are logged by the caller and never
//! hold up local teardown.

use crate::identity::ChatId;
use crate::types::{CallId, CallState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final status stored on a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Call took place and was hung up
    Ended,
    /// Nobody answered
    Missed,
    /// Caller withdrew
    Canceled,
    /// Callee declined
    Declined,
    /// Call could not be set up
    Failed,
}

/// Partial update of a call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecordUpdate {
    /// New status
    pub status: CallStatus,
    /// When the call ended
    pub ended_at: DateTime<Utc>,
}

/// Record operation the controller performs for a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// `mark_failed`
    MarkFailed,
    /// `mark_declined`
    MarkDeclined,
    /// `update` with the given status
    Update(CallStatus),
}

impl RecordAction {
    /// Pick the record operation for a terminal state
    ///
    /// `timed_out` distinguishes an unanswered call the caller's timer
    /// withdrew (recorded as missed) from an explicit cancel.
    pub fn for_terminal(state: CallState, timed_out: bool) -> Option<Self> {
        match state {
            CallState::Failed => Some(Self::MarkFailed),
            CallState::Rejected => Some(Self::MarkDeclined),
            CallState::Canceled if timed_out => Some(Self::Update(CallStatus::Missed)),
            CallState::Canceled => Some(Self::Update(CallStatus::Canceled)),
            CallState::Missed => Some(Self::Update(CallStatus::Missed)),
            CallState::Ended => Some(Self::Update(CallStatus::Ended)),
            CallState::Outgoing | CallState::Connecting | CallState::Connected => None,
        }
    }
}

/// Remote call record service
#[async_trait]
pub trait CallRecordService: Send + Sync {
    /// Mark a call as failed
    async fn mark_failed(&self, call_id: CallId) -> anyhow::Result<()>;

    /// Mark a call as declined by the callee
    async fn mark_declined(&self, call_id: CallId) -> anyhow::Result<()>;

    /// Update the status and end time of a call
    async fn update(&self, call_id: CallId, update: CallRecordUpdate) -> anyhow::Result<()>;

    /// Issue a relay room token for a group call
    async fn room_token(&self, call_id: CallId, chat_id: &ChatId) -> anyhow::Result<String>;
}
