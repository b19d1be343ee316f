//! Call types and data structures

use crate::identity::{ChatId, MemberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options fixed when a call is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallOptions {
    /// Send camera video in addition to audio
    pub is_video_call: bool,
    /// Call is placed in a group conversation
    pub is_group_call: bool,
}

impl CallOptions {
    /// Direct audio-only call
    pub fn audio_call() -> Self {
        Self {
            is_video_call: false,
            is_group_call: false,
        }
    }

    /// Direct call with audio and video
    pub fn video_call() -> Self {
        Self {
            is_video_call: true,
            is_group_call: false,
        }
    }

    /// Group call, optionally with video
    pub fn group_call(is_video_call: bool) -> Self {
        Self {
            is_video_call,
            is_group_call: true,
        }
    }

    /// Transport topology used for these options
    pub fn topology(&self) -> Topology {
        Topology::for_call(self.is_group_call)
    }
}

/// Transport topology of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// Direct peer connection to every other participant
    Mesh,
    /// Single connection to a selective forwarding unit
    Relay,
}

impl Topology {
    /// Group calls go through the relay, everything else is meshed
    pub fn for_call(is_group_call: bool) -> Self {
        if is_group_call {
            Self::Relay
        } else {
            Self::Mesh
        }
    }
}

/// Kind of media a track carries
///
/// This is also the declared source of a track: camera video and screen
/// capture are distinct kinds, never inferred from track labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
    /// Screen capture
    ScreenShare,
}

impl MediaKind {
    /// All kinds, in attach order
    pub const ALL: [MediaKind; 3] = [MediaKind::Audio, MediaKind::Video, MediaKind::ScreenShare];

    /// Stream id tag used to carry the source across a peer connection
    pub fn stream_tag(&self) -> &'static str {
        match self {
            Self::Audio => "callkit-audio",
            Self::Video => "callkit-camera",
            Self::ScreenShare => "callkit-screen",
        }
    }

    /// Parse a stream id tag produced by [`MediaKind::stream_tag`]
    pub fn from_stream_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.stream_tag() == tag)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ScreenShare => "screen",
        };
        f.write_str(name)
    }
}

/// Which side of the call this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We placed the call
    Outgoing,
    /// We are being called
    Incoming,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Placed and ringing, or ringing on the callee side
    Outgoing,
    /// Answered, media is being negotiated
    Connecting,
    /// Remote media or a remote participant arrived
    Connected,
    /// Hung up after (or while) being connected
    Ended,
    /// Caller gave up before an answer
    Canceled,
    /// Callee declined
    Rejected,
    /// Setup or negotiation failed
    Failed,
    /// Callee never answered
    Missed,
}

impl CallState {
    /// Terminal states admit no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Canceled | Self::Rejected | Self::Failed | Self::Missed
        )
    }
}

/// Why a call is being ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// User hung up
    Hangup,
    /// Caller withdrew the call
    Canceled,
    /// Call was declined
    Rejected,
    /// Nobody answered within the answer window
    Timeout,
    /// Caller withdrew before we answered
    Missed,
    /// Local setup, negotiation or transport failed
    Failed,
}

impl EndReason {
    /// Terminal state this reason produces on the given side of the call
    pub fn terminal_state(&self, direction: CallDirection) -> CallState {
        match (self, direction) {
            (Self::Hangup, _) => CallState::Ended,
            (Self::Canceled, _) => CallState::Canceled,
            (Self::Rejected, _) => CallState::Rejected,
            (Self::Timeout, CallDirection::Outgoing) => CallState::Canceled,
            (Self::Timeout, CallDirection::Incoming) | (Self::Missed, _) => CallState::Missed,
            (Self::Failed, _) => CallState::Failed,
        }
    }
}

/// Local outgoing media flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalDeviceState {
    /// Microphone is not sending
    pub is_muted: bool,
    /// Camera is sending
    pub is_video_enabled: bool,
    /// Screen capture is sending
    pub is_screen_sharing: bool,
}

impl LocalDeviceState {
    /// Whether media of this kind is being sent
    pub fn is_sending(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => !self.is_muted,
            MediaKind::Video => self.is_video_enabled,
            MediaKind::ScreenShare => self.is_screen_sharing,
        }
    }
}

/// ICE candidate exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media-line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// Session description document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// The single active (or terminating) call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Conversation the call belongs to
    pub chat_id: ChatId,
    /// Transport topology
    pub topology: Topology,
    /// Video call flag, fixed at creation
    pub is_video_call: bool,
    /// Group call flag, fixed at creation
    pub is_group_call: bool,
    /// Which side of the call we are on
    pub direction: CallDirection,
    /// The other party: callee on outgoing direct calls, caller on incoming calls
    pub remote_party: Option<MemberId>,
    /// Current lifecycle state
    pub state: CallState,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// When the call reached `Connected`
    pub connected_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Local outgoing media flags
    pub local: LocalDeviceState,
}

impl CallSession {
    /// Create a new call session in the `Outgoing` state
    pub fn new(
        call_id: CallId,
        chat_id: ChatId,
        options: CallOptions,
        direction: CallDirection,
    ) -> Self {
        Self {
            call_id,
            chat_id,
            topology: options.topology(),
            is_video_call: options.is_video_call,
            is_group_call: options.is_group_call,
            direction,
            remote_party: None,
            state: CallState::Outgoing,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            local: LocalDeviceState {
                is_muted: true,
                is_video_enabled: false,
                is_screen_sharing: false,
            },
        }
    }

    /// Options the call was created with
    pub fn options(&self) -> CallOptions {
        CallOptions {
            is_video_call: self.is_video_call,
            is_group_call: self.is_group_call,
        }
    }

    /// Talk time: from connection to end (or now, while connected)
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }

    /// Whether the call reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
