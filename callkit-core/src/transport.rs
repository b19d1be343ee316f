//! Peer connection seam
//!
//! The mesh manager drives one [`PeerLink`] per remote member. Links are
//! created by a [`PeerTransport`] backend (the `webrtc` crate in production,
//! an in-memory network in tests). Backend callbacks are delivered as
//! [`TransportEvent`]s on the per-call channel the controller drains.

use crate::identity::MemberId;
use crate::relay::RelayEvent;
use crate::track::{LocalTrack, RemoteTrack};
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// SDP or ICE negotiation step failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// No connection to this member
    #[error("Unknown peer: {0}")]
    UnknownPeer(MemberId),

    /// Manager or link already closed
    #[error("Transport closed")]
    Closed,

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Identifies an outbound media sender on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Connection state reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, nothing negotiated
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connection failed
    Failed,
    /// Link closed
    Closed,
}

impl PeerState {
    /// Whether the member behind this link should be considered gone
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Callback from a link backend
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// A remote track ended
    RemoteTrackEnded {
        /// Identifier of the ended track
        track_id: String,
    },
    /// Connection state changed
    StateChanged(PeerState),
}

/// Everything the per-call event pump consumes
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Callback from a mesh peer link
    Peer {
        /// Member the link leads to
        member_id: MemberId,
        /// The callback
        event: PeerEvent,
    },
    /// Callback from the relay session
    Relay(RelayEvent),
}

/// Sending half of the per-call transport event channel
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Where a link backend reports its callbacks
///
/// Tags every event with the member the link belongs to. Sending never
/// blocks, so backends may emit from synchronous callbacks.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    member_id: MemberId,
    sender: TransportEventSender,
}

impl PeerEventSink {
    /// Create a sink for the link to `member_id`
    pub fn new(member_id: MemberId, sender: TransportEventSender) -> Self {
        Self { member_id, sender }
    }

    /// Member this sink reports for
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// Report an event. Returns `false` once the call stopped listening.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.sender
            .send(TransportEvent::Peer {
                member_id: self.member_id.clone(),
                event,
            })
            .is_ok()
    }
}

/// Factory of peer links
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a link to `member_id` reporting callbacks to `events`
    async fn create_peer(
        &self,
        member_id: &MemberId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

/// A single peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description; starts candidate gathering
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Apply a remote ICE candidate. Requires the remote description.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Add an outbound sender for `track`
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError>;

    /// Swap the track of an existing sender; `None` sends nothing
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), TransportError>;

    /// Close the link
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    #[test]
    fn test_lost_states() {
        assert!(!PeerState::Connecting.is_lost());
        assert!(!PeerState::Connected.is_lost());
        assert!(PeerState::Disconnected.is_lost());
        assert!(PeerState::Failed.is_lost());
        assert!(PeerState::Closed.is_lost());
    }

    #[test]
    fn test_sink_tags_member() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(MemberId::new("bob"), tx);

        assert!(sink.emit(PeerEvent::RemoteTrack(RemoteTrack::new("t1", MediaKind::Audio))));
        let received = rx.try_recv().unwrap();
        assert!(matches!(
            received,
            TransportEvent::Peer { ref member_id, event: PeerEvent::RemoteTrack(_) }
                if *member_id == MemberId::new("bob")
        ));

        drop(rx);
        assert!(!sink.emit(PeerEvent::StateChanged(PeerState::Closed)));
    }
}
