//! Relay topology: one connection to a selective forwarding unit
//!
//! Group calls join a relay room through a [`RelayConnector`]. The relay SDK
//! reports participants and subscribed tracks as [`RelayEvent`]s; every track
//! event carries the source the publisher declared, so camera and screen
//! capture are told apart without looking at track labels.

use crate::identity::MemberId;
use crate::media::{MediaError, TrackPublisher};
use crate::registry::{CallMemberRegistry, ConnectionRef, MemberInfo, MemberUpdate, ParticipantHandle};
use crate::track::{LocalTrack, RemoteTrack};
use crate::transport::{TransportEvent, TransportEventSender};
use crate::types::{CallId, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Could not join the room
    #[error("Relay connect failed: {0}")]
    Connect(String),

    /// Publishing or unpublishing a track failed
    #[error("Relay publish failed: {0}")]
    Publish(String),

    /// Session already disconnected
    #[error("Relay session closed")]
    Closed,
}

/// What to publish when joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConnectOptions {
    /// Publish microphone
    pub audio: bool,
    /// Publish camera
    pub video: bool,
}

/// A participant as advertised by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayParticipant {
    /// Participant identity
    pub identity: MemberId,
    /// Display name
    pub name: Option<String>,
    /// Avatar reference from participant metadata
    pub avatar: Option<String>,
    /// Has a published microphone track
    pub audio_published: bool,
    /// Has a published camera track
    pub video_published: bool,
    /// Has a published screen capture track
    pub screen_published: bool,
}

impl RelayParticipant {
    /// Participant with nothing published
    pub fn new(identity: MemberId) -> Self {
        Self {
            identity,
            name: None,
            avatar: None,
            audio_published: false,
            video_published: false,
            screen_published: false,
        }
    }

    fn info(&self) -> MemberInfo {
        let mut info = MemberInfo::new(self.identity.clone());
        if let Some(name) = &self.name {
            info = info.with_display_name(name.clone());
        }
        if let Some(avatar) = &self.avatar {
            info = info.with_avatar(avatar.clone());
        }
        info
    }

    fn flags(&self) -> MemberUpdate {
        MemberUpdate {
            is_muted: Some(!self.audio_published),
            is_video_enabled: Some(self.video_published),
            is_screen_sharing: Some(self.screen_published),
        }
    }
}

/// Connection state of the relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayConnectionState {
    /// Joining
    Connecting,
    /// Joined
    Connected,
    /// Temporarily lost, the SDK is retrying
    Reconnecting,
    /// Left or kicked
    Disconnected,
    /// Could not be (re)established
    Failed,
}

/// Callback from the relay SDK
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A participant joined (including the local one, echoed back)
    ParticipantConnected(RelayParticipant),
    /// A participant left
    ParticipantDisconnected(MemberId),
    /// A remote track was subscribed
    TrackSubscribed {
        /// The track
        track: RemoteTrack,
        /// Declared source
        source: MediaKind,
        /// Publisher
        participant: MemberId,
    },
    /// A remote track was unsubscribed
    TrackUnsubscribed {
        /// Track identifier
        track_id: String,
        /// Declared source
        source: MediaKind,
        /// Publisher
        participant: MemberId,
    },
    /// Session connection state changed
    ConnectionStateChanged(RelayConnectionState),
}

/// Where a relay backend reports its callbacks
#[derive(Debug, Clone)]
pub struct RelayEventSink {
    sender: TransportEventSender,
}

impl RelayEventSink {
    /// Wrap the per-call event channel
    pub fn new(sender: TransportEventSender) -> Self {
        Self { sender }
    }

    /// Report an event. Returns `false` once the call stopped listening.
    pub fn emit(&self, event: RelayEvent) -> bool {
        self.sender.send(TransportEvent::Relay(event)).is_ok()
    }
}

/// Relay SDK entry point
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Join the room identified by `token`
    async fn connect(
        &self,
        token: &str,
        options: RelayConnectOptions,
        events: RelayEventSink,
    ) -> Result<Arc<dyn RelayRoom>, RelayError>;
}

/// A joined relay room
#[async_trait]
pub trait RelayRoom: Send + Sync {
    /// Identity the relay assigned to us
    fn local_participant(&self) -> MemberId;

    /// Publish `track` under source `kind`
    async fn publish(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), RelayError>;

    /// Stop publishing source `kind`
    async fn unpublish(&self, kind: MediaKind) -> Result<(), RelayError>;

    /// Leave the room
    async fn disconnect(&self) -> Result<(), RelayError>;
}

/// What applying a relay event changed, for the controller to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Self echo, stale or no-op event
    Ignored,
    /// A remote participant joined
    MemberJoined(MemberId),
    /// A remote participant left
    MemberLeft {
        /// Who left
        member_id: MemberId,
        /// Members still present
        remaining: usize,
    },
    /// A remote track was added or removed
    TrackChanged(MemberId),
    /// Session is connected
    Connected,
    /// Session ended from the relay side
    Lost(RelayConnectionState),
}

/// Manages the relay session of a group call
pub struct RelaySessionManager {
    call_id: CallId,
    local_identity: MemberId,
    options: RelayConnectOptions,
    connector: Arc<dyn RelayConnector>,
    registry: Arc<CallMemberRegistry>,
    events: TransportEventSender,
    room: Mutex<Option<Arc<dyn RelayRoom>>>,
    disconnected: AtomicBool,
}

impl RelaySessionManager {
    /// Create a manager for one call
    pub fn new(
        call_id: CallId,
        local_identity: MemberId,
        is_video_call: bool,
        connector: Arc<dyn RelayConnector>,
        registry: Arc<CallMemberRegistry>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            call_id,
            local_identity,
            options: RelayConnectOptions {
                audio: true,
                video: is_video_call,
            },
            connector,
            registry,
            events,
            room: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Call this manager belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Whether [`RelaySessionManager::disconnect`] ran
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Our identity in the room
    pub fn local_identity(&self) -> &MemberId {
        &self.local_identity
    }

    /// Join the room
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connect`], or [`RelayError::Closed`] if the
    /// session was disconnected before or during the attempt
    #[tracing::instrument(skip(self, token), fields(call_id = %self.call_id))]
    pub async fn connect(&self, token: &str) -> Result<(), RelayError> {
        if self.is_disconnected() {
            return Err(RelayError::Closed);
        }
        if self.room.lock().is_some() {
            return Ok(());
        }

        let sink = RelayEventSink::new(self.events.clone());
        let room = self.connector.connect(token, self.options, sink).await?;

        if self.is_disconnected() {
            tracing::debug!("Relay session closed while connecting, leaving room");
            if let Err(e) = room.disconnect().await {
                tracing::warn!(error = %e, "Error leaving relay room");
            }
            return Err(RelayError::Closed);
        }
        tracing::info!(local = %room.local_participant(), "Joined relay room");
        *self.room.lock() = Some(room);
        Ok(())
    }

    fn room(&self) -> Result<Arc<dyn RelayRoom>, RelayError> {
        if self.is_disconnected() {
            return Err(RelayError::Closed);
        }
        self.room.lock().clone().ok_or(RelayError::Closed)
    }

    fn is_local(&self, identity: &MemberId) -> bool {
        *identity == self.local_identity
            || self
                .room
                .lock()
                .as_ref()
                .is_some_and(|room| room.local_participant() == *identity)
    }

    /// Apply one relay callback to the registry
    pub fn apply_event(&self, event: RelayEvent) -> RelayOutcome {
        if self.is_disconnected() {
            if let RelayEvent::TrackSubscribed { track, .. } = event {
                track.stop();
            }
            return RelayOutcome::Ignored;
        }
        match event {
            RelayEvent::ParticipantConnected(participant) => self.on_participant_connected(participant),
            RelayEvent::ParticipantDisconnected(identity) => self.on_participant_disconnected(&identity),
            RelayEvent::TrackSubscribed {
                track,
                source,
                participant,
            } => self.on_track_subscribed(track, source, &participant),
            RelayEvent::TrackUnsubscribed {
                track_id,
                source,
                participant,
            } => self.on_track_unsubscribed(&track_id, source, &participant),
            RelayEvent::ConnectionStateChanged(state) => match state {
                RelayConnectionState::Connected => RelayOutcome::Connected,
                RelayConnectionState::Disconnected | RelayConnectionState::Failed => {
                    RelayOutcome::Lost(state)
                }
                RelayConnectionState::Connecting | RelayConnectionState::Reconnecting => {
                    tracing::debug!(?state, "Relay connection state changed");
                    RelayOutcome::Ignored
                }
            },
        }
    }

    /// Register a remote participant with flags from its publications
    pub fn on_participant_connected(&self, participant: RelayParticipant) -> RelayOutcome {
        if self.is_local(&participant.identity) {
            return RelayOutcome::Ignored;
        }
        let identity = participant.identity.clone();
        self.registry.upsert(
            participant.info(),
            ConnectionRef::Relay(ParticipantHandle {
                identity: identity.clone(),
            }),
        );
        self.registry.apply_update(&identity, &participant.flags());
        tracing::info!(call_id = %self.call_id, participant = %identity, "Relay participant connected");
        RelayOutcome::MemberJoined(identity)
    }

    /// Drop a participant; reports how many remain
    pub fn on_participant_disconnected(&self, identity: &MemberId) -> RelayOutcome {
        if self.registry.remove(identity).is_none() {
            return RelayOutcome::Ignored;
        }
        let remaining = self.registry.len();
        tracing::info!(call_id = %self.call_id, participant = %identity, remaining, "Relay participant left");
        RelayOutcome::MemberLeft {
            member_id: identity.clone(),
            remaining,
        }
    }

    /// Store a subscribed track under its declared source
    ///
    /// A track that arrives before its participant creates the member.
    pub fn on_track_subscribed(
        &self,
        track: RemoteTrack,
        source: MediaKind,
        participant: &MemberId,
    ) -> RelayOutcome {
        if self.is_local(participant) {
            track.stop();
            return RelayOutcome::Ignored;
        }
        if !self.registry.contains(participant) {
            self.registry.upsert(
                MemberInfo::new(participant.clone()),
                ConnectionRef::Relay(ParticipantHandle {
                    identity: participant.clone(),
                }),
            );
        }
        self.registry.set_remote_track(participant, source, track);
        self.registry
            .apply_update(participant, &MemberUpdate::for_kind(source, true));
        RelayOutcome::TrackChanged(participant.clone())
    }

    /// Clear an unsubscribed track and its derived flag
    pub fn on_track_unsubscribed(
        &self,
        track_id: &str,
        source: MediaKind,
        participant: &MemberId,
    ) -> RelayOutcome {
        let held = self
            .registry
            .get(participant)
            .and_then(|member| member.track(source).map(|t| t.id() == track_id));
        if held != Some(true) {
            return RelayOutcome::Ignored;
        }
        self.registry.clear_remote_track(participant, source);
        self.registry
            .apply_update(participant, &MemberUpdate::for_kind(source, false));
        RelayOutcome::TrackChanged(participant.clone())
    }

    /// Publish a local track
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] when not connected, or the SDK error
    pub async fn publish_track(&self, kind: MediaKind, track: LocalTrack) -> Result<(), RelayError> {
        let room = self.room()?;
        room.publish(kind, &track).await?;
        tracing::debug!(call_id = %self.call_id, %kind, "Published local track");
        Ok(())
    }

    /// Stop publishing `kind`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] when not connected, or the SDK error
    pub async fn unpublish_track(&self, kind: MediaKind) -> Result<(), RelayError> {
        let room = self.room()?;
        room.unpublish(kind).await?;
        tracing::debug!(call_id = %self.call_id, %kind, "Unpublished local track");
        Ok(())
    }

    /// Remote participants currently in the room
    pub fn participant_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop every received track and leave the room. Runs at most once.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.clear();
        let room = self.room.lock().take();
        if let Some(room) = room {
            if let Err(e) = room.disconnect().await {
                tracing::warn!(error = %e, "Error leaving relay room");
            }
        }
        tracing::info!("Relay session disconnected");
    }
}

#[async_trait]
impl TrackPublisher for RelaySessionManager {
    async fn attach_local_track(&self, kind: MediaKind, track: LocalTrack) -> Result<(), MediaError> {
        self.publish_track(kind, track)
            .await
            .map_err(|e| MediaError::Publish(e.to_string()))
    }

    async fn detach_local_track(&self, kind: MediaKind) -> Result<(), MediaError> {
        self.unpublish_track(kind)
            .await
            .map_err(|e| MediaError::Publish(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRelayServer;
    use tokio::sync::mpsc;

    struct Member {
        manager: RelaySessionManager,
        registry: Arc<CallMemberRegistry>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    impl Member {
        fn drain(&mut self) -> Vec<RelayOutcome> {
            let mut outcomes = Vec::new();
            while let Ok(TransportEvent::Relay(event)) = self.events.try_recv() {
                outcomes.push(self.manager.apply_event(event));
            }
            outcomes
        }
    }

    fn member(server: &Arc<LoopbackRelayServer>, identity: &str) -> Member {
        let registry = Arc::new(CallMemberRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = RelaySessionManager::new(
            CallId::new(),
            MemberId::new(identity),
            false,
            server.connector(MemberId::new(identity)),
            registry.clone(),
            tx,
        );
        Member {
            manager,
            registry,
            events: rx,
        }
    }

    #[tokio::test]
    async fn test_self_echo_is_ignored() {
        let server = LoopbackRelayServer::new();
        let mut alice = member(&server, "alice");
        alice.manager.connect("room-1").await.unwrap();

        let outcomes = alice.drain();
        assert!(outcomes.iter().all(|o| *o == RelayOutcome::Ignored || *o == RelayOutcome::Connected));
        assert!(alice.registry.is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_uses_declared_source() {
        let server = LoopbackRelayServer::new();
        let mut alice = member(&server, "alice");
        let mut bob = member(&server, "bob");
        alice.manager.connect("room-1").await.unwrap();
        bob.manager.connect("room-1").await.unwrap();
        alice.drain();

        let screen = LocalTrack::new("camera-looking-label", MediaKind::ScreenShare);
        bob.manager
            .publish_track(MediaKind::ScreenShare, screen)
            .await
            .unwrap();
        alice.drain();

        let bob_id = MemberId::new("bob");
        let seen = alice.registry.get(&bob_id).unwrap();
        assert!(seen.is_screen_sharing);
        assert!(!seen.is_video_enabled);
        assert!(seen.screen_track.is_some());
        assert!(seen.video_track.is_none());

        bob.manager.unpublish_track(MediaKind::ScreenShare).await.unwrap();
        alice.drain();
        let seen = alice.registry.get(&bob_id).unwrap();
        assert!(!seen.is_screen_sharing);
        assert!(seen.screen_track.is_none());
    }

    #[tokio::test]
    async fn test_track_before_participant_creates_member() {
        let server = LoopbackRelayServer::new();
        let alice = member(&server, "alice");
        let carol = MemberId::new("carol");

        let outcome = alice.manager.on_track_subscribed(
            RemoteTrack::new("t1", MediaKind::Audio),
            MediaKind::Audio,
            &carol,
        );
        assert_eq!(outcome, RelayOutcome::TrackChanged(carol.clone()));
        let seen = alice.registry.get(&carol).unwrap();
        assert!(!seen.is_muted);
        assert!(seen.voice_track.is_some());
    }

    #[tokio::test]
    async fn test_participant_leaving_reports_remaining() {
        let server = LoopbackRelayServer::new();
        let mut alice = member(&server, "alice");
        let mut bob = member(&server, "bob");
        alice.manager.connect("room-1").await.unwrap();
        bob.manager.connect("room-1").await.unwrap();
        alice.drain();
        assert_eq!(alice.manager.participant_count(), 1);

        bob.manager.disconnect().await;
        let outcomes = alice.drain();
        assert!(outcomes.contains(&RelayOutcome::MemberLeft {
            member_id: MemberId::new("bob"),
            remaining: 0,
        }));
    }

    #[tokio::test]
    async fn test_disconnect_runs_once() {
        let server = LoopbackRelayServer::new();
        let mut alice = member(&server, "alice");
        let mut bob = member(&server, "bob");
        alice.manager.connect("room-1").await.unwrap();
        bob.manager.connect("room-1").await.unwrap();
        bob.manager
            .publish_track(MediaKind::Audio, LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap();
        alice.drain();
        assert_eq!(alice.registry.active_track_count(), 1);

        alice.manager.disconnect().await;
        alice.manager.disconnect().await;
        assert_eq!(alice.registry.active_track_count(), 0);
        assert_eq!(server.participants("room-1"), vec![MemberId::new("bob")]);
        assert_eq!(
            alice
                .manager
                .publish_track(MediaKind::Video, LocalTrack::new("cam", MediaKind::Video))
                .await,
            Err(RelayError::Closed)
        );
    }
}
