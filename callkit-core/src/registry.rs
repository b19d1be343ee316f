//! Remote call members
//!
//! The registry is the single place remote participants of the active call
//! live. Topology managers insert and patch members; the controller reads
//! snapshots and clears it at teardown. Removing a member always stops its
//! remote tracks first.

use crate::identity::MemberId;
use crate::signaling::MemberUpdatePayload;
use crate::track::RemoteTrack;
use crate::types::MediaKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Handle of a mesh peer connection, owned by the mesh manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Member the connection leads to
    pub member_id: MemberId,
    /// Connection instance
    pub id: Uuid,
}

impl ConnectionHandle {
    /// New handle for a fresh connection to `member_id`
    pub fn new(member_id: MemberId) -> Self {
        Self {
            member_id,
            id: Uuid::new_v4(),
        }
    }
}

/// Handle onto a participant of the shared relay session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantHandle {
    /// Identity reported by the relay
    pub identity: MemberId,
}

/// How a member is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionRef {
    /// Dedicated peer connection (mesh)
    Peer(ConnectionHandle),
    /// Participant of the relay session
    Relay(ParticipantHandle),
}

/// Identity and display data of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Participant identity
    pub member_id: MemberId,
    /// Name to display
    pub display_name: String,
    /// Avatar reference, if any
    pub avatar_ref: Option<String>,
}

impl MemberInfo {
    /// Member displayed under its identity
    pub fn new(member_id: MemberId) -> Self {
        let display_name = member_id.to_string();
        Self {
            member_id,
            display_name,
            avatar_ref: None,
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the avatar reference
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// A remote participant of the active call
#[derive(Debug, Clone)]
pub struct CallMember {
    /// Participant identity
    pub member_id: MemberId,
    /// Name to display
    pub display_name: String,
    /// Avatar reference
    pub avatar_ref: Option<String>,
    /// How the member is reached
    pub connection: ConnectionRef,
    /// Received microphone track
    pub voice_track: Option<RemoteTrack>,
    /// Received camera track
    pub video_track: Option<RemoteTrack>,
    /// Received screen capture track
    pub screen_track: Option<RemoteTrack>,
    /// Advertised: microphone muted
    pub is_muted: bool,
    /// Advertised: camera on
    pub is_video_enabled: bool,
    /// Advertised: screen being shared
    pub is_screen_sharing: bool,
    /// Last time anything was received for this member
    pub last_activity_at: DateTime<Utc>,
}

impl CallMember {
    /// New member with no tracks, muted, camera and screen off
    pub fn new(info: MemberInfo, connection: ConnectionRef) -> Self {
        Self {
            member_id: info.member_id,
            display_name: info.display_name,
            avatar_ref: info.avatar_ref,
            connection,
            voice_track: None,
            video_track: None,
            screen_track: None,
            is_muted: true,
            is_video_enabled: false,
            is_screen_sharing: false,
            last_activity_at: Utc::now(),
        }
    }

    /// Received track of `kind`
    pub fn track(&self, kind: MediaKind) -> Option<&RemoteTrack> {
        self.slot(kind).as_ref()
    }

    fn slot(&self, kind: MediaKind) -> &Option<RemoteTrack> {
        match kind {
            MediaKind::Audio => &self.voice_track,
            MediaKind::Video => &self.video_track,
            MediaKind::ScreenShare => &self.screen_track,
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<RemoteTrack> {
        match kind {
            MediaKind::Audio => &mut self.voice_track,
            MediaKind::Video => &mut self.video_track,
            MediaKind::ScreenShare => &mut self.screen_track,
        }
    }

    /// Advertised sending flag for `kind`
    pub fn is_sending(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => !self.is_muted,
            MediaKind::Video => self.is_video_enabled,
            MediaKind::ScreenShare => self.is_screen_sharing,
        }
    }

    fn apply(&mut self, update: &MemberUpdate) {
        if let Some(muted) = update.is_muted {
            self.is_muted = muted;
        }
        if let Some(video) = update.is_video_enabled {
            self.is_video_enabled = video;
        }
        if let Some(screen) = update.is_screen_sharing {
            self.is_screen_sharing = screen;
        }
        self.last_activity_at = Utc::now();
    }

    fn stop_tracks(&mut self) {
        for kind in MediaKind::ALL {
            if let Some(track) = self.slot_mut(kind).take() {
                track.stop();
            }
        }
    }

    fn live_tracks(&self) -> usize {
        MediaKind::ALL
            .into_iter()
            .filter(|kind| self.track(*kind).is_some_and(RemoteTrack::is_live))
            .count()
    }
}

/// Partial update of a member's advertised flags
///
/// `None` leaves a flag untouched; `Some(false)` clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberUpdate {
    /// Microphone muted
    pub is_muted: Option<bool>,
    /// Camera on
    pub is_video_enabled: Option<bool>,
    /// Screen being shared
    pub is_screen_sharing: Option<bool>,
}

impl MemberUpdate {
    /// Update touching only the flag of `kind`
    pub fn for_kind(kind: MediaKind, sending: bool) -> Self {
        match kind {
            MediaKind::Audio => Self {
                is_muted: Some(!sending),
                ..Self::default()
            },
            MediaKind::Video => Self {
                is_video_enabled: Some(sending),
                ..Self::default()
            },
            MediaKind::ScreenShare => Self {
                is_screen_sharing: Some(sending),
                ..Self::default()
            },
        }
    }

    /// Whether the update changes nothing
    pub fn is_empty(&self) -> bool {
        self.is_muted.is_none() && self.is_video_enabled.is_none() && self.is_screen_sharing.is_none()
    }
}

impl From<&MemberUpdatePayload> for MemberUpdate {
    fn from(payload: &MemberUpdatePayload) -> Self {
        Self {
            is_muted: payload.is_muted,
            is_video_enabled: payload.is_video_enabled,
            is_screen_sharing: payload.is_screen_sharing,
        }
    }
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberEvent {
    /// Member joined the call
    Joined {
        /// Member identity
        member_id: MemberId,
        /// Display name
        display_name: String,
    },
    /// Member left; its tracks are stopped
    Left {
        /// Member identity
        member_id: MemberId,
    },
    /// Flags or tracks of a member changed
    Updated {
        /// Member identity
        member_id: MemberId,
        /// Microphone muted
        is_muted: bool,
        /// Camera on
        is_video_enabled: bool,
        /// Screen being shared
        is_screen_sharing: bool,
    },
}

impl MemberEvent {
    fn updated(member: &CallMember) -> Self {
        Self::Updated {
            member_id: member.member_id.clone(),
            is_muted: member.is_muted,
            is_video_enabled: member.is_video_enabled,
            is_screen_sharing: member.is_screen_sharing,
        }
    }
}

type Listener = Arc<dyn Fn(MemberEvent) + Send + Sync>;

/// Registry of remote members of the active call
#[derive(Default)]
pub struct CallMemberRegistry {
    members: RwLock<HashMap<MemberId, CallMember>>,
    listener: Option<Listener>,
}

impl CallMemberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry reporting changes to `listener`
    pub fn with_listener(listener: impl Fn(MemberEvent) + Send + Sync + 'static) -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            listener: Some(Arc::new(listener)),
        }
    }

    fn notify(&self, event: MemberEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    /// Insert a member, or refresh identity data and connection of an existing one
    ///
    /// Returns `true` if the member is new.
    pub fn upsert(&self, info: MemberInfo, connection: ConnectionRef) -> bool {
        let event = {
            let mut members = self.members.write();
            match members.get_mut(&info.member_id) {
                Some(existing) => {
                    existing.display_name = info.display_name;
                    existing.avatar_ref = info.avatar_ref;
                    existing.connection = connection;
                    existing.last_activity_at = Utc::now();
                    None
                }
                None => {
                    let event = MemberEvent::Joined {
                        member_id: info.member_id.clone(),
                        display_name: info.display_name.clone(),
                    };
                    members.insert(info.member_id.clone(), CallMember::new(info, connection));
                    Some(event)
                }
            }
        };
        let joined = event.is_some();
        if let Some(event) = event {
            tracing::debug!(?event, "Member joined");
            self.notify(event);
        }
        joined
    }

    /// Remove a member after stopping its tracks
    pub fn remove(&self, member_id: &MemberId) -> Option<CallMember> {
        let mut member = self.members.write().remove(member_id)?;
        member.stop_tracks();
        tracing::debug!(%member_id, "Member left");
        self.notify(MemberEvent::Left {
            member_id: member_id.clone(),
        });
        Some(member)
    }

    /// Patch advertised flags. Returns `false` for unknown members.
    pub fn apply_update(&self, member_id: &MemberId, update: &MemberUpdate) -> bool {
        let event = {
            let mut members = self.members.write();
            let Some(member) = members.get_mut(member_id) else {
                return false;
            };
            member.apply(update);
            MemberEvent::updated(member)
        };
        self.notify(event);
        true
    }

    /// Store a received track under its declared source
    ///
    /// A previous track of the same kind is stopped. Returns `false` for
    /// unknown members, in which case the track is stopped.
    pub fn set_remote_track(&self, member_id: &MemberId, kind: MediaKind, track: RemoteTrack) -> bool {
        let (replaced, event) = {
            let mut members = self.members.write();
            let Some(member) = members.get_mut(member_id) else {
                track.stop();
                return false;
            };
            let replaced = member.slot_mut(kind).replace(track);
            member.last_activity_at = Utc::now();
            (replaced, MemberEvent::updated(member))
        };
        if let Some(old) = replaced {
            old.stop();
        }
        self.notify(event);
        true
    }

    /// Stop and clear the track of `kind`
    pub fn clear_remote_track(&self, member_id: &MemberId, kind: MediaKind) -> Option<RemoteTrack> {
        let (track, event) = {
            let mut members = self.members.write();
            let member = members.get_mut(member_id)?;
            let track = member.slot_mut(kind).take()?;
            member.last_activity_at = Utc::now();
            (track, MemberEvent::updated(member))
        };
        track.stop();
        self.notify(event);
        Some(track)
    }

    /// Stop and clear whichever slot holds the track with `track_id`
    pub fn clear_remote_track_by_id(&self, member_id: &MemberId, track_id: &str) -> Option<MediaKind> {
        let kind = {
            let members = self.members.read();
            let member = members.get(member_id)?;
            MediaKind::ALL
                .into_iter()
                .find(|kind| member.track(*kind).is_some_and(|t| t.id() == track_id))?
        };
        self.clear_remote_track(member_id, kind).map(|_| kind)
    }

    /// Stop every track and drop every member
    pub fn clear(&self) {
        let drained: Vec<CallMember> = self.members.write().drain().map(|(_, m)| m).collect();
        for mut member in drained {
            member.stop_tracks();
            self.notify(MemberEvent::Left {
                member_id: member.member_id,
            });
        }
    }

    /// Member snapshot
    pub fn get(&self, member_id: &MemberId) -> Option<CallMember> {
        self.members.read().get(member_id).cloned()
    }

    /// Whether the member is present
    pub fn contains(&self, member_id: &MemberId) -> bool {
        self.members.read().contains_key(member_id)
    }

    /// Snapshot of all members, ordered by identity
    pub fn members(&self) -> Vec<CallMember> {
        let mut members: Vec<CallMember> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        members
    }

    /// Identities of all members
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.read().keys().cloned().collect()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Number of live remote tracks held across all members
    pub fn active_track_count(&self) -> usize {
        self.members.read().values().map(CallMember::live_tracks).sum()
    }
}
