//! Mesh topology: one peer connection per remote member
//!
//! All connection state lives behind one async mutex that is held across link
//! operations, so a connection is never created twice and SDP steps on a link
//! never interleave. Signaling sends happen after the lock is released.
//!
//! # ICE ordering
//!
//! Remote candidates go into an append-only [`IceCandidateBuffer`]. Every
//! connection keeps a cursor into that log and only consumes it once its
//! remote description is set, so a candidate is never applied early and a
//! late connection replays everything it missed in arrival order. Candidates
//! are not routed by sender: each one reaches every ready connection, and a
//! connection that cannot use it logs and skips it.
//!
//! # Renegotiation
//!
//! A sender added while a connection still waits for its remote description
//! cannot make it into the exchange in flight. The connection is marked and
//! a follow-up offer goes out as soon as that description lands.

use crate::identity::{ChatId, MemberId};
use crate::media::{MediaError, TrackPublisher};
use crate::registry::{CallMemberRegistry, ConnectionHandle, ConnectionRef, MemberInfo};
use crate::signaling::{CandidatePayload, SessionPayload, SignalTarget, SignalingEvent, SignalingHandler};
use crate::track::{LocalTrack, RemoteTrack};
use crate::transport::{
    PeerEventSink, PeerLink, PeerTransport, SenderId, TransportError, TransportEventSender,
};
use crate::types::{CallId, IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ordered log of remote ICE candidates for one call
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    log: Vec<IceCandidate>,
}

impl IceCandidateBuffer {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received candidate
    pub fn push(&mut self, candidate: IceCandidate) {
        self.log.push(candidate);
    }

    /// Candidates at or after `cursor`, with the cursor past the end
    pub fn pending_since(&self, cursor: usize) -> (Vec<IceCandidate>, usize) {
        let pending = self.log.get(cursor..).unwrap_or_default().to_vec();
        (pending, self.log.len())
    }

    /// Number of candidates received
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Whether no candidate was received
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Drop every candidate
    pub fn clear(&mut self) {
        self.log.clear();
    }
}

struct PeerEntry {
    handle: ConnectionHandle,
    link: Arc<dyn PeerLink>,
    senders: HashMap<MediaKind, SenderId>,
    remote_description_set: bool,
    needs_renegotiation: bool,
    ice_cursor: usize,
}

impl PeerEntry {
    async fn flush_candidates(&mut self, buffer: &IceCandidateBuffer) {
        if !self.remote_description_set {
            return;
        }
        let (pending, cursor) = buffer.pending_since(self.ice_cursor);
        self.ice_cursor = cursor;
        for candidate in pending {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                tracing::warn!(member_id = %self.handle.member_id, error = %e, "Skipping ICE candidate");
            }
        }
    }
}

#[derive(Default)]
struct MeshState {
    peers: HashMap<MemberId, PeerEntry>,
    ice: IceCandidateBuffer,
    local_tracks: HashMap<MediaKind, LocalTrack>,
    closed: bool,
}

/// Manages the peer connections of a direct call
pub struct PeerMeshManager {
    call_id: CallId,
    chat_id: ChatId,
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingHandler,
    registry: Arc<CallMemberRegistry>,
    events: TransportEventSender,
    state: Mutex<MeshState>,
    closed: AtomicBool,
}

impl PeerMeshManager {
    /// Create a manager for one call
    pub fn new(
        call_id: CallId,
        chat_id: ChatId,
        transport: Arc<dyn PeerTransport>,
        signaling: SignalingHandler,
        registry: Arc<CallMemberRegistry>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            call_id,
            chat_id,
            transport,
            signaling,
            registry,
            events,
            state: Mutex::new(MeshState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Call this manager belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Whether [`PeerMeshManager::close`] ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Create the connection to a member, or return the existing one
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after close, or the backend error
    #[tracing::instrument(skip(self, info), fields(call_id = %self.call_id, member_id = %info.member_id))]
    pub async fn create_connection(&self, info: MemberInfo) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.state.lock().await;
        self.ensure_peer(&mut state, info).await
    }

    /// Create the connection and, on the offering side, send the initial offer
    ///
    /// # Errors
    ///
    /// Same as [`PeerMeshManager::create_connection`] and [`PeerMeshManager::send_offer`]
    pub async fn add_member(
        &self,
        info: MemberInfo,
        initiate_offer: bool,
    ) -> Result<ConnectionHandle, TransportError> {
        let member_id = info.member_id.clone();
        let handle = self.create_connection(info).await?;
        if initiate_offer {
            self.send_offer(&member_id).await?;
        }
        Ok(handle)
    }

    async fn ensure_peer(
        &self,
        state: &mut MeshState,
        info: MemberInfo,
    ) -> Result<ConnectionHandle, TransportError> {
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(entry) = state.peers.get(&info.member_id) {
            return Ok(entry.handle.clone());
        }

        let member_id = info.member_id.clone();
        let sink = PeerEventSink::new(member_id.clone(), self.events.clone());
        let link = self.transport.create_peer(&member_id, sink).await?;

        let mut senders = HashMap::new();
        for kind in MediaKind::ALL {
            let Some(track) = state.local_tracks.get(&kind) else {
                continue;
            };
            match link.add_track(track).await {
                Ok(sender) => {
                    senders.insert(kind, sender);
                }
                Err(e) => {
                    let _ = link.close().await;
                    return Err(e);
                }
            }
        }

        let handle = ConnectionHandle::new(member_id.clone());
        state.peers.insert(
            member_id.clone(),
            PeerEntry {
                handle: handle.clone(),
                link,
                senders,
                remote_description_set: false,
                needs_renegotiation: false,
                ice_cursor: 0,
            },
        );
        self.registry.upsert(info, ConnectionRef::Peer(handle.clone()));
        tracing::info!(call_id = %self.call_id, %member_id, "Peer connection created");
        Ok(handle)
    }

    /// Create an offer for `member_id` and send it
    ///
    /// Creates the connection if needed. Used for the initial offer and for
    /// renegotiation.
    ///
    /// # Errors
    ///
    /// Returns the negotiation or signaling failure
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn send_offer(&self, member_id: &MemberId) -> Result<(), TransportError> {
        let offer = {
            let mut state = self.state.lock().await;
            self.ensure_peer(&mut state, MemberInfo::new(member_id.clone()))
                .await?;
            let entry = state
                .peers
                .get_mut(member_id)
                .ok_or_else(|| TransportError::UnknownPeer(member_id.clone()))?;
            let offer = entry.link.create_offer().await?;
            entry.link.set_local_description(offer.clone()).await?;
            entry.needs_renegotiation = false;
            offer
        };

        self.signal(
            member_id,
            SignalingEvent::Offer(SessionPayload {
                call_id: self.call_id,
                chat_id: self.chat_id.clone(),
                sdp: offer.sdp,
            }),
        )
        .await
    }

    /// Apply an offer from `from`, answer it, and send the answer back
    ///
    /// An offer from a member without a connection creates one. Senders added
    /// while the offer was awaited are renegotiated right after the answer.
    ///
    /// # Errors
    ///
    /// Returns the negotiation or signaling failure
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn apply_remote_offer(
        &self,
        from: &MemberId,
        sdp: String,
    ) -> Result<SessionDescription, TransportError> {
        let (answer, follow_up) = {
            let mut state = self.state.lock().await;
            self.ensure_peer(&mut state, MemberInfo::new(from.clone()))
                .await?;
            let MeshState { peers, ice, .. } = &mut *state;
            let entry = peers
                .get_mut(from)
                .ok_or_else(|| TransportError::UnknownPeer(from.clone()))?;

            entry
                .link
                .set_remote_description(SessionDescription::offer(sdp))
                .await?;
            entry.remote_description_set = true;
            entry.flush_candidates(ice).await;

            let answer = entry.link.create_answer().await?;
            entry.link.set_local_description(answer.clone()).await?;
            (answer, std::mem::take(&mut entry.needs_renegotiation))
        };

        self.signal(
            from,
            SignalingEvent::Answer(SessionPayload {
                call_id: self.call_id,
                chat_id: self.chat_id.clone(),
                sdp: answer.sdp.clone(),
            }),
        )
        .await?;
        if follow_up {
            tracing::debug!(member_id = %from, "Renegotiating senders added before the offer");
            self.send_offer(from).await?;
        }
        Ok(answer)
    }

    /// Apply the answer to our offer
    ///
    /// Senders added while the answer was awaited get a follow-up offer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownPeer`] if no offer was made to `from`
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn apply_remote_answer(&self, from: &MemberId, sdp: String) -> Result<(), TransportError> {
        let follow_up = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            let MeshState { peers, ice, .. } = &mut *state;
            let entry = peers
                .get_mut(from)
                .ok_or_else(|| TransportError::UnknownPeer(from.clone()))?;

            entry
                .link
                .set_remote_description(SessionDescription::answer(sdp))
                .await?;
            entry.remote_description_set = true;
            entry.flush_candidates(ice).await;
            std::mem::take(&mut entry.needs_renegotiation)
        };

        if follow_up {
            tracing::debug!(member_id = %from, "Renegotiating senders added during the exchange");
            self.send_offer(from).await?;
        }
        Ok(())
    }

    /// Queue a remote candidate and apply it to every connection whose remote
    /// description is set; the others pick it up once theirs is
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after close
    pub async fn add_ice_candidate(
        &self,
        from: &MemberId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        let MeshState { peers, ice, .. } = &mut *state;
        ice.push(candidate);
        for entry in peers.values_mut() {
            entry.flush_candidates(ice).await;
        }
        tracing::trace!(%from, buffered = ice.len(), "Remote ICE candidate queued");
        Ok(())
    }

    /// Send a locally gathered candidate to `member_id`
    ///
    /// # Errors
    ///
    /// Returns the signaling failure
    pub async fn forward_local_candidate(
        &self,
        member_id: &MemberId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.signal(
            member_id,
            SignalingEvent::IceCandidate(CandidatePayload {
                call_id: self.call_id,
                chat_id: self.chat_id.clone(),
                candidate,
            }),
        )
        .await
    }

    /// Record a received track. Returns `false` if the member is gone.
    pub fn on_remote_track(&self, member_id: &MemberId, track: RemoteTrack) -> bool {
        if self.is_closed() {
            track.stop();
            return false;
        }
        let kind = track.kind();
        tracing::debug!(call_id = %self.call_id, %member_id, %kind, "Remote track received");
        self.registry.set_remote_track(member_id, kind, track)
    }

    /// Clear a track that ended
    pub fn on_remote_track_ended(&self, member_id: &MemberId, track_id: &str) -> Option<MediaKind> {
        self.registry.clear_remote_track_by_id(member_id, track_id)
    }

    /// Close the connection to one member and drop it from the registry
    ///
    /// Returns how many members remain.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after close
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn teardown(&self, member_id: &MemberId) -> Result<usize, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(entry) = state.peers.remove(member_id) {
            if let Err(e) = entry.link.close().await {
                tracing::warn!(%member_id, error = %e, "Error closing peer connection");
            }
        }
        self.registry.remove(member_id);
        let remaining = state.peers.len();
        tracing::info!(%member_id, remaining, "Peer torn down");
        Ok(remaining)
    }

    /// Close every connection and drop the candidate log. Idempotent.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.ice.clear();
        state.local_tracks.clear();

        let entries: Vec<PeerEntry> = state.peers.drain().map(|(_, entry)| entry).collect();
        let results = futures::future::join_all(entries.iter().map(|entry| entry.link.close())).await;
        for (entry, result) in entries.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(member_id = %entry.handle.member_id, error = %e, "Error closing peer connection");
            }
            self.registry.remove(&entry.handle.member_id);
        }
        tracing::info!(connections = entries.len(), "Mesh closed");
    }

    /// Members with a connection
    pub async fn member_ids(&self) -> Vec<MemberId> {
        self.state.lock().await.peers.keys().cloned().collect()
    }

    /// Number of open connections
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Number of remote candidates received so far
    pub async fn buffered_candidates(&self) -> usize {
        self.state.lock().await.ice.len()
    }

    /// Attach `track` to every connection
    ///
    /// An existing sender of the same kind gets its track replaced. A
    /// connection without one gets a new sender and is renegotiated: right
    /// away once its remote description is set, otherwise when that
    /// description lands.
    ///
    /// # Errors
    ///
    /// Returns the first link or signaling failure
    #[tracing::instrument(skip(self, track), fields(call_id = %self.call_id))]
    pub async fn attach_track(&self, kind: MediaKind, track: LocalTrack) -> Result<(), TransportError> {
        let renegotiate = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.local_tracks.insert(kind, track.clone());

            let mut renegotiate = Vec::new();
            for (member_id, entry) in state.peers.iter_mut() {
                if let Some(sender) = entry.senders.get(&kind) {
                    entry.link.replace_track(*sender, Some(&track)).await?;
                } else {
                    let sender = entry.link.add_track(&track).await?;
                    entry.senders.insert(kind, sender);
                    if entry.remote_description_set {
                        renegotiate.push(member_id.clone());
                    } else {
                        entry.needs_renegotiation = true;
                    }
                }
            }
            renegotiate
        };

        for member_id in renegotiate {
            tracing::debug!(%member_id, %kind, "Renegotiating for new sender");
            self.send_offer(&member_id).await?;
        }
        Ok(())
    }

    /// Stop sending `kind` on every connection; senders are kept
    ///
    /// # Errors
    ///
    /// Returns the first link failure
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn detach_track(&self, kind: MediaKind) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.local_tracks.remove(&kind);
        for entry in state.peers.values() {
            if let Some(sender) = entry.senders.get(&kind) {
                entry.link.replace_track(*sender, None).await?;
            }
        }
        Ok(())
    }

    async fn signal(&self, member_id: &MemberId, event: SignalingEvent) -> Result<(), TransportError> {
        self.signaling
            .send(SignalTarget::Member(member_id.clone()), event)
            .await
            .map_err(|e| TransportError::Negotiation(format!("signaling to {member_id}: {e}")))
    }
}

#[async_trait]
impl TrackPublisher for PeerMeshManager {
    async fn attach_local_track(&self, kind: MediaKind, track: LocalTrack) -> Result<(), MediaError> {
        self.attach_track(kind, track)
            .await
            .map_err(|e| MediaError::Publish(e.to_string()))
    }

    async fn detach_local_track(&self, kind: MediaKind) -> Result<(), MediaError> {
        self.detach_track(kind)
            .await
            .map_err(|e| MediaError::Publish(e.to_string()))
    }
}
