//! In-memory collaborators
//!
//! Every external seam of the crate has a loopback implementation here:
//! signaling ([`LoopbackHub`]), devices ([`LoopbackDevices`]), mesh peers
//! ([`LoopbackNetwork`]), the relay ([`LoopbackRelayServer`]) and the call
//! record service ([`RecordingCallRecords`]). Several controllers wired to
//! the same loopback instances behave like participants on one network,
//! which is what the `callkit` command line and the integration tests
//! run on. Each type also exposes hooks to inject failures and inspect what
//! happened.

use crate::identity::{ChatId, MemberId};
use crate::media::{DeviceConstraints, MediaDevices, MediaError};
use crate::record::{CallRecordService, CallRecordUpdate, CallStatus};
use crate::relay::{
    RelayConnectOptions, RelayConnectionState, RelayConnector, RelayError, RelayEvent,
    RelayEventSink, RelayParticipant, RelayRoom,
};
use crate::signaling::{
    SignalInbox, SignalTarget, SignalingError, SignalingEvent, SignalingGateway,
};
use crate::track::{LocalTrack, RemoteTrack};
use crate::transport::{
    PeerEvent, PeerEventSink, PeerLink, PeerState, PeerTransport, SenderId, TransportError,
};
use crate::types::{CallId, IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

type InboxSender = mpsc::UnboundedSender<(MemberId, SignalingEvent)>;

/// A signaling event as it left a gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSignal {
    /// Sending member
    pub from: MemberId,
    /// Addressed target
    pub target: SignalTarget,
    /// The event
    pub event: SignalingEvent,
}

#[derive(Default)]
struct HubState {
    inboxes: HashMap<MemberId, InboxSender>,
    chats: HashMap<ChatId, Vec<MemberId>>,
    sent: Vec<SentSignal>,
    failing: HashSet<MemberId>,
    delay: Option<Duration>,
}

/// In-memory signaling channel shared by all participants
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a participant; returns its gateway and inbox
    pub fn register(self: &Arc<Self>, member: MemberId) -> (Arc<LoopbackGateway>, SignalInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(member.clone(), tx);
        let gateway = Arc::new(LoopbackGateway {
            hub: self.clone(),
            member,
        });
        (gateway, rx)
    }

    /// Add a participant to a conversation
    pub fn join(&self, chat: &ChatId, member: &MemberId) {
        let mut state = self.state.lock();
        let members = state.chats.entry(chat.clone()).or_default();
        if !members.contains(member) {
            members.push(member.clone());
        }
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<SentSignal> {
        self.state.lock().sent.clone()
    }

    /// Events sent by one participant, in order
    pub fn sent_by(&self, member: &MemberId) -> Vec<SignalingEvent> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|s| s.from == *member)
            .map(|s| s.event.clone())
            .collect()
    }

    /// Make every send from `member` fail
    pub fn fail_sends(&self, member: &MemberId, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing.insert(member.clone());
        } else {
            state.failing.remove(member);
        }
    }

    /// Delay every send by `delay`
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    fn deliver(&self, from: &MemberId, target: SignalTarget, event: SignalingEvent) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if state.failing.contains(from) {
            return Err(SignalingError::Transport(format!("{from} is offline")));
        }
        let recipients: Vec<MemberId> = match &target {
            SignalTarget::Chat(chat) => state
                .chats
                .get(chat)
                .map(|members| members.iter().filter(|m| *m != from).cloned().collect())
                .unwrap_or_default(),
            SignalTarget::Member(member) => vec![member.clone()],
        };
        for recipient in recipients {
            if let Some(inbox) = state.inboxes.get(&recipient) {
                let _ = inbox.send((from.clone(), event.clone()));
            }
        }
        state.sent.push(SentSignal {
            from: from.clone(),
            target,
            event,
        });
        Ok(())
    }
}

/// Gateway of one participant on a [`LoopbackHub`]
pub struct LoopbackGateway {
    hub: Arc<LoopbackHub>,
    member: MemberId,
}

#[async_trait]
impl SignalingGateway for LoopbackGateway {
    async fn send(&self, target: SignalTarget, event: SignalingEvent) -> Result<(), SignalingError> {
        let delay = self.hub.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.hub.deliver(&self.member, target, event)
    }
}

#[derive(Default)]
struct DeviceScript {
    scripted: HashMap<MediaKind, VecDeque<MediaError>>,
    denied: HashSet<MediaKind>,
    acquisitions: HashMap<MediaKind, usize>,
    last_constraints: HashMap<MediaKind, DeviceConstraints>,
    issued: Vec<LocalTrack>,
    delay: Option<Duration>,
}

/// Scripted capture devices
#[derive(Default)]
pub struct LoopbackDevices {
    script: Mutex<DeviceScript>,
}

impl LoopbackDevices {
    /// Devices that always succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next acquisition attempt of `kind` with `error`
    pub fn fail_next(&self, kind: MediaKind, error: MediaError) {
        self.script
            .lock()
            .scripted
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Deny permission for `kind` from now on
    pub fn deny(&self, kind: MediaKind) {
        self.script.lock().denied.insert(kind);
    }

    /// Take `delay` to deliver every track
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    /// Acquisition attempts made for `kind`
    pub fn acquisitions(&self, kind: MediaKind) -> usize {
        self.script
            .lock()
            .acquisitions
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Constraints of the latest attempt for `kind`
    pub fn last_constraints(&self, kind: MediaKind) -> Option<DeviceConstraints> {
        self.script.lock().last_constraints.get(&kind).copied()
    }

    /// Tracks handed out and not yet stopped
    pub fn live_tracks(&self) -> usize {
        self.script
            .lock()
            .issued
            .iter()
            .filter(|t| t.is_live())
            .count()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire(&self, kind: MediaKind, constraints: DeviceConstraints) -> Result<LocalTrack, MediaError> {
        let delay = {
            let mut script = self.script.lock();
            *script.acquisitions.entry(kind).or_default() += 1;
            script.last_constraints.insert(kind, constraints);
            if script.denied.contains(&kind) {
                return Err(MediaError::PermissionDenied(kind));
            }
            if let Some(error) = script.scripted.get_mut(&kind).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            script.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        let track = LocalTrack::new(format!("{kind}-{}", script.issued.len()), kind);
        script.issued.push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
struct LinkState {
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    senders: Vec<Option<LocalTrack>>,
    sender_kinds: Vec<MediaKind>,
    announced: HashSet<usize>,
    applied: Vec<IceCandidate>,
    delivered: HashSet<usize>,
    gathered: bool,
    connected: bool,
    closed: bool,
    offers: usize,
}

/// In-memory peer network; links are paired by `(local, remote)`
#[derive(Default)]
pub struct LoopbackNetwork {
    links: Mutex<HashMap<(MemberId, MemberId), Arc<LoopbackPeerLink>>>,
    refused: Mutex<HashSet<MemberId>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Peer transport of participant `local`
    pub fn transport(self: &Arc<Self>, local: MemberId) -> Arc<LoopbackPeerTransport> {
        Arc::new(LoopbackPeerTransport {
            network: Arc::downgrade(self),
            local,
        })
    }

    /// Latest link `local` created towards `remote`
    pub fn link(&self, local: &MemberId, remote: &MemberId) -> Option<Arc<LoopbackPeerLink>> {
        self.links
            .lock()
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }

    /// Make link creation fail for `local`
    pub fn refuse_peers(&self, local: &MemberId, refuse: bool) {
        let mut refused = self.refused.lock();
        if refuse {
            refused.insert(local.clone());
        } else {
            refused.remove(local);
        }
    }

    /// Report a connection failure on the link `local -> remote`
    pub fn fail_link(&self, local: &MemberId, remote: &MemberId) -> bool {
        self.link(local, remote)
            .is_some_and(|link| link.sink.emit(PeerEvent::StateChanged(PeerState::Failed)))
    }

    /// Links that are not closed
    pub fn open_links(&self) -> usize {
        self.links
            .lock()
            .values()
            .filter(|link| !link.is_closed())
            .count()
    }
}

/// Peer transport of one participant on a [`LoopbackNetwork`]
pub struct LoopbackPeerTransport {
    network: Weak<LoopbackNetwork>,
    local: MemberId,
}

#[async_trait]
impl PeerTransport for LoopbackPeerTransport {
    async fn create_peer(
        &self,
        member_id: &MemberId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Backend("network shut down".to_string()))?;
        if network.refused.lock().contains(&self.local) {
            return Err(TransportError::Backend("peer connection refused".to_string()));
        }
        let link = Arc::new(LoopbackPeerLink {
            local: self.local.clone(),
            remote: member_id.clone(),
            network: self.network.clone(),
            sink: events,
            state: Mutex::new(LinkState::default()),
        });
        network
            .links
            .lock()
            .insert((self.local.clone(), member_id.clone()), link.clone());
        Ok(link)
    }
}

/// One side of an in-memory peer connection
///
/// SDP is plain text with one `a=sender:<index> <kind>` line per sender. An
/// offer lists every sender; an answer lists only senders whose kind the
/// offer carries or that an earlier description already listed. Once both
/// descriptions are applied the link reports itself connected and delivers
/// the counterpart senders named in the remote description as remote
/// tracks, so a sender added after the last exchange stays invisible until
/// it is renegotiated.
pub struct LoopbackPeerLink {
    local: MemberId,
    remote: MemberId,
    network: Weak<LoopbackNetwork>,
    sink: PeerEventSink,
    state: Mutex<LinkState>,
}

impl LoopbackPeerLink {
    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Whether the link was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Offers created on this link
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    /// Whether a remote description was applied
    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_desc.is_some()
    }

    /// Ids of the tracks currently sent, one entry per sender
    pub fn sender_tracks(&self) -> Vec<Option<String>> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.as_ref().map(|t| t.id().to_string()))
            .collect()
    }

    fn counterpart(&self) -> Option<Arc<LoopbackPeerLink>> {
        self.network.upgrade()?.link(&self.remote, &self.local)
    }

    fn session_sdp(&self, version: usize, senders: impl Iterator<Item = (usize, MediaKind)>) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {version} 0 IN IP4 127.0.0.1\r\ns={}->{}\r\n",
            self.local, self.remote
        );
        for (idx, kind) in senders {
            sdp.push_str(&format!("a=sender:{idx} {kind}\r\n"));
        }
        sdp
    }

    fn sending(&self) -> Vec<(usize, MediaKind)> {
        self.state
            .lock()
            .senders
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|t| (idx, t.kind())))
            .collect()
    }

    fn check_connected(&self) {
        let negotiated: HashSet<usize> = {
            let state = self.state.lock();
            match (&state.local_desc, &state.remote_desc) {
                (Some(_), Some(remote)) if !state.closed => {
                    listed_senders(&remote.sdp).map(|(idx, _)| idx).collect()
                }
                _ => return,
            }
        };
        let remote_senders: Vec<(usize, MediaKind)> = self
            .counterpart()
            .map(|link| link.sending())
            .unwrap_or_default()
            .into_iter()
            .filter(|(idx, _)| negotiated.contains(idx))
            .collect();

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.connected {
                state.connected = true;
                events.push(PeerEvent::StateChanged(PeerState::Connected));
            }
            for (idx, kind) in remote_senders {
                if state.delivered.insert(idx) {
                    let track = RemoteTrack::new(format!("{}/sender-{idx}", self.remote), kind);
                    events.push(PeerEvent::RemoteTrack(track));
                }
            }
        }
        for event in events {
            self.sink.emit(event);
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for LoopbackPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.offers += 1;
        let senders = state.sender_kinds.iter().copied().enumerate();
        Ok(SessionDescription::offer(self.session_sdp(state.offers, senders)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let state = self.state.lock();
        let offer = match &state.remote_desc {
            Some(desc) if desc.sdp_type == SdpType::Offer => desc,
            _ => return Err(TransportError::Negotiation("no remote offer to answer".to_string())),
        };
        let offered: HashSet<&str> = listed_senders(&offer.sdp).map(|(_, kind)| kind).collect();
        let senders = state
            .sender_kinds
            .iter()
            .copied()
            .enumerate()
            .filter(|(idx, kind)| {
                state.announced.contains(idx) || offered.contains(kind.to_string().as_str())
            });
        Ok(SessionDescription::answer(self.session_sdp(0, senders)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let gather = {
            let mut state = self.state.lock();
            let listed: Vec<usize> = listed_senders(&desc.sdp).map(|(idx, _)| idx).collect();
            state.announced.extend(listed);
            state.local_desc = Some(desc);
            !std::mem::replace(&mut state.gathered, true)
        };
        if gather {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host generation 0 ufrag {}",
                    self.local
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            };
            self.sink.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.check_connected();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().remote_desc = Some(desc);
        self.check_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote_desc.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.senders.push(Some(track.clone()));
        state.sender_kinds.push(track.kind());
        let idx = u32::try_from(state.senders.len() - 1)
            .map_err(|_| TransportError::Backend("too many senders".to_string()))?;
        Ok(SenderId(idx))
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let slot = state
            .senders
            .get_mut(sender.0 as usize)
            .ok_or_else(|| TransportError::Negotiation(format!("unknown sender {}", sender.0)))?;
        *slot = track.cloned();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        if let Some(counterpart) = self.counterpart() {
            if !counterpart.is_closed() {
                counterpart
                    .sink
                    .emit(PeerEvent::StateChanged(PeerState::Disconnected));
            }
        }
        Ok(())
    }
}

/// `(index, kind)` of every sender a loopback description lists
fn listed_senders(sdp: &str) -> impl Iterator<Item = (usize, &str)> {
    sdp.lines().filter_map(|line| {
        let (idx, kind) = line.strip_prefix("a=sender:")?.split_once(' ')?;
        Some((idx.parse().ok()?, kind))
    })
}

struct RoomSeat {
    identity: MemberId,
    sink: RelayEventSink,
    published: HashMap<MediaKind, String>,
}

impl RoomSeat {
    fn participant(&self) -> RelayParticipant {
        RelayParticipant {
            audio_published: self.published.contains_key(&MediaKind::Audio),
            video_published: self.published.contains_key(&MediaKind::Video),
            screen_published: self.published.contains_key(&MediaKind::ScreenShare),
            ..RelayParticipant::new(self.identity.clone())
        }
    }
}

fn relay_track_id(identity: &MemberId, kind: MediaKind) -> String {
    format!("{identity}/{kind}")
}

/// In-memory relay; rooms are keyed by token
#[derive(Default)]
pub struct LoopbackRelayServer {
    rooms: Mutex<HashMap<String, Vec<RoomSeat>>>,
    refuse: AtomicBool,
    fail_publish: AtomicBool,
}

impl LoopbackRelayServer {
    /// Create a server with no rooms
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector for participant `identity`
    pub fn connector(self: &Arc<Self>, identity: MemberId) -> Arc<LoopbackRelayConnector> {
        Arc::new(LoopbackRelayConnector {
            server: self.clone(),
            identity,
        })
    }

    /// Identities in the room, sorted
    pub fn participants(&self, token: &str) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .rooms
            .lock()
            .get(token)
            .map(|seats| seats.iter().map(|s| s.identity.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Refuse new connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Fail every publish
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Report a connection failure to one participant
    pub fn fail_connection(&self, token: &str, identity: &MemberId) -> bool {
        let rooms = self.rooms.lock();
        rooms
            .get(token)
            .and_then(|seats| seats.iter().find(|s| s.identity == *identity))
            .is_some_and(|seat| {
                seat.sink.emit(RelayEvent::ConnectionStateChanged(
                    RelayConnectionState::Failed,
                ))
            })
    }

    fn broadcast(seats: &[RoomSeat], from: &MemberId, event: &RelayEvent) {
        for seat in seats.iter().filter(|s| s.identity != *from) {
            seat.sink.emit(event.clone());
        }
    }

    fn join(&self, token: &str, identity: MemberId, sink: RelayEventSink) {
        let mut rooms = self.rooms.lock();
        let seats = rooms.entry(token.to_string()).or_default();
        seats.retain(|s| s.identity != identity);

        let seat = RoomSeat {
            identity: identity.clone(),
            sink,
            published: HashMap::new(),
        };
        seat.sink
            .emit(RelayEvent::ConnectionStateChanged(RelayConnectionState::Connected));
        seat.sink
            .emit(RelayEvent::ParticipantConnected(seat.participant()));
        for existing in seats.iter() {
            seat.sink
                .emit(RelayEvent::ParticipantConnected(existing.participant()));
            for kind in existing.published.keys() {
                seat.sink.emit(RelayEvent::TrackSubscribed {
                    track: RemoteTrack::new(relay_track_id(&existing.identity, *kind), *kind),
                    source: *kind,
                    participant: existing.identity.clone(),
                });
            }
        }
        Self::broadcast(
            seats,
            &identity,
            &RelayEvent::ParticipantConnected(seat.participant()),
        );
        seats.push(seat);
    }
}

/// Connector of one participant on a [`LoopbackRelayServer`]
pub struct LoopbackRelayConnector {
    server: Arc<LoopbackRelayServer>,
    identity: MemberId,
}

#[async_trait]
impl RelayConnector for LoopbackRelayConnector {
    async fn connect(
        &self,
        token: &str,
        _options: RelayConnectOptions,
        events: RelayEventSink,
    ) -> Result<Arc<dyn RelayRoom>, RelayError> {
        if self.server.refuse.load(Ordering::SeqCst) {
            return Err(RelayError::Connect("relay unreachable".to_string()));
        }
        self.server.join(token, self.identity.clone(), events);
        Ok(Arc::new(LoopbackRelayRoom {
            server: self.server.clone(),
            token: token.to_string(),
            identity: self.identity.clone(),
        }))
    }
}

/// A joined loopback room
pub struct LoopbackRelayRoom {
    server: Arc<LoopbackRelayServer>,
    token: String,
    identity: MemberId,
}

impl LoopbackRelayRoom {
    fn with_seats<R>(
        &self,
        f: impl FnOnce(&mut Vec<RoomSeat>) -> Result<R, RelayError>,
    ) -> Result<R, RelayError> {
        let mut rooms = self.server.rooms.lock();
        let seats = rooms.get_mut(&self.token).ok_or(RelayError::Closed)?;
        f(seats)
    }
}

#[async_trait]
impl RelayRoom for LoopbackRelayRoom {
    fn local_participant(&self) -> MemberId {
        self.identity.clone()
    }

    async fn publish(&self, kind: MediaKind, _track: &LocalTrack) -> Result<(), RelayError> {
        if self.server.fail_publish.load(Ordering::SeqCst) {
            return Err(RelayError::Publish("publish rejected".to_string()));
        }
        self.with_seats(|seats| {
            let seat = seats
                .iter_mut()
                .find(|s| s.identity == self.identity)
                .ok_or(RelayError::Closed)?;
            let track_id = relay_track_id(&self.identity, kind);
            seat.published.insert(kind, track_id.clone());
            LoopbackRelayServer::broadcast(
                seats,
                &self.identity,
                &RelayEvent::TrackSubscribed {
                    track: RemoteTrack::new(track_id, kind),
                    source: kind,
                    participant: self.identity.clone(),
                },
            );
            Ok(())
        })
    }

    async fn unpublish(&self, kind: MediaKind) -> Result<(), RelayError> {
        self.with_seats(|seats| {
            let seat = seats
                .iter_mut()
                .find(|s| s.identity == self.identity)
                .ok_or(RelayError::Closed)?;
            if let Some(track_id) = seat.published.remove(&kind) {
                LoopbackRelayServer::broadcast(
                    seats,
                    &self.identity,
                    &RelayEvent::TrackUnsubscribed {
                        track_id,
                        source: kind,
                        participant: self.identity.clone(),
                    },
                );
            }
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        let mut rooms = self.server.rooms.lock();
        let Some(seats) = rooms.get_mut(&self.token) else {
            return Ok(());
        };
        let before = seats.len();
        seats.retain(|s| s.identity != self.identity);
        if seats.len() != before {
            LoopbackRelayServer::broadcast(
                seats,
                &self.identity,
                &RelayEvent::ParticipantDisconnected(self.identity.clone()),
            );
        }
        if seats.is_empty() {
            rooms.remove(&self.token);
        }
        Ok(())
    }
}

/// Operation received by [`RecordingCallRecords`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOp {
    /// `mark_failed`
    MarkFailed(CallId),
    /// `mark_declined`
    MarkDeclined(CallId),
    /// `update`
    Update(CallId, CallStatus),
    /// `room_token`
    RoomToken(CallId),
}

/// Call record service that remembers what it was asked to do
#[derive(Default)]
pub struct RecordingCallRecords {
    ops: Mutex<Vec<RecordOp>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl RecordingCallRecords {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations received, in order
    pub fn ops(&self) -> Vec<RecordOp> {
        self.ops.lock().clone()
    }

    /// Make every operation fail after being recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every operation hang after being recorded
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn record(&self, op: RecordOp) -> anyhow::Result<()> {
        self.ops.lock().push(op);
        if self.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("call record service unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl CallRecordService for RecordingCallRecords {
    async fn mark_failed(&self, call_id: CallId) -> anyhow::Result<()> {
        self.record(RecordOp::MarkFailed(call_id)).await
    }

    async fn mark_declined(&self, call_id: CallId) -> anyhow::Result<()> {
        self.record(RecordOp::MarkDeclined(call_id)).await
    }

    async fn update(&self, call_id: CallId, update: CallRecordUpdate) -> anyhow::Result<()> {
        self.record(RecordOp::Update(call_id, update.status)).await
    }

    async fn room_token(&self, call_id: CallId, _chat_id: &ChatId) -> anyhow::Result<String> {
        self.record(RecordOp::RoomToken(call_id)).await?;
        Ok(format!("room-{call_id}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::CallResponse;
    use crate::transport::TransportEvent;

    #[tokio::test]
    async fn test_hub_delivers_chat_events_to_others() {
        let hub = LoopbackHub::new();
        let chat = ChatId::new("chat");
        let (alice_gw, mut alice_rx) = hub.register(MemberId::new("alice"));
        let (_bob_gw, mut bob_rx) = hub.register(MemberId::new("bob"));
        hub.join(&chat, &MemberId::new("alice"));
        hub.join(&chat, &MemberId::new("bob"));

        let event = SignalingEvent::Reject(CallResponse {
            call_id: CallId::new(),
            chat_id: chat.clone(),
            is_caller_cancel: true,
        });
        alice_gw
            .send(SignalTarget::Chat(chat), event.clone())
            .await
            .unwrap();

        assert_eq!(bob_rx.try_recv().unwrap(), (MemberId::new("alice"), event));
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(hub.sent_by(&MemberId::new("alice")).len(), 1);
    }

    #[tokio::test]
    async fn test_links_connect_and_deliver_tracks() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = (MemberId::new("alice"), MemberId::new("bob"));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = network
            .transport(alice.clone())
            .create_peer(&bob, PeerEventSink::new(bob.clone(), a_tx))
            .await
            .unwrap();
        let b = network
            .transport(bob.clone())
            .create_peer(&alice, PeerEventSink::new(alice.clone(), b_tx))
            .await
            .unwrap();

        a.add_track(&LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut bob_tracks = 0;
        while let Ok(TransportEvent::Peer { event, .. }) = b_rx.try_recv() {
            if let PeerEvent::RemoteTrack(track) = event {
                assert_eq!(track.kind(), MediaKind::Audio);
                bob_tracks += 1;
            }
        }
        assert_eq!(bob_tracks, 1);

        let mut alice_connected = false;
        while let Ok(TransportEvent::Peer { event, .. }) = a_rx.try_recv() {
            if matches!(event, PeerEvent::StateChanged(PeerState::Connected)) {
                alice_connected = true;
            }
        }
        assert!(alice_connected);
    }

    #[tokio::test]
    async fn test_only_negotiated_senders_are_delivered() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = (MemberId::new("alice"), MemberId::new("bob"));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network
            .transport(alice.clone())
            .create_peer(&bob, PeerEventSink::new(bob.clone(), a_tx))
            .await
            .unwrap();
        let b = network
            .transport(bob.clone())
            .create_peer(&alice, PeerEventSink::new(alice.clone(), b_tx))
            .await
            .unwrap();
        let remote_kinds = |rx: &mut mpsc::UnboundedReceiver<TransportEvent>| {
            let mut kinds = Vec::new();
            while let Ok(TransportEvent::Peer { event, .. }) = rx.try_recv() {
                if let PeerEvent::RemoteTrack(track) = event {
                    kinds.push(track.kind());
                }
            }
            kinds
        };

        a.add_track(&LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap();
        b.add_track(&LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap();
        b.add_track(&LocalTrack::new("cam", MediaKind::Video))
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        a.add_track(&LocalTrack::new("screen", MediaKind::ScreenShare))
            .await
            .unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(remote_kinds(&mut b_rx), vec![MediaKind::Audio]);
        assert_eq!(remote_kinds(&mut a_rx), vec![MediaKind::Audio]);

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        assert_eq!(remote_kinds(&mut b_rx), vec![MediaKind::ScreenShare]);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = network
            .transport(MemberId::new("alice"))
            .create_peer(&MemberId::new("bob"), PeerEventSink::new(MemberId::new("bob"), tx))
            .await
            .unwrap();
        let result = link.add_ice_candidate(IceCandidate::new("c")).await;
        assert!(matches!(result, Err(TransportError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_record_service_issues_room_tokens() {
        let records = RecordingCallRecords::new();
        let call_id = CallId::new();
        let token = records.room_token(call_id, &ChatId::new("c")).await.unwrap();
        assert_eq!(token, format!("room-{call_id}"));
        assert_eq!(records.ops(), vec![RecordOp::RoomToken(call_id)]);
    }
}
