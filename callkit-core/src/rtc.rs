//! Mesh backend on the `webrtc` crate
//!
//! [`RtcPeerTransport`] creates one `RTCPeerConnection` per remote member and
//! reports its callbacks through the [`PeerEventSink`]. Local tracks are
//! `TrackLocalStaticSample`s produced by [`SampleTrackDevices`]; the media
//! kind travels as the msid stream id so the receiving side can tell camera
//! from screen.

use crate::identity::MemberId;
use crate::media::{DeviceConstraints, MediaDevices, MediaError};
use crate::track::{LocalTrack, RemoteTrack};
use crate::transport::{
    PeerEvent, PeerEventSink, PeerLink, PeerState, PeerTransport, SenderId, TransportError,
};
use crate::types::{IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn backend_error(e: webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video | MediaKind::ScreenShare => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// Creates `RTCPeerConnection`s with default codecs and interceptors
pub struct RtcPeerTransport {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerTransport {
    /// Create a transport using the given STUN/TURN URLs
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backend`] if codec or interceptor
    /// registration fails
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    #[tracing::instrument(skip(self, events))]
    async fn create_peer(
        &self,
        member_id: &MemberId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(backend_error)?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::debug!(error = %e, "Unserializable local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::StateChanged(peer_state(state)));
            })
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = MediaKind::from_stream_tag(&track.stream_id()).unwrap_or(
                        match track.kind() {
                            RTPCodecType::Audio => MediaKind::Audio,
                            _ => MediaKind::Video,
                        },
                    );
                    let track_id = track.id();
                    tracing::debug!(member_id = %sink.member_id(), %track_id, %kind, "Remote track");

                    let remote = RemoteTrack::with_backing(track_id.clone(), kind, track.clone());
                    if !sink.emit(PeerEvent::RemoteTrack(remote)) {
                        return;
                    }
                    // an RTP read error means the remote track ended
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        sink.emit(PeerEvent::RemoteTrackEnded { track_id });
                    });
                })
            },
        ));

        tracing::debug!(%member_id, "Created peer connection");
        Ok(Arc::new(RtcPeerLink {
            pc,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(0),
        }))
    }
}

/// One `RTCPeerConnection`
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU32,
}

impl RtcPeerLink {
    fn local_track(track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, TransportError> {
        let sample = track
            .backing::<TrackLocalStaticSample>()
            .ok_or_else(|| TransportError::Backend(format!("track {} has no sample backing", track.id())))?;
        Ok(sample)
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let converted = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        converted.map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError> {
        let sender = self
            .pc
            .add_track(Self::local_track(track)?)
            .await
            .map_err(backend_error)?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().insert(id, sender);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<(), TransportError> {
        let rtp_sender = self
            .senders
            .lock()
            .get(&sender)
            .cloned()
            .ok_or_else(|| TransportError::Backend(format!("unknown sender {}", sender.0)))?;
        let replacement = track.map(Self::local_track).transpose()?;
        rtp_sender
            .replace_track(replacement)
            .await
            .map_err(backend_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(backend_error)
    }
}

/// Capture devices producing `TrackLocalStaticSample`s
///
/// The application writes encoded samples into the backing track; this type
/// only manages availability.
#[derive(Default)]
pub struct SampleTrackDevices {
    disabled: Mutex<HashSet<MediaKind>>,
    counter: AtomicU64,
}

impl SampleTrackDevices {
    /// All device kinds available
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device kind as present or absent
    pub fn set_available(&self, kind: MediaKind, available: bool) {
        let mut disabled = self.disabled.lock();
        if available {
            disabled.remove(&kind);
        } else {
            disabled.insert(kind);
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&self, kind: MediaKind, constraints: DeviceConstraints) -> Result<LocalTrack, MediaError> {
        if self.disabled.lock().contains(&kind) {
            return Err(MediaError::unavailable(kind, "no such device"));
        }
        let id = format!("{kind}-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            kind.stream_tag().to_string(),
        ));
        tracing::debug!(track_id = %id, %kind, ?constraints, "Created sample track");
        Ok(LocalTrack::with_backing(id, kind, sample))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sample_devices_tag_stream_with_kind() {
        let devices = SampleTrackDevices::new();
        let track = devices
            .acquire(MediaKind::ScreenShare, DeviceConstraints::Preferred)
            .await
            .unwrap();
        let sample = track.backing::<TrackLocalStaticSample>().unwrap();
        assert_eq!(sample.stream_id(), MediaKind::ScreenShare.stream_tag());
        assert_eq!(
            MediaKind::from_stream_tag(sample.stream_id()),
            Some(MediaKind::ScreenShare)
        );

        devices.set_available(MediaKind::Video, false);
        assert!(matches!(
            devices.acquire(MediaKind::Video, DeviceConstraints::Relaxed).await,
            Err(MediaError::DeviceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_offer_contains_added_track() {
        let transport = RtcPeerTransport::new(vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = MemberId::new("bob");
        let link = transport
            .create_peer(&bob, PeerEventSink::new(bob.clone(), tx))
            .await
            .unwrap();

        let devices = SampleTrackDevices::new();
        let voice = devices
            .acquire(MediaKind::Audio, DeviceConstraints::Preferred)
            .await
            .unwrap();
        let sender = link.add_track(&voice).await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        link.replace_track(sender, None).await.unwrap();
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_track_without_sample_backing_is_rejected() {
        let transport = RtcPeerTransport::new(vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = MemberId::new("bob");
        let link = transport
            .create_peer(&bob, PeerEventSink::new(bob.clone(), tx))
            .await
            .unwrap();

        let bare = LocalTrack::new("audio-x", MediaKind::Audio);
        assert!(matches!(
            link.add_track(&bare).await,
            Err(TransportError::Backend(_))
        ));
        link.close().await.unwrap();
    }
}
