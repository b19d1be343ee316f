//! Callkit - call-session orchestration for chat applications
//!
//! This library drives audio/video calls between the members of a
//! conversation. It features:
//!
//! - **Call lifecycle**: a single active call per participant, moved through
//!   `Outgoing -> Connecting -> Connected` and into exactly one terminal state
//! - **Two topologies**: a direct peer mesh for one-to-one calls and a relay
//!   (SFU) session for group calls
//! - **Local devices**: microphone, camera and screen capture with
//!   rollback-safe toggling and guaranteed release at teardown
//! - **Pluggable edges**: signaling transport, relay connector, peer backend,
//!   capture devices and the call-record service are traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use callkit_core::loopback::{
//!     LoopbackDevices, LoopbackHub, LoopbackNetwork, LoopbackRelayServer, RecordingCallRecords,
//! };
//! use callkit_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let alice = MemberId::new("alice");
//! let hub = LoopbackHub::new();
//! let (gateway, inbox) = hub.register(alice.clone());
//!
//! let controller = CallSessionController::builder(alice.clone())
//!     .with_config(CallConfig::default())
//!     .with_signaling(gateway)
//!     .with_records(Arc::new(RecordingCallRecords::new()))
//!     .with_devices(Arc::new(LoopbackDevices::new()))
//!     .with_peer_transport(LoopbackNetwork::new().transport(alice.clone()))
//!     .with_relay_connector(LoopbackRelayServer::new().connector(alice))
//!     .build()?;
//! controller.spawn_signal_listener(inbox);
//!
//! let call_id = controller
//!     .start_call(ChatId::new("team"), CallOptions::video_call())
//!     .await?;
//! println!("ringing: {call_id}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Member and conversation identities
pub mod identity;

/// Controller configuration
pub mod config;

/// Local and remote media track handles
pub mod track;

/// Call signaling protocol
pub mod signaling;

/// Call record service contract
pub mod record;

/// Local capture devices
pub mod media;

/// Remote members of the active call
pub mod registry;

/// Peer connection seam
pub mod transport;

/// Direct-call peer mesh
pub mod mesh;

/// Group-call relay session
pub mod relay;

/// Call session controller
pub mod call;

/// In-memory collaborators
pub mod loopback;

/// Mesh backend on the `webrtc` crate
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

pub use call::{CallError, CallEvent, CallSessionController, CallSessionControllerBuilder, FailureKind};
pub use config::CallConfig;
pub use identity::{ChatId, MemberId};
pub use media::{
    DeviceConstraints, MediaDeviceController, MediaDevices, MediaError, MediaEvent, TrackPublisher,
};
pub use mesh::{IceCandidateBuffer, PeerMeshManager};
pub use record::{CallRecordService, CallRecordUpdate, CallStatus, RecordAction};
pub use registry::{CallMember, CallMemberRegistry, MemberEvent, MemberInfo, MemberUpdate};
pub use relay::{
    RelayConnectionState, RelayConnector, RelayError, RelayEvent, RelayParticipant, RelayRoom,
    RelaySessionManager,
};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcPeerTransport, SampleTrackDevices};
pub use signaling::{
    SignalInbox, SignalTarget, SignalingError, SignalingEvent, SignalingGateway, SignalingHandler,
};
pub use track::{LocalTrack, RemoteTrack};
pub use transport::{PeerEvent, PeerLink, PeerState, PeerTransport, TransportError, TransportEvent};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallEvent, CallSessionController, FailureKind};
    pub use crate::config::CallConfig;
    pub use crate::identity::{ChatId, MemberId};
    pub use crate::media::{MediaDevices, MediaError};
    pub use crate::record::CallRecordService;
    pub use crate::registry::{CallMember, MemberInfo};
    pub use crate::signaling::{SignalTarget, SignalingEvent, SignalingGateway};
    pub use crate::types::{
        CallDirection, CallId, CallOptions, CallSession, CallState, EndReason, LocalDeviceState,
        MediaKind, Topology,
    };
}
