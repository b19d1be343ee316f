//! Call session lifecycle
//!
//! [`CallSessionController`] owns the single active [`CallSession`] and drives
//! it through its states:
//!
//! ```text
//!  (none) ──start_call──► Outgoing ──call.accept──► Connecting ──first remote media──► Connected
//!  (none) ─call.initiate─► Outgoing (callee) ──accept_call──► Connecting
//!
//!  Outgoing ──answer timeout──► Canceled (caller) / Missed (callee)
//!  Outgoing ──call.reject──► Rejected (caller) / Missed (callee, caller withdrew)
//!  Connecting ──negotiation or transport failure──► Failed
//!  Connected ──hang up / last member leaves──► Ended
//! ```
//!
//! Media work is delegated to the [`MediaDeviceController`], connection work
//! to a [`PeerMeshManager`] (direct calls) or a [`RelaySessionManager`] (group
//! calls). Transport callbacks of the active call are drained by one pump
//! task, so they are handled one at a time and in order.
//!
//! Teardown is race-safe: whoever moves the session into its terminal state
//! first performs the cleanup, every other caller of
//! [`CallSessionController::end_call`] returns immediately.

use crate::config::CallConfig;
use crate::identity::{ChatId, MemberId};
use crate::media::{MediaDeviceController, MediaDevices, MediaError, TrackPublisher};
use crate::mesh::PeerMeshManager;
use crate::record::{CallRecordService, CallRecordUpdate, RecordAction};
use crate::registry::{CallMember, CallMemberRegistry, MemberEvent, MemberInfo, MemberUpdate};
use crate::relay::{RelayConnectionState, RelayConnector, RelayError, RelayOutcome, RelaySessionManager};
use crate::signaling::{
    CallInitiate, CallResponse, MemberUpdatePayload, SignalInbox, SignalTarget, SignalingError, SignalingEvent,
    SignalingGateway, SignalingHandler,
};
use crate::transport::{PeerEvent, PeerState, PeerTransport, TransportError, TransportEvent};
use crate::types::{
    CallDirection, CallId, CallOptions, CallSession, CallState, EndReason, LocalDeviceState,
    MediaKind, Topology,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The user declined access to a device
    #[error("Permission denied for {0} device")]
    PermissionDenied(MediaKind),

    /// A device could not be used
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Negotiation, transport or relay failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A signaling send was not accepted in time
    #[error("Signaling timed out")]
    SignalingTimeout,

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Another call is still active or being torn down
    #[error("Another call is in progress")]
    CallInProgress,

    /// Operation not allowed in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Controller is misconfigured
    #[error("Configuration error: {0}")]
    Config(String),
}

/// The four failure categories surfaced to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Permission denied
    PermissionDenied,
    /// Device unavailable
    DeviceUnavailable,
    /// Connection failed
    ConnectionFailed,
    /// Signaling timeout
    SignalingTimeout,
}

impl CallError {
    /// User-visible category of a failure; `None` for API misuse
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::PermissionDenied(_) => Some(FailureKind::PermissionDenied),
            Self::DeviceUnavailable(_) => Some(FailureKind::DeviceUnavailable),
            Self::ConnectionFailed(_) => Some(FailureKind::ConnectionFailed),
            Self::SignalingTimeout => Some(FailureKind::SignalingTimeout),
            Self::NoActiveCall | Self::CallInProgress | Self::InvalidState(_) | Self::Config(_) => {
                None
            }
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(kind) => CallError::PermissionDenied(kind),
            MediaError::DeviceUnavailable { .. } => CallError::DeviceUnavailable(err.to_string()),
            MediaError::Publish(reason) => CallError::ConnectionFailed(reason),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Timeout(_) => CallError::SignalingTimeout,
            other => CallError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::ConnectionFailed(err.to_string())
    }
}

impl From<RelayError> for CallError {
    fn from(err: RelayError) -> Self {
        CallError::ConnectionFailed(err.to_string())
    }
}

/// Call events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// We placed a call
    CallPlaced {
        /// Call identifier
        call_id: CallId,
        /// Conversation being called
        chat_id: ChatId,
        /// Video call flag
        is_video_call: bool,
        /// Group call flag
        is_group_call: bool,
    },
    /// Someone is calling us
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Conversation of the call
        chat_id: ChatId,
        /// Caller
        from: MemberId,
        /// Video call flag
        is_video_call: bool,
        /// Group call flag
        is_group_call: bool,
    },
    /// Lifecycle transition
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// A remote member joined
    MemberJoined {
        /// Call identifier
        call_id: CallId,
        /// Member identity
        member_id: MemberId,
        /// Display name
        display_name: String,
    },
    /// A remote member left
    MemberLeft {
        /// Call identifier
        call_id: CallId,
        /// Member identity
        member_id: MemberId,
    },
    /// Flags or tracks of a remote member changed
    MemberUpdated {
        /// Call identifier
        call_id: CallId,
        /// Member identity
        member_id: MemberId,
        /// Microphone muted
        is_muted: bool,
        /// Camera on
        is_video_enabled: bool,
        /// Screen being shared
        is_screen_sharing: bool,
    },
    /// Local outgoing media changed
    LocalMediaChanged {
        /// Call identifier
        call_id: CallId,
        /// Resulting flags
        state: LocalDeviceState,
    },
    /// The call is over and every resource is released
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Terminal state
        state: CallState,
        /// Talk time, if the call connected
        duration_secs: Option<i64>,
    },
}

impl CallEvent {
    /// Call the event belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::CallPlaced { call_id, .. }
            | Self::IncomingCall { call_id, .. }
            | Self::StateChanged { call_id, .. }
            | Self::MemberJoined { call_id, .. }
            | Self::MemberLeft { call_id, .. }
            | Self::MemberUpdated { call_id, .. }
            | Self::LocalMediaChanged { call_id, .. }
            | Self::CallEnded { call_id, .. } => *call_id,
        }
    }

    fn from_member(call_id: CallId, event: MemberEvent) -> Self {
        match event {
            MemberEvent::Joined {
                member_id,
                display_name,
            } => Self::MemberJoined {
                call_id,
                member_id,
                display_name,
            },
            MemberEvent::Left { member_id } => Self::MemberLeft { call_id, member_id },
            MemberEvent::Updated {
                member_id,
                is_muted,
                is_video_enabled,
                is_screen_sharing,
            } => Self::MemberUpdated {
                call_id,
                member_id,
                is_muted,
                is_video_enabled,
                is_screen_sharing,
            },
        }
    }
}

#[derive(Clone)]
enum ActiveTopology {
    Mesh(Arc<PeerMeshManager>),
    Relay(Arc<RelaySessionManager>),
}

impl ActiveTopology {
    fn publisher(&self) -> Arc<dyn TrackPublisher> {
        match self {
            Self::Mesh(mesh) => mesh.clone() as Arc<dyn TrackPublisher>,
            Self::Relay(relay) => relay.clone() as Arc<dyn TrackPublisher>,
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Mesh(mesh) => mesh.close().await,
            Self::Relay(relay) => relay.disconnect().await,
        }
    }
}

struct ActiveCall {
    session: CallSession,
    registry: Arc<CallMemberRegistry>,
    topology: ActiveTopology,
    answer_timer: Option<JoinHandle<()>>,
    pump_shutdown: Option<oneshot::Sender<()>>,
    released: bool,
    timed_out: bool,
}

impl ActiveCall {
    fn blocks_new_call(&self) -> bool {
        !self.session.is_terminal() || !self.released
    }

    fn live(&self) -> Option<LiveCall> {
        if self.session.is_terminal() {
            return None;
        }
        Some(LiveCall {
            call_id: self.session.call_id,
            chat_id: self.session.chat_id.clone(),
            options: self.session.options(),
            direction: self.session.direction,
            state: self.session.state,
            remote_party: self.session.remote_party.clone(),
            topology: self.topology.clone(),
            registry: self.registry.clone(),
        })
    }
}

/// Snapshot of the non-terminal active call, usable across awaits
#[derive(Clone)]
struct LiveCall {
    call_id: CallId,
    chat_id: ChatId,
    options: CallOptions,
    direction: CallDirection,
    state: CallState,
    remote_party: Option<MemberId>,
    topology: ActiveTopology,
    registry: Arc<CallMemberRegistry>,
}

struct Teardown {
    old_state: CallState,
    new_state: CallState,
    timed_out: bool,
    duration_secs: Option<i64>,
    answer_timer: Option<JoinHandle<()>>,
    pump_shutdown: Option<oneshot::Sender<()>>,
    topology: ActiveTopology,
    registry: Arc<CallMemberRegistry>,
}

struct Inner {
    local_member: MemberId,
    config: CallConfig,
    signaling: SignalingHandler,
    records: Arc<dyn CallRecordService>,
    media: Arc<MediaDeviceController>,
    peer_transport: Arc<dyn PeerTransport>,
    relay_connector: Arc<dyn RelayConnector>,
    event_sender: broadcast::Sender<CallEvent>,
    slot: Mutex<Option<ActiveCall>>,
    toggle_order: tokio::sync::Mutex<()>,
}

/// Orchestrates the single active call of this participant
///
/// Cheap to clone; clones share the same call.
#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<Inner>,
}

impl CallSessionController {
    /// Start building a controller for participant `local_member`
    #[must_use]
    pub fn builder(local_member: MemberId) -> CallSessionControllerBuilder {
        CallSessionControllerBuilder::new(local_member)
    }

    /// Check whether a non-terminal transition is allowed
    ///
    /// Terminal states are reached only through teardown, which accepts any
    /// non-terminal state.
    #[must_use]
    pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
        matches!(
            (from, to),
            (CallState::Outgoing, CallState::Connecting) | (CallState::Connecting, CallState::Connected)
        )
    }

    /// Identity of this participant
    #[must_use]
    pub fn local_member(&self) -> &MemberId {
        &self.inner.local_member
    }

    /// Controller configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Local device controller
    #[must_use]
    pub fn media(&self) -> &Arc<MediaDeviceController> {
        &self.inner.media
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Snapshot of the current (or last) session
    #[must_use]
    pub fn session(&self) -> Option<CallSession> {
        self.inner.slot.lock().as_ref().map(|c| c.session.clone())
    }

    /// State of the current (or last) session
    #[must_use]
    pub fn state(&self) -> Option<CallState> {
        self.inner.slot.lock().as_ref().map(|c| c.session.state)
    }

    /// Identifier of the current (or last) session
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.inner.slot.lock().as_ref().map(|c| c.session.call_id)
    }

    /// Whether a new call would be refused
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner
            .slot
            .lock()
            .as_ref()
            .is_some_and(ActiveCall::blocks_new_call)
    }

    /// Remote members of the active call
    #[must_use]
    pub fn members(&self) -> Vec<CallMember> {
        let registry = self.inner.slot.lock().as_ref().map(|c| c.registry.clone());
        registry.map(|r| r.members()).unwrap_or_default()
    }

    /// Local outgoing media flags
    #[must_use]
    pub fn local_device_state(&self) -> LocalDeviceState {
        self.inner.media.device_state()
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_sender.send(event);
    }

    fn with_call<R>(&self, call_id: CallId, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut slot = self.inner.slot.lock();
        slot.as_mut().filter(|c| c.session.call_id == call_id).map(f)
    }

    fn live_call(&self) -> Result<LiveCall, CallError> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .and_then(ActiveCall::live)
            .ok_or(CallError::NoActiveCall)
    }

    fn live_call_for(&self, call_id: CallId) -> Option<LiveCall> {
        self.with_call(call_id, |call| call.live()).flatten()
    }

    fn state_of(&self, call_id: CallId) -> Option<CallState> {
        self.with_call(call_id, |call| call.session.state)
    }

    fn member_registry(&self, call_id: CallId) -> CallMemberRegistry {
        let sender = self.inner.event_sender.clone();
        CallMemberRegistry::with_listener(move |event| {
            let _ = sender.send(CallEvent::from_member(call_id, event));
        })
    }

    fn new_call(
        &self,
        call_id: CallId,
        chat_id: ChatId,
        options: CallOptions,
        direction: CallDirection,
        remote_party: Option<MemberId>,
    ) -> Result<LiveCall, CallError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let registry = Arc::new(self.member_registry(call_id));
        let topology = match options.topology() {
            Topology::Mesh => ActiveTopology::Mesh(Arc::new(PeerMeshManager::new(
                call_id,
                chat_id.clone(),
                self.inner.peer_transport.clone(),
                self.inner.signaling.clone(),
                registry.clone(),
                events_tx,
            ))),
            Topology::Relay => ActiveTopology::Relay(Arc::new(RelaySessionManager::new(
                call_id,
                self.inner.local_member.clone(),
                options.is_video_call,
                self.inner.relay_connector.clone(),
                registry.clone(),
                events_tx,
            ))),
        };

        let live = {
            let mut slot = self.inner.slot.lock();
            if slot.as_ref().is_some_and(ActiveCall::blocks_new_call) {
                return Err(CallError::CallInProgress);
            }
            let mut session = CallSession::new(call_id, chat_id, options, direction);
            session.remote_party = remote_party;
            let call = ActiveCall {
                session,
                registry,
                topology,
                answer_timer: None,
                pump_shutdown: Some(shutdown_tx),
                released: false,
                timed_out: false,
            };
            let live = call.live();
            *slot = Some(call);
            live
        };

        self.spawn_pump(call_id, events_rx, shutdown_rx);
        tracing::info!(
            call_id = %call_id,
            direction = ?direction,
            topology = ?options.topology(),
            "Call session created"
        );
        live.ok_or(CallError::NoActiveCall)
    }

    fn spawn_pump(
        &self,
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        CallSessionController { inner }
                            .on_transport_event(call_id, event)
                            .await;
                    }
                }
            }
            tracing::debug!(call_id = %call_id, "Transport event pump stopped");
        });
    }

    fn arm_answer_timer(&self, call_id: CallId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.answer_timeout;
        let mut handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                CallSessionController { inner }
                    .on_answer_timeout(call_id)
                    .await;
            }
        }));
        self.with_call(call_id, |call| {
            if call.session.state == CallState::Outgoing {
                call.answer_timer = handle.take();
            }
        });
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn on_answer_timeout(&self, call_id: CallId) {
        let unanswered = self
            .with_call(call_id, |call| {
                if call.session.state != CallState::Outgoing {
                    return None;
                }
                // dropping our own handle detaches the running timer task
                call.answer_timer.take();
                call.timed_out = true;
                Some((call.session.direction, call.session.chat_id.clone()))
            })
            .flatten();
        let Some((direction, chat_id)) = unanswered else {
            return;
        };

        tracing::info!(call_id = %call_id, direction = ?direction, "Call unanswered");
        if direction == CallDirection::Outgoing {
            self.send_response(call_id, &chat_id, true, true).await;
        }
        self.finish(call_id, EndReason::Timeout).await;
    }

    fn transition(&self, call_id: CallId, to: CallState) -> bool {
        let change = self
            .with_call(call_id, |call| {
                let from = call.session.state;
                if !Self::is_valid_transition(from, to) {
                    return None;
                }
                call.session.state = to;
                if to == CallState::Connected {
                    call.session.connected_at = Some(Utc::now());
                }
                let timer = if from == CallState::Outgoing {
                    call.answer_timer.take()
                } else {
                    None
                };
                Some((from, timer))
            })
            .flatten();
        let Some((from, timer)) = change else {
            return false;
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        tracing::info!(
            call_id = %call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state: from,
            new_state: to,
        });
        true
    }

    async fn advance_to_connected(&self, call: &LiveCall) {
        self.transition(call.call_id, CallState::Connecting);
        if self.transition(call.call_id, CallState::Connected) {
            let _order = self.inner.toggle_order.lock().await;
            let local = self.inner.media.device_state();
            let full = MemberUpdate {
                is_muted: Some(local.is_muted),
                is_video_enabled: Some(local.is_video_enabled),
                is_screen_sharing: Some(local.is_screen_sharing),
            };
            self.announce(call, full).await;
        }
    }

    async fn announce(&self, call: &LiveCall, update: MemberUpdate) {
        let event = SignalingEvent::MemberUpdate(MemberUpdatePayload {
            call_id: call.call_id,
            member_id: self.inner.local_member.clone(),
            is_muted: update.is_muted,
            is_video_enabled: update.is_video_enabled,
            is_screen_sharing: update.is_screen_sharing,
        });
        if let Err(e) = self
            .inner
            .signaling
            .send(SignalTarget::Chat(call.chat_id.clone()), event)
            .await
        {
            tracing::warn!(call_id = %call.call_id, error = %e, "Member update not announced");
        }
    }

    fn sync_local_state(&self, call_id: CallId) -> LocalDeviceState {
        let state = self.inner.media.device_state();
        let current = self
            .with_call(call_id, |call| call.session.local = state)
            .is_some();
        if current {
            self.emit(CallEvent::LocalMediaChanged { call_id, state });
        }
        state
    }

    async fn send_response(&self, call_id: CallId, chat_id: &ChatId, reject: bool, is_caller_cancel: bool) {
        let response = CallResponse {
            call_id,
            chat_id: chat_id.clone(),
            is_caller_cancel,
        };
        let event = if reject {
            SignalingEvent::Reject(response)
        } else {
            SignalingEvent::Accept(response)
        };
        if let Err(e) = self
            .inner
            .signaling
            .send(SignalTarget::Chat(chat_id.clone()), event)
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "Best-effort call response not delivered");
        }
    }

    /// Place a call in a conversation
    ///
    /// Acquires local media and prepares the topology before `call.initiate`
    /// is sent, so nobody is rung for a call that cannot work locally.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallInProgress`] while another call is active or
    /// being released; any setup failure ends the call as `Failed` and is
    /// returned once
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_member))]
    pub async fn start_call(&self, chat_id: ChatId, options: CallOptions) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        let call = self.new_call(call_id, chat_id.clone(), options, CallDirection::Outgoing, None)?;
        self.emit(CallEvent::CallPlaced {
            call_id,
            chat_id: chat_id.clone(),
            is_video_call: options.is_video_call,
            is_group_call: options.is_group_call,
        });

        if let Err(e) = self.setup_local(&call).await {
            tracing::warn!(call_id = %call_id, error = %e, "Call setup failed");
            self.finish(call_id, EndReason::Failed).await;
            return Err(e);
        }

        self.arm_answer_timer(call_id);
        let initiate = SignalingEvent::Initiate(CallInitiate {
            call_id,
            chat_id: chat_id.clone(),
            is_video_call: options.is_video_call,
            is_group_call: options.is_group_call,
        });
        if let Err(e) = self
            .inner
            .signaling
            .send(SignalTarget::Chat(chat_id), initiate)
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "Could not ring the conversation");
            self.finish(call_id, EndReason::Failed).await;
            return Err(e.into());
        }
        Ok(call_id)
    }

    /// Answer the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] or [`CallError::InvalidState`] if
    /// nothing is ringing. A setup failure declines the call, ends it as
    /// `Failed`, and surfaces as [`CallError::PermissionDenied`] or
    /// [`CallError::DeviceUnavailable`] for media, [`CallError::ConnectionFailed`]
    /// otherwise.
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_member))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let call = self.live_call()?;
        if call.direction != CallDirection::Incoming || call.state != CallState::Outgoing {
            return Err(CallError::InvalidState(call.state));
        }

        let setup = async {
            self.setup_local(&call).await?;
            if let (ActiveTopology::Mesh(mesh), Some(caller)) = (&call.topology, &call.remote_party) {
                mesh.create_connection(MemberInfo::new(caller.clone())).await?;
            }
            Ok::<(), CallError>(())
        };
        if let Err(e) = setup.await {
            tracing::warn!(call_id = %call.call_id, error = %e, "Accepting call failed");
            self.send_response(call.call_id, &call.chat_id, true, false).await;
            self.finish(call.call_id, EndReason::Failed).await;
            return Err(e);
        }

        self.transition(call.call_id, CallState::Connecting);
        let accept = SignalingEvent::Accept(CallResponse {
            call_id: call.call_id,
            chat_id: call.chat_id.clone(),
            is_caller_cancel: false,
        });
        if let Err(e) = self
            .inner
            .signaling
            .send(SignalTarget::Chat(call.chat_id.clone()), accept)
            .await
        {
            self.finish(call.call_id, EndReason::Failed).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Decline the ringing call (`is_cancel == false`) or withdraw our own
    /// (`is_cancel == true`)
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] if there is no call
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_member))]
    pub async fn reject_call(&self, is_cancel: bool) -> Result<(), CallError> {
        let call = self.live_call()?;
        self.send_response(call.call_id, &call.chat_id, true, is_cancel)
            .await;
        let reason = if is_cancel {
            EndReason::Canceled
        } else {
            EndReason::Rejected
        };
        self.finish(call.call_id, reason).await;
        Ok(())
    }

    /// End the active call. Idempotent and safe to call concurrently.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for teardown errors that
    /// must reach the caller
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_member))]
    pub async fn end_call(&self, reason: EndReason) -> Result<(), CallError> {
        if let Some(call_id) = self.call_id() {
            self.finish(call_id, reason).await;
        }
        Ok(())
    }

    async fn setup_local(&self, call: &LiveCall) -> Result<(), CallError> {
        let media = &self.inner.media;
        let voice = media.acquire_voice().await?;
        let camera = if call.options.is_video_call {
            Some(media.acquire_video().await?)
        } else {
            None
        };

        match &call.topology {
            ActiveTopology::Mesh(mesh) => {
                mesh.attach_track(MediaKind::Audio, voice).await?;
                if let Some(camera) = camera {
                    mesh.attach_track(MediaKind::Video, camera).await?;
                }
            }
            ActiveTopology::Relay(relay) => {
                let token = self.room_token(call).await?;
                relay.connect(&token).await?;
                relay.publish_track(MediaKind::Audio, voice).await?;
                if let Some(camera) = camera {
                    relay.publish_track(MediaKind::Video, camera).await?;
                }
            }
        }

        self.sync_local_state(call.call_id);
        if self.live_call_for(call.call_id).is_none() {
            return Err(CallError::NoActiveCall);
        }
        Ok(())
    }

    async fn room_token(&self, call: &LiveCall) -> Result<String, CallError> {
        let request = self.inner.records.room_token(call.call_id, &call.chat_id);
        match tokio::time::timeout(self.inner.config.record_timeout, request).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(e)) => Err(CallError::ConnectionFailed(format!("relay token: {e}"))),
            Err(_) => Err(CallError::ConnectionFailed(
                "relay token request timed out".to_string(),
            )),
        }
    }

    async fn finish(&self, call_id: CallId, reason: EndReason) -> bool {
        let teardown = self
            .with_call(call_id, |call| {
                if call.session.is_terminal() {
                    return None;
                }
                let old_state = call.session.state;
                let new_state = reason.terminal_state(call.session.direction);
                call.session.state = new_state;
                call.session.ended_at = Some(Utc::now());
                Some(Teardown {
                    old_state,
                    new_state,
                    timed_out: call.timed_out,
                    duration_secs: call.session.duration().map(|d| d.num_seconds()),
                    answer_timer: call.answer_timer.take(),
                    pump_shutdown: call.pump_shutdown.take(),
                    topology: call.topology.clone(),
                    registry: call.registry.clone(),
                })
            })
            .flatten();
        let Some(teardown) = teardown else {
            return false;
        };

        tracing::info!(
            call_id = %call_id,
            old_state = ?teardown.old_state,
            new_state = ?teardown.new_state,
            reason = ?reason,
            "Call ending"
        );
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state: teardown.old_state,
            new_state: teardown.new_state,
        });

        if let Some(timer) = teardown.answer_timer {
            timer.abort();
        }
        if let Some(shutdown) = teardown.pump_shutdown {
            let _ = shutdown.send(());
        }
        teardown.topology.shutdown().await;
        teardown.registry.clear();
        self.inner.media.release_all();

        let local = self.inner.media.device_state();
        self.with_call(call_id, |call| {
            call.session.local = local;
            call.released = true;
        });
        self.emit(CallEvent::CallEnded {
            call_id,
            state: teardown.new_state,
            duration_secs: teardown.duration_secs,
        });
        tracing::debug!(call_id = %call_id, "Call resources released");

        self.update_record(call_id, teardown.new_state, teardown.timed_out)
            .await;
        true
    }

    async fn update_record(&self, call_id: CallId, state: CallState, timed_out: bool) {
        let Some(action) = RecordAction::for_terminal(state, timed_out) else {
            return;
        };
        let records = self.inner.records.clone();
        let request = async move {
            match action {
                RecordAction::MarkFailed => records.mark_failed(call_id).await,
                RecordAction::MarkDeclined => records.mark_declined(call_id).await,
                RecordAction::Update(status) => {
                    records
                        .update(
                            call_id,
                            CallRecordUpdate {
                                status,
                                ended_at: Utc::now(),
                            },
                        )
                        .await
                }
            }
        };
        match tokio::time::timeout(self.inner.config.record_timeout, request).await {
            Ok(Ok(())) => tracing::debug!(call_id = %call_id, ?state, "Call record updated"),
            Ok(Err(e)) => tracing::warn!(call_id = %call_id, error = %e, "Call record update failed"),
            Err(_) => tracing::warn!(call_id = %call_id, "Call record update timed out"),
        }
    }

    /// Handle an inbound signaling event from `from`
    ///
    /// Events for calls other than the active one are ignored, except
    /// `call.initiate`, which is declined while busy.
    ///
    /// # Errors
    ///
    /// Returns the error of a call-level step that ended the call
    #[tracing::instrument(skip(self, event), fields(local = %self.inner.local_member, event_type = event.event_type()))]
    pub async fn handle_signal(&self, from: MemberId, event: SignalingEvent) -> Result<(), CallError> {
        if from == self.inner.local_member {
            return Ok(());
        }

        if let SignalingEvent::Initiate(initiate) = event {
            return self.on_initiate(from, initiate).await;
        }

        let Some(call) = self.live_call_for(event.call_id()) else {
            tracing::debug!(call_id = %event.call_id(), "Ignoring signal for inactive call");
            return Ok(());
        };

        match event {
            SignalingEvent::Initiate(_) => Ok(()),
            SignalingEvent::Accept(_) => self.on_accept(&call, from).await,
            SignalingEvent::Reject(response) => {
                self.on_reject(&call, from, response.is_caller_cancel).await;
                Ok(())
            }
            SignalingEvent::Offer(payload) => {
                if let ActiveTopology::Mesh(mesh) = &call.topology {
                    if let Err(e) = mesh.apply_remote_offer(&from, payload.sdp).await {
                        tracing::warn!(call_id = %call.call_id, member_id = %from, error = %e, "Remote offer failed");
                        self.on_peer_lost(&call, &from).await;
                    }
                }
                Ok(())
            }
            SignalingEvent::Answer(payload) => {
                if let ActiveTopology::Mesh(mesh) = &call.topology {
                    if let Err(e) = mesh.apply_remote_answer(&from, payload.sdp).await {
                        tracing::warn!(call_id = %call.call_id, member_id = %from, error = %e, "Remote answer failed");
                        self.on_peer_lost(&call, &from).await;
                    }
                }
                Ok(())
            }
            SignalingEvent::IceCandidate(payload) => {
                if let ActiveTopology::Mesh(mesh) = &call.topology {
                    if let Err(e) = mesh.add_ice_candidate(&from, payload.candidate).await {
                        tracing::debug!(call_id = %call.call_id, error = %e, "Dropped remote candidate");
                    }
                }
                Ok(())
            }
            SignalingEvent::MemberUpdate(payload) => {
                if payload.member_id != from {
                    tracing::debug!(member_id = %payload.member_id, %from, "Ignoring update about another member");
                    return Ok(());
                }
                call.registry
                    .apply_update(&payload.member_id, &MemberUpdate::from(&payload));
                Ok(())
            }
        }
    }

    async fn on_initiate(&self, from: MemberId, initiate: CallInitiate) -> Result<(), CallError> {
        if self.call_id() == Some(initiate.call_id) {
            return Ok(());
        }
        let options = CallOptions {
            is_video_call: initiate.is_video_call,
            is_group_call: initiate.is_group_call,
        };
        match self.new_call(
            initiate.call_id,
            initiate.chat_id.clone(),
            options,
            CallDirection::Incoming,
            Some(from.clone()),
        ) {
            Ok(_) => {
                self.arm_answer_timer(initiate.call_id);
                tracing::info!(call_id = %initiate.call_id, caller = %from, "Incoming call");
                self.emit(CallEvent::IncomingCall {
                    call_id: initiate.call_id,
                    chat_id: initiate.chat_id,
                    from,
                    is_video_call: initiate.is_video_call,
                    is_group_call: initiate.is_group_call,
                });
                Ok(())
            }
            Err(CallError::CallInProgress) => {
                tracing::info!(call_id = %initiate.call_id, caller = %from, "Busy, declining incoming call");
                self.send_response(initiate.call_id, &initiate.chat_id, true, false)
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_accept(&self, call: &LiveCall, from: MemberId) -> Result<(), CallError> {
        if call.direction != CallDirection::Outgoing {
            return Ok(());
        }
        if call.options.is_group_call {
            self.transition(call.call_id, CallState::Connecting);
            return Ok(());
        }
        if call.state != CallState::Outgoing {
            return Ok(());
        }

        self.with_call(call.call_id, |c| c.session.remote_party = Some(from.clone()));
        self.transition(call.call_id, CallState::Connecting);
        if let ActiveTopology::Mesh(mesh) = &call.topology {
            if let Err(e) = mesh.add_member(MemberInfo::new(from.clone()), true).await {
                tracing::warn!(call_id = %call.call_id, member_id = %from, error = %e, "Could not offer to callee");
                self.send_response(call.call_id, &call.chat_id, true, false)
                    .await;
                self.finish(call.call_id, EndReason::Failed).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn on_reject(&self, call: &LiveCall, from: MemberId, is_caller_cancel: bool) {
        match (call.direction, call.state) {
            (CallDirection::Outgoing, CallState::Outgoing) if !call.options.is_group_call => {
                tracing::info!(call_id = %call.call_id, callee = %from, "Call declined");
                self.finish(call.call_id, EndReason::Rejected).await;
            }
            (CallDirection::Incoming, CallState::Outgoing)
                if is_caller_cancel && call.remote_party.as_ref() == Some(&from) =>
            {
                tracing::info!(call_id = %call.call_id, caller = %from, "Caller withdrew");
                self.finish(call.call_id, EndReason::Missed).await;
            }
            (_, CallState::Connecting | CallState::Connected) => {
                self.on_peer_lost(call, &from).await;
            }
            _ => {
                tracing::debug!(call_id = %call.call_id, %from, "Ignoring call.reject");
            }
        }
    }

    async fn on_transport_event(&self, call_id: CallId, event: TransportEvent) {
        let Some(call) = self.live_call_for(call_id) else {
            return;
        };
        match (event, &call.topology) {
            (TransportEvent::Peer { member_id, event }, ActiveTopology::Mesh(mesh)) => match event {
                PeerEvent::LocalCandidate(candidate) => {
                    if let Err(e) = mesh.forward_local_candidate(&member_id, candidate).await {
                        tracing::debug!(%member_id, error = %e, "Local candidate not forwarded");
                    }
                }
                PeerEvent::RemoteTrack(track) => {
                    if mesh.on_remote_track(&member_id, track) {
                        self.advance_to_connected(&call).await;
                    }
                }
                PeerEvent::RemoteTrackEnded { track_id } => {
                    mesh.on_remote_track_ended(&member_id, &track_id);
                }
                PeerEvent::StateChanged(state) if state.is_lost() => {
                    tracing::info!(call_id = %call_id, %member_id, ?state, "Peer connection lost");
                    self.on_peer_lost(&call, &member_id).await;
                }
                PeerEvent::StateChanged(state) => {
                    tracing::debug!(call_id = %call_id, %member_id, ?state, "Peer state changed");
                }
            },
            (TransportEvent::Relay(event), ActiveTopology::Relay(relay)) => match relay.apply_event(event) {
                RelayOutcome::MemberJoined(_) | RelayOutcome::TrackChanged(_) => {
                    self.advance_to_connected(&call).await;
                }
                RelayOutcome::MemberLeft { remaining: 0, .. } => {
                    if matches!(
                        self.state_of(call_id),
                        Some(CallState::Connecting | CallState::Connected)
                    ) {
                        self.finish(call_id, EndReason::Hangup).await;
                    }
                }
                RelayOutcome::Lost(RelayConnectionState::Failed) => {
                    self.finish(call_id, EndReason::Failed).await;
                }
                RelayOutcome::Lost(_) => {
                    self.finish(call_id, EndReason::Hangup).await;
                }
                RelayOutcome::MemberLeft { .. } | RelayOutcome::Connected | RelayOutcome::Ignored => {}
            },
            (event, _) => {
                tracing::debug!(call_id = %call_id, ?event, "Event does not match call topology");
            }
        }
    }

    async fn on_peer_lost(&self, call: &LiveCall, member_id: &MemberId) {
        let ActiveTopology::Mesh(mesh) = &call.topology else {
            return;
        };
        if !mesh.member_ids().await.contains(member_id) {
            return;
        }
        let Ok(remaining) = mesh.teardown(member_id).await else {
            return;
        };
        if remaining > 0 {
            return;
        }
        let reason = if self.state_of(call.call_id) == Some(CallState::Connected) {
            EndReason::Hangup
        } else {
            EndReason::Failed
        };
        self.finish(call.call_id, reason).await;
    }

    /// Add a participant to the active call
    ///
    /// On a mesh this creates the connection and sends the offer. Relay
    /// participants join the room on their own.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] or the connection failure
    #[tracing::instrument(skip(self, info), fields(member_id = %info.member_id))]
    pub async fn add_call_member(&self, info: MemberInfo) -> Result<(), CallError> {
        let call = self.live_call()?;
        match &call.topology {
            ActiveTopology::Mesh(mesh) => {
                mesh.add_member(info, true).await?;
            }
            ActiveTopology::Relay(_) => {
                tracing::debug!("Relay participants join through the room");
            }
        }
        Ok(())
    }

    /// Drop a participant; ends the call when nobody is left
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] if there is no call
    #[tracing::instrument(skip(self))]
    pub async fn remove_call_member(&self, member_id: &MemberId) -> Result<(), CallError> {
        let call = self.live_call()?;
        let remaining = match &call.topology {
            ActiveTopology::Mesh(mesh) => mesh.teardown(member_id).await?,
            ActiveTopology::Relay(relay) => match relay.on_participant_disconnected(member_id) {
                RelayOutcome::MemberLeft { remaining, .. } => remaining,
                _ => relay.participant_count(),
            },
        };
        if remaining == 0 {
            self.finish(call.call_id, EndReason::Hangup).await;
        }
        Ok(())
    }

    /// Toggle the microphone
    ///
    /// # Errors
    ///
    /// Returns the device or propagation failure; state is rolled back and
    /// the call continues
    pub async fn toggle_mute(&self) -> Result<LocalDeviceState, CallError> {
        self.toggle(MediaKind::Audio).await
    }

    /// Toggle the camera
    ///
    /// # Errors
    ///
    /// Same as [`CallSessionController::toggle_mute`]
    pub async fn toggle_video(&self) -> Result<LocalDeviceState, CallError> {
        self.toggle(MediaKind::Video).await
    }

    /// Toggle screen sharing
    ///
    /// # Errors
    ///
    /// Same as [`CallSessionController::toggle_mute`]
    pub async fn toggle_screen_share(&self) -> Result<LocalDeviceState, CallError> {
        self.toggle(MediaKind::ScreenShare).await
    }

    #[tracing::instrument(skip(self), fields(local = %self.inner.local_member))]
    async fn toggle(&self, kind: MediaKind) -> Result<LocalDeviceState, CallError> {
        // Held through the announcement so member updates leave in toggle order
        let _order = self.inner.toggle_order.lock().await;
        let call = self.live_call()?;
        let publisher = call.topology.publisher();
        let result = self.inner.media.toggle(kind, publisher.as_ref()).await;
        let state = self.sync_local_state(call.call_id);

        self.announce(&call, MemberUpdate::for_kind(kind, state.is_sending(kind)))
            .await;

        match result {
            Ok(sending) => {
                tracing::info!(call_id = %call.call_id, %kind, sending, "Local media toggled");
                Ok(state)
            }
            Err(e) => {
                tracing::warn!(call_id = %call.call_id, %kind, error = %e, "Toggle failed, state restored");
                Err(e.into())
            }
        }
    }

    /// Feed an inbound signaling channel into [`CallSessionController::handle_signal`]
    ///
    /// The task ends when the channel closes or the controller is dropped.
    pub fn spawn_signal_listener(&self, mut inbox: SignalInbox) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some((from, event)) = inbox.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let controller = CallSessionController { inner };
                if let Err(e) = controller.handle_signal(from, event).await {
                    tracing::warn!(error = %e, "Signal handling failed");
                }
            }
        })
    }
}

/// Builder for [`CallSessionController`]
pub struct CallSessionControllerBuilder {
    local_member: MemberId,
    config: CallConfig,
    gateway: Option<Arc<dyn SignalingGateway>>,
    records: Option<Arc<dyn CallRecordService>>,
    devices: Option<Arc<dyn MediaDevices>>,
    peer_transport: Option<Arc<dyn PeerTransport>>,
    relay_connector: Option<Arc<dyn RelayConnector>>,
}

impl CallSessionControllerBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local_member: MemberId) -> Self {
        Self {
            local_member,
            config: CallConfig::default(),
            gateway: None,
            records: None,
            devices: None,
            peer_transport: None,
            relay_connector: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signaling gateway
    #[must_use]
    pub fn with_signaling(mut self, gateway: Arc<dyn SignalingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the call record service
    #[must_use]
    pub fn with_records(mut self, records: Arc<dyn CallRecordService>) -> Self {
        self.records = Some(records);
        self
    }

    /// Set the device backend
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the mesh peer transport
    ///
    /// Without one, builds with the `webrtc-backend` feature use an
    /// `RtcPeerTransport` over [`CallConfig::ice_servers`].
    #[must_use]
    pub fn with_peer_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.peer_transport = Some(transport);
        self
    }

    /// Set the relay connector
    #[must_use]
    pub fn with_relay_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.relay_connector = Some(connector);
        self
    }

    /// Build the controller
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Config`] if a collaborator is missing
    pub fn build(self) -> Result<CallSessionController, CallError> {
        fn required<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> Result<Arc<T>, CallError> {
            value.ok_or_else(|| CallError::Config(format!("{name} not set")))
        }

        let gateway = required(self.gateway, "signaling gateway")?;
        let records = required(self.records, "call record service")?;
        let devices = required(self.devices, "media devices")?;
        let peer_transport: Arc<dyn PeerTransport> = match self.peer_transport {
            Some(transport) => transport,
            #[cfg(feature = "webrtc-backend")]
            None => Arc::new(
                crate::rtc::RtcPeerTransport::new(self.config.ice_servers.clone())
                    .map_err(|e| CallError::Config(format!("peer transport: {e}")))?,
            ),
            #[cfg(not(feature = "webrtc-backend"))]
            None => return Err(CallError::Config("peer transport not set".to_string())),
        };
        let relay_connector = required(self.relay_connector, "relay connector")?;
        if self.config.event_buffer == 0 {
            return Err(CallError::Config("event_buffer must be positive".to_string()));
        }

        let (event_sender, _) = broadcast::channel(self.config.event_buffer);
        let media = Arc::new(MediaDeviceController::new(
            devices,
            self.config.retry_relaxed_constraints,
        ));
        let signaling = SignalingHandler::new(gateway, self.config.signaling_timeout);

        Ok(CallSessionController {
            inner: Arc::new(Inner {
                local_member: self.local_member,
                config: self.config,
                signaling,
                records,
                media,
                peer_transport,
                relay_connector,
                event_sender,
                slot: Mutex::new(None),
                toggle_order: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevices, LoopbackHub, LoopbackNetwork, LoopbackRelayServer, RecordingCallRecords};

    fn controller(member: &str) -> CallSessionController {
        let hub = LoopbackHub::new();
        let (gateway, _inbox) = hub.register(MemberId::new(member));
        CallSessionController::builder(MemberId::new(member))
            .with_signaling(gateway)
            .with_records(Arc::new(RecordingCallRecords::new()))
            .with_devices(Arc::new(LoopbackDevices::new()))
            .with_peer_transport(LoopbackNetwork::new().transport(MemberId::new(member)))
            .with_relay_connector(LoopbackRelayServer::new().connector(MemberId::new(member)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_transitions() {
        assert!(CallSessionController::is_valid_transition(
            CallState::Outgoing,
            CallState::Connecting
        ));
        assert!(CallSessionController::is_valid_transition(
            CallState::Connecting,
            CallState::Connected
        ));
        assert!(!CallSessionController::is_valid_transition(
            CallState::Outgoing,
            CallState::Connected
        ));
        assert!(!CallSessionController::is_valid_transition(
            CallState::Connected,
            CallState::Connecting
        ));
        assert!(!CallSessionController::is_valid_transition(
            CallState::Ended,
            CallState::Connecting
        ));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            CallError::from(MediaError::PermissionDenied(MediaKind::Video)),
            CallError::PermissionDenied(MediaKind::Video)
        );
        assert_eq!(
            CallError::from(MediaError::unavailable(MediaKind::Audio, "busy")).failure_kind(),
            Some(FailureKind::DeviceUnavailable)
        );
        assert_eq!(
            CallError::from(SignalingError::Timeout(std::time::Duration::from_secs(1))),
            CallError::SignalingTimeout
        );
        assert_eq!(
            CallError::from(TransportError::Closed).failure_kind(),
            Some(FailureKind::ConnectionFailed)
        );
        assert_eq!(CallError::CallInProgress.failure_kind(), None);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = CallSessionController::builder(MemberId::new("alice")).build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[cfg(feature = "webrtc-backend")]
    #[test]
    fn test_builder_defaults_to_rtc_transport() {
        let hub = LoopbackHub::new();
        let (gateway, _inbox) = hub.register(MemberId::new("alice"));
        let config = CallConfig {
            ice_servers: vec!["stun:stun.example.org:3478".to_string()],
            ..CallConfig::default()
        };
        let controller = CallSessionController::builder(MemberId::new("alice"))
            .with_config(config)
            .with_signaling(gateway)
            .with_records(Arc::new(RecordingCallRecords::new()))
            .with_devices(Arc::new(LoopbackDevices::new()))
            .with_relay_connector(LoopbackRelayServer::new().connector(MemberId::new("alice")))
            .build()
            .unwrap();
        assert_eq!(controller.config().ice_servers, vec!["stun:stun.example.org:3478"]);
    }

    #[cfg(not(feature = "webrtc-backend"))]
    #[test]
    fn test_builder_requires_peer_transport_without_backend() {
        let hub = LoopbackHub::new();
        let (gateway, _inbox) = hub.register(MemberId::new("alice"));
        let result = CallSessionController::builder(MemberId::new("alice"))
            .with_signaling(gateway)
            .with_records(Arc::new(RecordingCallRecords::new()))
            .with_devices(Arc::new(LoopbackDevices::new()))
            .with_relay_connector(LoopbackRelayServer::new().connector(MemberId::new("alice")))
            .build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_operations_without_call() {
        let controller = controller("alice");
        assert_eq!(controller.accept_call().await, Err(CallError::NoActiveCall));
        assert_eq!(controller.toggle_mute().await, Err(CallError::NoActiveCall));
        assert_eq!(controller.end_call(EndReason::Hangup).await, Ok(()));
        assert!(!controller.is_busy());
        assert!(controller.session().is_none());
    }

    #[tokio::test]
    async fn test_second_call_is_refused() {
        let controller = controller("alice");
        controller
            .start_call(ChatId::new("chat"), CallOptions::audio_call())
            .await
            .unwrap();
        assert_eq!(
            controller
                .start_call(ChatId::new("other"), CallOptions::audio_call())
                .await,
            Err(CallError::CallInProgress)
        );

        controller.end_call(EndReason::Canceled).await.unwrap();
        assert!(!controller.is_busy());
        assert_eq!(controller.state(), Some(CallState::Canceled));
    }
}
