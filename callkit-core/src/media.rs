//! Local media device management
//!
//! [`MediaDeviceController`] is the only owner of local capture streams
//! (microphone, camera, screen). It acquires them through a [`MediaDevices`]
//! backend, keeps at most one live track per [`MediaKind`], and drives
//! device toggles against whichever topology manager is active through the
//! [`TrackPublisher`] seam.
//!
//! # Teardown races
//!
//! Acquisitions are not cancellable. Instead every acquisition records the
//! controller's generation when it starts; [`MediaDeviceController::release_all`]
//! bumps the generation, and an acquisition that completes under a newer
//! generation stops its track and fails with
//! [`MediaError::DeviceUnavailable`].

use crate::track::LocalTrack;
use crate::types::{LocalDeviceState, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User declined access to the device
    #[error("Permission denied for {0} device")]
    PermissionDenied(MediaKind),

    /// Device missing, busy, or released while being acquired
    #[error("{kind} device unavailable: {reason}")]
    DeviceUnavailable {
        /// Device kind
        kind: MediaKind,
        /// Why the device could not be used
        reason: String,
    },

    /// Track could not be attached to or detached from the live connections
    #[error("Track propagation failed: {0}")]
    Publish(String),
}

impl MediaError {
    /// Shorthand for [`MediaError::DeviceUnavailable`]
    pub fn unavailable(kind: MediaKind, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            kind,
            reason: reason.into(),
        }
    }
}

/// Constraints passed to a device acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceConstraints {
    /// Preferred resolution, frame rate and processing
    Preferred,
    /// Whatever the device can deliver
    Relaxed,
}

/// Device backend
///
/// Implementations prompt for permission where the platform requires it and
/// return a live track. Stopping the returned track must release the device.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a capture track of the given kind
    async fn acquire(
        &self,
        kind: MediaKind,
        constraints: DeviceConstraints,
    ) -> Result<LocalTrack, MediaError>;
}

/// Propagates local tracks to every live connection of a call
///
/// Implemented by both topology managers: the mesh attaches to each peer
/// connection, the relay publishes through its SDK.
#[async_trait]
pub trait TrackPublisher: Send + Sync {
    /// Start sending `track` as the local track of `kind`
    async fn attach_local_track(&self, kind: MediaKind, track: LocalTrack)
        -> Result<(), MediaError>;

    /// Stop sending media of `kind`
    async fn detach_local_track(&self, kind: MediaKind) -> Result<(), MediaError>;
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// A capture track started
    TrackStarted {
        /// Track kind
        kind: MediaKind,
        /// Track identifier
        track_id: String,
    },
    /// A capture track stopped
    TrackStopped {
        /// Track kind
        kind: MediaKind,
        /// Track identifier
        track_id: String,
    },
    /// Hardware in-use indicator turned on or off
    IndicatorChanged {
        /// Whether any device is capturing
        active: bool,
    },
}

#[derive(Default)]
struct Slots {
    tracks: HashMap<MediaKind, LocalTrack>,
    generation: u64,
}

impl Slots {
    fn any_live(&self) -> bool {
        self.tracks.values().any(LocalTrack::is_live)
    }

    fn live(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.get(&kind).filter(|t| t.is_live())
    }
}

/// Owner of local capture streams
pub struct MediaDeviceController {
    devices: Arc<dyn MediaDevices>,
    retry_relaxed: bool,
    slots: Mutex<Slots>,
    toggle_lock: tokio::sync::Mutex<()>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaDeviceController {
    /// Create a controller over a device backend
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, retry_relaxed: bool) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            retry_relaxed,
            slots: Mutex::new(Slots::default()),
            toggle_lock: tokio::sync::Mutex::new(()),
            event_sender,
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or [`MediaError::DeviceUnavailable`]
    pub async fn acquire_voice(&self) -> Result<LocalTrack, MediaError> {
        self.acquire(MediaKind::Audio).await
    }

    /// Acquire the camera
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or [`MediaError::DeviceUnavailable`],
    /// the latter also when a release raced the acquisition
    pub async fn acquire_video(&self) -> Result<LocalTrack, MediaError> {
        self.acquire(MediaKind::Video).await
    }

    /// Acquire a screen capture
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or [`MediaError::DeviceUnavailable`]
    pub async fn acquire_screen(&self) -> Result<LocalTrack, MediaError> {
        self.acquire(MediaKind::ScreenShare).await
    }

    /// Acquire a track of `kind`, reusing the live one if there is one
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or [`MediaError::DeviceUnavailable`]
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MediaError> {
        let generation = {
            let slots = self.slots.lock();
            if let Some(track) = slots.live(kind) {
                return Ok(track.clone());
            }
            slots.generation
        };

        let track = self.acquire_from_device(kind).await?;

        let mut slots = self.slots.lock();
        if slots.generation != generation {
            drop(slots);
            track.stop();
            tracing::debug!("Devices released during acquisition, discarding track");
            return Err(MediaError::unavailable(
                kind,
                "released while the acquisition was in flight",
            ));
        }
        if let Some(existing) = slots.live(kind).cloned() {
            drop(slots);
            track.stop();
            return Ok(existing);
        }
        let first = !slots.any_live();
        slots.tracks.insert(kind, track.clone());
        drop(slots);

        tracing::info!(track_id = %track.id(), "Local track acquired");
        let _ = self.event_sender.send(MediaEvent::TrackStarted {
            kind,
            track_id: track.id().to_string(),
        });
        if first {
            let _ = self
                .event_sender
                .send(MediaEvent::IndicatorChanged { active: true });
        }
        Ok(track)
    }

    async fn acquire_from_device(&self, kind: MediaKind) -> Result<LocalTrack, MediaError> {
        match self
            .devices
            .acquire(kind, DeviceConstraints::Preferred)
            .await
        {
            Err(MediaError::DeviceUnavailable { reason, .. }) if self.retry_relaxed => {
                tracing::warn!(%kind, %reason, "Device unavailable, retrying with relaxed constraints");
                self.devices.acquire(kind, DeviceConstraints::Relaxed).await
            }
            other => other,
        }
    }

    /// Stop and drop the track of `kind`. Idempotent.
    ///
    /// Returns `true` if a track was released.
    pub fn release(&self, kind: MediaKind) -> bool {
        let (track, indicator_off) = {
            let mut slots = self.slots.lock();
            let track = slots.tracks.remove(&kind);
            let was_live = track.as_ref().is_some_and(LocalTrack::is_live);
            (track, was_live && !slots.any_live())
        };
        let Some(track) = track else {
            return false;
        };
        self.stopped(kind, &track);
        if indicator_off {
            let _ = self
                .event_sender
                .send(MediaEvent::IndicatorChanged { active: false });
        }
        true
    }

    /// Release every track and invalidate in-flight acquisitions
    pub fn release_all(&self) {
        let (tracks, was_active) = {
            let mut slots = self.slots.lock();
            slots.generation += 1;
            let was_active = slots.any_live();
            (std::mem::take(&mut slots.tracks), was_active)
        };
        for (kind, track) in tracks {
            self.stopped(kind, &track);
        }
        if was_active {
            let _ = self
                .event_sender
                .send(MediaEvent::IndicatorChanged { active: false });
        }
        tracing::debug!("All local media released");
    }

    fn stopped(&self, kind: MediaKind, track: &LocalTrack) {
        if track.stop() {
            tracing::info!(%kind, track_id = %track.id(), "Local track released");
        }
        let _ = self.event_sender.send(MediaEvent::TrackStopped {
            kind,
            track_id: track.id().to_string(),
        });
    }

    /// Live track of `kind`
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.slots.lock().live(kind).cloned()
    }

    /// All live tracks
    #[must_use]
    pub fn tracks(&self) -> Vec<LocalTrack> {
        let slots = self.slots.lock();
        MediaKind::ALL
            .into_iter()
            .filter_map(|kind| slots.live(kind).cloned())
            .collect()
    }

    /// Whether media of `kind` is currently captured
    #[must_use]
    pub fn is_sending(&self, kind: MediaKind) -> bool {
        self.slots.lock().live(kind).is_some()
    }

    /// Outgoing media flags derived from the live tracks
    #[must_use]
    pub fn device_state(&self) -> LocalDeviceState {
        let slots = self.slots.lock();
        LocalDeviceState {
            is_muted: slots.live(MediaKind::Audio).is_none(),
            is_video_enabled: slots.live(MediaKind::Video).is_some(),
            is_screen_sharing: slots.live(MediaKind::ScreenShare).is_some(),
        }
    }

    /// Whether the hardware in-use indicator should be lit
    #[must_use]
    pub fn indicator_active(&self) -> bool {
        self.slots.lock().any_live()
    }

    /// Flip media of `kind` on or off across all live connections
    ///
    /// Returns whether media of `kind` is being sent afterwards.
    ///
    /// # Errors
    ///
    /// Returns the acquisition or propagation error; local state is then
    /// what it was before the toggle
    pub async fn toggle(
        &self,
        kind: MediaKind,
        publisher: &dyn TrackPublisher,
    ) -> Result<bool, MediaError> {
        let _guard = self.toggle_lock.lock().await;
        let enable = !self.is_sending(kind);
        self.apply(kind, enable, publisher).await
    }

    /// Turn media of `kind` on or off; a no-op if already in that state
    ///
    /// # Errors
    ///
    /// Same as [`MediaDeviceController::toggle`]
    pub async fn set_sending(
        &self,
        kind: MediaKind,
        enable: bool,
        publisher: &dyn TrackPublisher,
    ) -> Result<bool, MediaError> {
        let _guard = self.toggle_lock.lock().await;
        if self.is_sending(kind) == enable {
            return Ok(enable);
        }
        self.apply(kind, enable, publisher).await
    }

    #[tracing::instrument(skip(self, publisher))]
    async fn apply(
        &self,
        kind: MediaKind,
        enable: bool,
        publisher: &dyn TrackPublisher,
    ) -> Result<bool, MediaError> {
        if !enable {
            publisher.detach_local_track(kind).await?;
            self.release(kind);
            return Ok(false);
        }

        let track = self.acquire(kind).await?;
        if let Err(e) = publisher.attach_local_track(kind, track).await {
            tracing::warn!(error = %e, "Attaching local track failed, rolling back");
            if let Err(detach_err) = publisher.detach_local_track(kind).await {
                tracing::warn!(error = %detach_err, "Rollback detach failed");
            }
            self.release(kind);
            return Err(e);
        }
        Ok(true)
    }
}
