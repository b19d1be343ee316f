//! Local and remote media track handles
//!
//! Handles are cheap to clone and share one lifecycle: stopping any clone
//! stops the track for every holder. Backends attach their own track object
//! (for example a webrtc `TrackLocalStaticSample`) as an opaque backing and
//! downcast it back when they need it.

use crate::types::MediaKind;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backend-specific track object
pub type TrackBacking = Arc<dyn Any + Send + Sync>;

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackCore {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
    backing: Option<TrackBacking>,
}

impl TrackCore {
    fn new(id: String, kind: MediaKind, backing: Option<TrackBacking>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            live: AtomicBool::new(true),
            on_stop: Mutex::new(None),
            backing,
        })
    }

    fn stop(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        let hook = self.on_stop.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    fn backing<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.backing.clone()?.downcast::<T>().ok()
    }
}

/// A track captured from a local device
#[derive(Clone)]
pub struct LocalTrack {
    core: Arc<TrackCore>,
}

impl LocalTrack {
    /// Create a live local track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            core: TrackCore::new(id.into(), kind, None),
        }
    }

    /// Create a live local track wrapping a backend track object
    pub fn with_backing(id: impl Into<String>, kind: MediaKind, backing: TrackBacking) -> Self {
        Self {
            core: TrackCore::new(id.into(), kind, Some(backing)),
        }
    }

    /// Register a hook that runs once when the track is stopped
    ///
    /// Device backends use this to release the capture device.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        *self.core.on_stop.lock() = Some(Box::new(hook));
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Media kind (and declared source)
    pub fn kind(&self) -> MediaKind {
        self.core.kind
    }

    /// Whether the track is still capturing
    pub fn is_live(&self) -> bool {
        self.core.live.load(Ordering::SeqCst)
    }

    /// Stop capturing. Returns `false` if the track was already stopped.
    pub fn stop(&self) -> bool {
        self.core.stop()
    }

    /// Downcast the backend track object
    pub fn backing<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.core.backing::<T>()
    }

    /// Whether both handles refer to the same track
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    core: Arc<TrackCore>,
}

impl RemoteTrack {
    /// Create a live remote track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            core: TrackCore::new(id.into(), kind, None),
        }
    }

    /// Create a live remote track wrapping a backend track object
    pub fn with_backing(id: impl Into<String>, kind: MediaKind, backing: TrackBacking) -> Self {
        Self {
            core: TrackCore::new(id.into(), kind, Some(backing)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Declared source of the track
    pub fn kind(&self) -> MediaKind {
        self.core.kind
    }

    /// Whether the track is still delivering media
    pub fn is_live(&self) -> bool {
        self.core.live.load(Ordering::SeqCst)
    }

    /// Stop and detach the track. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        self.core.stop()
    }

    /// Downcast the backend track object
    pub fn backing<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.core.backing::<T>()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stop_is_shared_and_idempotent() {
        let track = LocalTrack::new("mic-0", MediaKind::Audio);
        let clone = track.clone();
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        track.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(clone.stop());
        assert!(!track.stop());
        assert!(!track.is_live());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backing_downcast() {
        let track = RemoteTrack::with_backing("r1", MediaKind::Video, Arc::new(7u32));
        assert_eq!(track.backing::<u32>().map(|v| *v), Some(7));
        assert!(track.backing::<String>().is_none());
    }
}
