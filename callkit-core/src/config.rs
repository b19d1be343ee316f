//! Controller configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long an unanswered call rings before it is withdrawn
    pub answer_timeout: Duration,
    /// Upper bound on a single outbound signaling send
    pub signaling_timeout: Duration,
    /// Upper bound on the call-record update made at teardown
    pub record_timeout: Duration,
    /// Capacity of the call event broadcast channel
    pub event_buffer: usize,
    /// STUN/TURN URLs for the built-in `webrtc` peer transport, used when the
    /// controller is built without an explicit peer transport
    pub ice_servers: Vec<String>,
    /// Retry an unavailable device once with relaxed constraints
    pub retry_relaxed_constraints: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(60),
            signaling_timeout: Duration::from_secs(10),
            record_timeout: Duration::from_secs(5),
            event_buffer: 256,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            retry_relaxed_constraints: true,
        }
    }
}

impl CallConfig {
    /// Parse a JSON configuration, filling unspecified fields with defaults
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid JSON for this type
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
