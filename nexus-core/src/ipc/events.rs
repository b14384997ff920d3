//! Events broadcast by [`LiveEngine`](crate::LiveEngine).
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `LiveEngine::subscribe_status` |
//! | `AudioActivityEvent` | `LiveEngine::subscribe_activity` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// One tick of the level meter while a session is connected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Microphone level in [0, 100].
    pub volume: f32,
    /// Whether the microphone is muted (level still reported).
    pub muted: bool,
}

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Emitted whenever the session state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionState,
    /// Optional human-readable detail (e.g. error message, close reason).
    pub detail: Option<String>,
}

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; no devices or channel held.
    #[default]
    Idle,
    /// Acquiring devices and opening the channel.
    Connecting,
    /// Streaming both ways.
    Connected,
    /// Last session failed; everything was released.
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            status: SessionState::Connecting,
            detail: Some("opening microphone".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["detail"], "opening microphone");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn session_state_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<SessionState>(r#""Connected""#);
        assert!(err.is_err(), "expected invalid casing to fail");
        assert_eq!(SessionState::Error.to_string(), "error");
    }

    #[test]
    fn audio_activity_event_serializes_with_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            volume: 42.5,
            muted: true,
        };

        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["volume"], 42.5);
        assert_eq!(json["muted"], true);
    }
}
