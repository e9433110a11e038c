//! Event types published on the bus.
//!
//! Devices report connection and playback transitions, the session registry reports
//! session lifecycle, and the media server reports transports opening and closing.

use serde::{Deserialize, Serialize};

// =============================================================================
// Playback / connection state
// =============================================================================

/// Playback state as reported by a device's `status()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Buffering,
    Error,
    /// Device did not answer (or never attached)
    #[default]
    Unknown,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Buffering => write!(f, "buffering"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lenient mapping from the state words the protocols use
/// (UPnP `PAUSED_PLAYBACK`, Cast `BUFFERING`, etc.).
impl From<&str> for PlaybackState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "playing" | "play" => Self::Playing,
            "paused" | "pause" | "paused_playback" | "paused_recording" => Self::Paused,
            "stopped" | "stop" | "idle" | "no_media_present" => Self::Idle,
            "buffering" | "loading" | "transitioning" => Self::Buffering,
            "error" | "error_occurred" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle of a long-lived device control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed { reason: String },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

// =============================================================================
// Bus events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // =========================================================================
    // Device events
    // =========================================================================
    /// A device connection moved to a new state
    DeviceConnectionChanged {
        device_id: String,
        state: ConnectionState,
    },

    /// A play command completed successfully
    DevicePlaybackStarted {
        device_id: String,
        /// Prefix of the stream token handed to the device; `None` for other URLs
        token_prefix: Option<String>,
        resume_secs: f64,
    },

    /// A stop command completed successfully
    DevicePlaybackStopped { device_id: String },

    /// A device command failed
    DeviceCommandFailed {
        device_id: String,
        command: String,
        error: String,
    },

    /// A browser attached to or detached from a web device
    WebClientChanged {
        device_id: String,
        attached_clients: usize,
    },

    // =========================================================================
    // Session events (tokens are shortened, never published whole)
    // =========================================================================
    SessionCreated {
        token_prefix: String,
        source_kind: String,
    },

    SessionExpired {
        token_prefix: String,
        reason: String,
    },

    // =========================================================================
    // Stream events
    // =========================================================================
    /// A media request started streaming
    StreamOpened {
        token_prefix: String,
        start: u64,
        end: Option<u64>,
    },

    /// A media request finished (completed, cancelled by client, or failed)
    StreamClosed {
        token_prefix: String,
        bytes_sent: u64,
        completed: bool,
    },

    /// Every transport of a session went away and stayed away
    StreamIdle {
        token_prefix: String,
        /// Share of the content's windows never served, in percent
        unserved_percent: f64,
    },

    // =========================================================================
    // System events
    // =========================================================================
    ShuttingDown { reason: Option<String> },
}

impl BusEvent {
    /// Get the event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DeviceConnectionChanged { .. } => "device_connection_changed",
            Self::DevicePlaybackStarted { .. } => "device_playback_started",
            Self::DevicePlaybackStopped { .. } => "device_playback_stopped",
            Self::DeviceCommandFailed { .. } => "device_command_failed",
            Self::WebClientChanged { .. } => "web_client_changed",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionExpired { .. } => "session_expired",
            Self::StreamOpened { .. } => "stream_opened",
            Self::StreamClosed { .. } => "stream_closed",
            Self::StreamIdle { .. } => "stream_idle",
            Self::ShuttingDown { .. } => "shutting_down",
        }
    }

    /// Device the event concerns, for device-scoped events
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceConnectionChanged { device_id, .. }
            | Self::DevicePlaybackStarted { device_id, .. }
            | Self::DevicePlaybackStopped { device_id }
            | Self::DeviceCommandFailed { device_id, .. }
            | Self::WebClientChanged { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    pub fn is_device_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceConnectionChanged { .. }
                | Self::DevicePlaybackStarted { .. }
                | Self::DevicePlaybackStopped { .. }
                | Self::DeviceCommandFailed { .. }
                | Self::WebClientChanged { .. }
        )
    }

    pub fn is_stream_event(&self) -> bool {
        matches!(
            self,
            Self::SessionCreated { .. }
                | Self::SessionExpired { .. }
                | Self::StreamOpened { .. }
                | Self::StreamClosed { .. }
                | Self::StreamIdle { .. }
        )
    }
}
