use async_trait::async_trait;
use serde::Serialize;

use crate::bus::PlaybackState;
use crate::error::DeviceError;

// =============================================================================
// Device - uniform display device contract
// =============================================================================

/// What to play: the stream URL plus what devices need to describe it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayMedia {
    pub url: String,
    /// Explicit mime type; Chromecast rejects loads without one
    pub content_type: String,
    pub title: Option<String>,
}

impl PlayMedia {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title for display, falling back to a generic label
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Video")
    }
}

/// Best-effort playback snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub state: PlaybackState,
    pub position_secs: Option<f64>,
    pub duration_secs: Option<f64>,
    /// Last-known value that has not been refreshed within the staleness window
    #[serde(default)]
    pub stale: bool,
}

impl DeviceStatus {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_state(state: PlaybackState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }
}

/// One display device behind its protocol adapter.
///
/// Implementations do not serialize their own commands; [`super::DeviceHandle`]
/// wraps every device with a per-device command lock and timeout.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable id used to address the device
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Protocol tag (`upnp`, `chromecast`, `vlc`, `xbmc`, `web`)
    fn kind(&self) -> &'static str;

    /// Begin playing `media`, seeking to `resume_secs` once playback starts.
    /// Replaces whatever is currently playing.
    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError>;

    /// Stop playback. Succeeds when already stopped.
    async fn stop(&self) -> Result<(), DeviceError>;

    /// Current playback state as reported by the device.
    async fn status(&self) -> Result<DeviceStatus, DeviceError>;

    async fn pause(&self) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported(format!("pause on {}", self.kind())))
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported(format!("resume on {}", self.kind())))
    }

    /// Drop connections and background tasks. Called once at process teardown.
    async fn shutdown(&self) {}
}
