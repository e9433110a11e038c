//! DeviceHandle - Wraps a Device with per-device command serialization
//!
//! Every command against a device goes through its handle: one command at a time,
//! each bounded by a timeout, outcomes published on the bus. Status queries are
//! idempotent and retried with backoff when the device is briefly unreachable.
//! Adapters should NOT implement their own retry loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{stream_token_prefix, BusEvent, SharedBus};
use crate::error::DeviceError;

/// Round trips a single command may need (VLC play is add, play, poll, seek)
pub const COMMAND_ROUND_TRIPS: u32 = 4;

/// Retry configuration for status queries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up (including the first)
    pub attempts: u32,
    /// Initial delay between retry attempts
    pub initial_delay: Duration,
    /// Maximum delay (backoff caps at this value)
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay,
            max_delay,
        }
    }
}

pub struct DeviceHandle {
    device: Arc<dyn Device>,
    /// Held for the whole of a command so commands never interleave on the wire
    commands: Mutex<()>,
    command_timeout: Duration,
    retry: RetryConfig,
    bus: SharedBus,
}

impl DeviceHandle {
    pub fn new(device: Arc<dyn Device>, command_timeout: Duration, bus: SharedBus) -> Self {
        Self {
            device,
            commands: Mutex::new(()),
            command_timeout,
            retry: RetryConfig::default(),
            bus,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        self.device.id()
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn kind(&self) -> &'static str {
        self.device.kind()
    }

    /// Access to the underlying device
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Run one command exclusively, bounded by the command timeout.
    async fn run_command<F>(&self, command: &'static str, fut: F) -> Result<(), DeviceError>
    where
        F: Future<Output = Result<(), DeviceError>>,
    {
        let _queue = self.commands.lock().await;
        debug!("{}: {}", self.id(), command);

        let result = match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::timed_out(self.command_timeout)),
        };

        if let Err(ref e) = result {
            warn!("{}: {} failed: {}", self.id(), command, e);
            self.bus.publish(BusEvent::DeviceCommandFailed {
                device_id: self.id().to_string(),
                command: command.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    pub async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        let resume_secs = if resume_secs.is_finite() {
            resume_secs.max(0.0)
        } else {
            0.0
        };
        self.run_command("play", self.device.play(media, resume_secs))
            .await?;

        info!("{}: playing {}", self.id(), media.display_title());
        self.bus.publish(BusEvent::DevicePlaybackStarted {
            device_id: self.id().to_string(),
            token_prefix: stream_token_prefix(&media.url),
            resume_secs,
        });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.run_command("stop", self.device.stop()).await?;
        self.bus.publish(BusEvent::DevicePlaybackStopped {
            device_id: self.id().to_string(),
        });
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), DeviceError> {
        self.run_command("pause", self.device.pause()).await
    }

    pub async fn resume(&self) -> Result<(), DeviceError> {
        self.run_command("resume", self.device.resume()).await
    }

    /// Best-effort status. An unreachable device reports `Unknown` after retries;
    /// protocol errors are surfaced.
    pub async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let mut delay = self.retry.initial_delay;

        for attempt in 1..=self.retry.attempts {
            let outcome = match tokio::time::timeout(self.command_timeout, self.device.status()).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(DeviceError::timed_out(self.command_timeout)),
            };

            match outcome {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() => {
                    debug!(
                        "{}: status attempt {}/{} failed: {}",
                        self.id(),
                        attempt,
                        self.retry.attempts,
                        e
                    );
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.retry.max_delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DeviceStatus::unknown())
    }

    pub async fn shutdown(&self) {
        self.device.shutdown().await;
    }
}
