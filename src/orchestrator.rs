//! Orchestrator - "play this content on that device"
//!
//! Mints a session for the content, hands the device its stream URL and keeps track
//! of which session each device is playing, so a newer play supersedes (and expires)
//! the older one. Stopping a device leaves its session alive; `release` ends it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{info, warn};

use crate::adapters::PlayMedia;
use crate::bus::short_token;
use crate::config::MediaConfig;
use crate::content::cache::ByteWindowCache;
use crate::content::remote::{FilePartTransport, FileReference, RemoteAttachmentSource};
use crate::content::url::UrlDownloadSource;
use crate::content::SharedSource;
use crate::error::{DeviceError, StreamError};
use crate::media::StreamUrls;
use crate::registry::DeviceRegistry;
use crate::session::SessionRegistry;

#[derive(Debug, Error)]
pub enum PlayError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The content could not be probed, so there is nothing to hand the device
    #[error("content unavailable: {0}")]
    Content(#[from] StreamError),
}

/// Result of a successful play
#[derive(Debug, Clone, Serialize)]
pub struct PlayStarted {
    pub device_id: String,
    pub token: String,
    pub stream_url: String,
    pub mime_type: String,
}

/// Builds content sources sharing one cache and the global upstream limits.
pub struct SourceFactory {
    client: reqwest::Client,
    cache: Arc<ByteWindowCache>,
    block_size: usize,
    fetch_ahead: usize,
    stall_timeout: Duration,
    upstream: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
}

impl SourceFactory {
    pub fn new(config: &MediaConfig, cache: Arc<ByteWindowCache>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(config.stall_timeout())
                .build()
                .unwrap_or_default(),
            cache,
            block_size: config.block_size.max(1),
            fetch_ahead: config.fetch_ahead_windows(),
            stall_timeout: config.stall_timeout(),
            upstream: Arc::new(Semaphore::new(config.upstream_concurrency.max(1))),
            downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
        }
    }

    pub fn cache(&self) -> &Arc<ByteWindowCache> {
        &self.cache
    }

    pub fn url(&self, url: impl Into<String>) -> SharedSource {
        Arc::new(UrlDownloadSource::new(
            url,
            self.client.clone(),
            self.cache.clone(),
            self.block_size,
            self.stall_timeout,
            self.downloads.clone(),
        ))
    }

    pub fn attachment(
        &self,
        file: FileReference,
        transport: Arc<dyn FilePartTransport>,
    ) -> SharedSource {
        Arc::new(RemoteAttachmentSource::new(
            file,
            transport,
            self.cache.clone(),
            self.block_size,
            self.fetch_ahead,
            self.upstream.clone(),
        ))
    }
}

pub struct Orchestrator {
    sessions: Arc<SessionRegistry>,
    devices: Arc<DeviceRegistry>,
    urls: StreamUrls,
    sources: SourceFactory,
    session_ttl: Duration,
    probe_timeout: Duration,
    /// Device id -> token of the session it was last told to play
    active: Mutex<HashMap<String, String>>,
    /// Device id -> lock held from the device command until `active` is updated
    play_turns: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        devices: Arc<DeviceRegistry>,
        urls: StreamUrls,
        sources: SourceFactory,
        config: &MediaConfig,
    ) -> Self {
        Self {
            sessions,
            devices,
            urls,
            sources,
            session_ttl: config.session_ttl(),
            probe_timeout: config.probe_timeout(),
            active: Mutex::new(HashMap::new()),
            play_turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn sources(&self) -> &SourceFactory {
        &self.sources
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// Play `source` on `device_id`, starting at `resume_secs`.
    ///
    /// The session is expired again if probing or the device command fails. On success
    /// the session the device was previously playing is expired.
    pub async fn play(
        &self,
        device_id: &str,
        source: SharedSource,
        title: Option<String>,
        resume_secs: f64,
    ) -> Result<PlayStarted, PlayError> {
        let device = self.devices.get(device_id)?.clone();
        let token = self.sessions.create_session(source, self.session_ttl).await;

        let info = match self.probe(&token).await {
            Ok(info) => info,
            Err(e) => {
                warn!("{}: cannot play session {}: {}", device_id, short_token(&token), e);
                self.sessions.expire(&token).await;
                return Err(e.into());
            }
        };

        let mut media = PlayMedia::new(self.urls.stream_url(&token), info.mime_type.clone());
        if let Some(title) = title.or(info.file_name) {
            media = media.with_title(title);
        }

        // Held until `active` names this session; plays on one device queue here
        let turn = self.play_turn(device_id);
        let _device_turn = turn.lock().await;

        if let Err(e) = device.play(&media, resume_secs).await {
            self.sessions.expire(&token).await;
            return Err(e.into());
        }

        let previous = self.set_active(device_id, Some(token.clone()));
        if let Some(previous) = previous.filter(|p| *p != token) {
            info!(
                "{}: session {} superseded by {}",
                device_id,
                short_token(&previous),
                short_token(&token)
            );
            self.sessions.expire(&previous).await;
        }

        Ok(PlayStarted {
            device_id: device_id.to_string(),
            stream_url: media.url,
            mime_type: info.mime_type,
            token,
        })
    }

    pub async fn play_url(
        &self,
        device_id: &str,
        url: &str,
        title: Option<String>,
        resume_secs: f64,
    ) -> Result<PlayStarted, PlayError> {
        self.play(device_id, self.sources.url(url), title, resume_secs)
            .await
    }

    async fn probe(&self, token: &str) -> Result<crate::content::ContentInfo, StreamError> {
        let session = self
            .sessions
            .resolve(token)
            .await
            .ok_or(StreamError::SessionNotFound)?;
        session.content_info(self.probe_timeout).await
    }

    /// Stop playback. The session stays valid so playback can resume elsewhere.
    pub async fn stop(&self, device_id: &str) -> Result<(), DeviceError> {
        self.devices.stop(device_id).await
    }

    /// Expire the session `device_id` is playing, if any.
    pub async fn release(&self, device_id: &str) -> bool {
        match self.set_active(device_id, None) {
            Some(token) => self.sessions.expire(&token).await,
            None => false,
        }
    }

    /// Explicitly invalidate one session, e.g. when its originating message is deleted.
    pub async fn expire(&self, token: &str) -> bool {
        {
            let mut active = match self.active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.retain(|_, t| t != token);
        }
        self.sessions.expire(token).await
    }

    /// Token of the session `device_id` was last told to play
    pub fn active_session(&self, device_id: &str) -> Option<String> {
        let active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.get(device_id).cloned()
    }

    fn play_turn(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        let mut turns = match self.play_turns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        turns.entry(device_id.to_string()).or_default().clone()
    }

    fn set_active(&self, device_id: &str, token: Option<String>) -> Option<String> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match token {
            Some(token) => active.insert(device_id.to_string(), token),
            None => active.remove(device_id),
        }
    }
}
