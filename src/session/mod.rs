//! Stream sessions: opaque tokens bound to one content source each.
//!
//! Tokens carry 128 bits from the OS RNG, so the stream endpoint cannot be enumerated.
//! A session expires when its TTL runs out, when it is explicitly expired (superseded
//! play, deleted content), or when every transport serving it has been gone for longer
//! than the idle timeout. Expired sessions resolve as absent; the sweeper removes them
//! and closes their sources.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{short_token, BusEvent, SharedBus};
use crate::content::{ContentInfo, SharedSource, SourceKind};
use crate::error::StreamError;

/// Serve-side bookkeeping, updated from response bodies
#[derive(Debug)]
struct Activity {
    last_activity: Instant,
    windows_served: HashSet<u64>,
    ever_streamed: bool,
}

pub struct StreamSession {
    token: String,
    source: SharedSource,
    created_at: DateTime<Utc>,
    expires_at: Instant,
    info: OnceCell<ContentInfo>,
    active_transports: AtomicUsize,
    bytes_served: AtomicU64,
    activity: Mutex<Activity>,
    expired: AtomicBool,
}

impl StreamSession {
    fn new(token: String, source: SharedSource, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            token,
            source,
            created_at: Utc::now(),
            expires_at: now + ttl,
            info: OnceCell::new(),
            active_transports: AtomicUsize::new(0),
            bytes_served: AtomicU64::new(0),
            activity: Mutex::new(Activity {
                last_activity: now,
                windows_served: HashSet::new(),
                ever_streamed: false,
            }),
            expired: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Short, loggable form of the token
    pub fn token_prefix(&self) -> String {
        short_token(&self.token)
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire) || Instant::now() >= self.expires_at
    }

    /// Probe the source once per session; every request sees the same length and type.
    pub async fn content_info(&self, probe_timeout: Duration) -> Result<ContentInfo, StreamError> {
        self.info
            .get_or_try_init(|| async {
                tokio::time::timeout(probe_timeout, self.source.probe())
                    .await
                    .map_err(|_| StreamError::UpstreamStalled(probe_timeout))?
            })
            .await
            .cloned()
    }

    /// Cached probe result, if a request already triggered the probe
    pub fn known_info(&self) -> Option<&ContentInfo> {
        self.info.get()
    }

    /// Register one HTTP response streaming from this session.
    pub fn open_transport(self: &Arc<Self>) -> TransportGuard {
        self.active_transports.fetch_add(1, Ordering::AcqRel);
        self.touch(|a| a.ever_streamed = true);
        TransportGuard {
            session: self.clone(),
        }
    }

    pub fn active_transports(&self) -> usize {
        self.active_transports.load(Ordering::Acquire)
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    /// Record `len` bytes sent from `offset`, marking the windows they fall in.
    pub fn record_served(&self, offset: u64, len: usize, block_size: usize) {
        if len == 0 {
            return;
        }
        self.bytes_served.fetch_add(len as u64, Ordering::Relaxed);
        let block = block_size.max(1) as u64;
        let first = offset / block;
        let last = (offset + len as u64 - 1) / block;
        self.touch(|a| a.windows_served.extend(first..=last));
    }

    /// Share of the content's windows that were never served, in percent.
    pub fn unserved_percent(&self, block_size: usize) -> Option<f64> {
        let length = self.info.get()?.length?;
        let total = length.div_ceil(block_size.max(1) as u64);
        if total == 0 {
            return Some(0.0);
        }
        let served = self.with_activity(|a| a.windows_served.len() as u64)?;
        Some(100.0 * (total.saturating_sub(served)) as f64 / total as f64)
    }

    /// Time since the last transport closed, when nothing is streaming now.
    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.active_transports() > 0 {
            return None;
        }
        self.with_activity(|a| {
            if a.ever_streamed {
                Some(now.saturating_duration_since(a.last_activity))
            } else {
                None
            }
        })
        .flatten()
    }

    fn touch(&self, update: impl FnOnce(&mut Activity)) {
        if let Ok(mut activity) = self.activity.lock() {
            activity.last_activity = Instant::now();
            update(&mut activity);
        }
    }

    fn with_activity<T>(&self, read: impl FnOnce(&Activity) -> T) -> Option<T> {
        self.activity.lock().ok().map(|a| read(&*a))
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            token_prefix: self.token_prefix(),
            source_kind: self.source.kind(),
            created_at: self.created_at,
            expires_in_secs: self
                .expires_at
                .saturating_duration_since(Instant::now())
                .as_secs(),
            length: self.info.get().and_then(|i| i.length),
            mime_type: self.info.get().map(|i| i.mime_type.clone()),
            active_transports: self.active_transports(),
            bytes_served: self.bytes_served(),
        }
    }
}

/// Held by a response body for as long as it streams
pub struct TransportGuard {
    session: Arc<StreamSession>,
}

impl TransportGuard {
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.session.active_transports.fetch_sub(1, Ordering::AcqRel);
        self.session.touch(|_| {});
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub token_prefix: String,
    pub source_kind: SourceKind,
    pub created_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
    pub active_transports: usize,
    pub bytes_served: u64,
}

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Explicit,
    TtlElapsed,
    IdleGone,
    Shutdown,
}

impl ExpiryReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::TtlElapsed => "ttl_elapsed",
            Self::IdleGone => "idle_gone",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    idle_timeout: Duration,
    block_size: usize,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, block_size: usize, bus: SharedBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            block_size: block_size.max(1),
            bus,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind `source` to a fresh token valid for `ttl`.
    pub async fn create_session(&self, source: SharedSource, ttl: Duration) -> String {
        let token = mint_token();
        let session = Arc::new(StreamSession::new(token.clone(), source, ttl));
        let kind = session.source.kind();

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(token.clone(), session);
        }

        info!(
            "Session {} created for {} source (ttl {:?})",
            short_token(&token),
            kind,
            ttl
        );
        self.bus.publish(BusEvent::SessionCreated {
            token_prefix: short_token(&token),
            source_kind: kind.as_str().to_string(),
        });
        token
    }

    /// The live session for `token`; expired sessions are absent even before the
    /// sweeper removes them.
    pub async fn resolve(&self, token: &str) -> Option<Arc<StreamSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(token)
            .filter(|session| !session.is_expired())
            .cloned()
    }

    /// Invalidate a session now. Returns false if it was not registered.
    pub async fn expire(&self, token: &str) -> bool {
        self.remove(token, ExpiryReason::Explicit).await
    }

    async fn remove(&self, token: &str, reason: ExpiryReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(token)
        };
        match removed {
            Some(session) => {
                self.retire(session, reason).await;
                true
            }
            None => false,
        }
    }

    async fn retire(&self, session: Arc<StreamSession>, reason: ExpiryReason) {
        session.expired.store(true, Ordering::Release);
        session.source.close().await;

        if reason == ExpiryReason::IdleGone {
            let unserved = session.unserved_percent(self.block_size).unwrap_or(100.0);
            info!(
                "Session {} idle: {:.0}% of content never served",
                session.token_prefix(),
                unserved
            );
            self.bus.publish(BusEvent::StreamIdle {
                token_prefix: session.token_prefix(),
                unserved_percent: unserved,
            });
        }

        debug!(
            "Session {} expired ({}), {} bytes served",
            session.token_prefix(),
            reason.as_str(),
            session.bytes_served()
        );
        self.bus.publish(BusEvent::SessionExpired {
            token_prefix: session.token_prefix(),
            reason: reason.as_str().to_string(),
        });
    }

    /// Remove sessions whose TTL elapsed or whose transports have been idle too long.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let retired: Vec<(Arc<StreamSession>, ExpiryReason)> = {
            let mut sessions = self.sessions.write().await;
            let mut doomed = Vec::new();
            for (token, session) in sessions.iter() {
                if session.is_expired() {
                    doomed.push((token.clone(), ExpiryReason::TtlElapsed));
                } else if session
                    .idle_for(now)
                    .is_some_and(|idle| idle >= self.idle_timeout)
                {
                    doomed.push((token.clone(), ExpiryReason::IdleGone));
                }
            }
            doomed
                .into_iter()
                .filter_map(|(token, reason)| sessions.remove(&token).map(|s| (s, reason)))
                .collect()
        };

        let count = retired.len();
        for (session, reason) in retired {
            self.retire(session, reason).await;
        }
        count
    }

    /// Run `sweep` every `interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let swept = registry.sweep().await;
                        if swept > 0 {
                            debug!("Swept {} session(s)", swept);
                        }
                    }
                }
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.summary()).collect()
    }

    /// Token cancelled on shutdown; media responses watch it to end their streams.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the sweeper, cancel every stream and close every source.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<Arc<StreamSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        info!("Closing {} session(s)", drained.len());
        for session in drained {
            self.retire(session, ExpiryReason::Shutdown).await;
        }
    }
}

/// 128-bit hex token from the OS RNG
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
