//! Chromecast adapter - Cast v2 control channel
//!
//! One persistent channel per device (TLS by default), opened lazily on the first
//! command. A reader task answers heartbeats, routes replies to their requester by
//! `requestId`, and keeps the last pushed media status. `status()` reads that cache
//! and never opens a connection itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::cast_proto::{
    read_frame, write_frame, CastMessage, CONNECTION_NS, DEFAULT_RECEIVER, DEFAULT_SENDER,
    HEARTBEAT_NS, MEDIA_NS, RECEIVER_NS,
};
use crate::adapters::connection::ConnectionTracker;
use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{redact_stream_tokens, ConnectionState, PlaybackState, SharedBus};
use crate::config::ChromecastDescriptor;
use crate::error::DeviceError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Cached status older than this is reported as stale
const STATUS_STALE_AFTER: Duration = Duration::from_secs(15);
/// GET_STATUS polls while waiting for a launched app to appear
const LAUNCH_POLLS: u32 = 10;
const LAUNCH_POLL_DELAY: Duration = Duration::from_millis(500);

type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiver app session hosting the media channel
#[derive(Debug, Clone)]
struct AppSession {
    transport_id: String,
}

#[derive(Debug, Default)]
struct CachedStatus {
    status: DeviceStatus,
    updated: Option<Instant>,
    media_session_id: Option<i64>,
}

/// State shared between the device, its reader task and its heartbeat task
struct Channel {
    device_id: String,
    app_id: String,
    writer: Mutex<Option<FrameWriter>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Value>>>,
    request_id: AtomicU64,
    app: StdMutex<Option<AppSession>>,
    cached: StdMutex<CachedStatus>,
    connection: ConnectionTracker,
}

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Channel {
    async fn send(
        &self,
        destination: &str,
        namespace: &str,
        payload: &Value,
    ) -> Result<(), DeviceError> {
        let message = CastMessage::json(DEFAULT_SENDER, destination, namespace, payload);
        debug!(
            "{}: -> {} {}",
            self.device_id,
            destination,
            redact_stream_tokens(&payload.to_string())
        );

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| DeviceError::unreachable("cast channel not connected"))?;
        write_frame(&mut **writer, &message).await?;
        Ok(())
    }

    /// Send a request and wait for the reply carrying the same `requestId`.
    async fn request(
        &self,
        destination: &str,
        namespace: &str,
        mut payload: Value,
        timeout: Duration,
    ) -> Result<Value, DeviceError> {
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed) + 1;
        payload["requestId"] = json!(request_id);

        let (tx, rx) = oneshot::channel();
        locked(&self.pending).insert(request_id, tx);

        if let Err(e) = self.send(destination, namespace, &payload).await {
            locked(&self.pending).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DeviceError::unreachable("cast channel closed")),
            Err(_) => {
                locked(&self.pending).remove(&request_id);
                Err(DeviceError::timed_out(timeout))
            }
        }
    }

    fn transport_id(&self) -> Option<String> {
        locked(&self.app).as_ref().map(|a| a.transport_id.clone())
    }

    fn media_session_id(&self) -> Option<i64> {
        locked(&self.cached).media_session_id
    }

    async fn dispatch(&self, message: CastMessage) {
        let Some(payload) = message.json_payload() else {
            debug!("{}: ignoring non-JSON frame on {}", self.device_id, message.namespace);
            return;
        };
        let kind = payload["type"].as_str().unwrap_or_default();

        match (message.namespace.as_str(), kind) {
            (HEARTBEAT_NS, "PING") => {
                if let Err(e) = self
                    .send(&message.source_id, HEARTBEAT_NS, &json!({"type": "PONG"}))
                    .await
                {
                    debug!("{}: PONG failed: {}", self.device_id, e);
                }
                return;
            }
            (CONNECTION_NS, "CLOSE") => {
                let mut app = locked(&self.app);
                if app.as_ref().is_some_and(|a| a.transport_id == message.source_id) {
                    info!("{}: receiver app closed its channel", self.device_id);
                    *app = None;
                }
            }
            (RECEIVER_NS, "RECEIVER_STATUS") => {
                if find_app(&payload, &self.app_id).is_none() {
                    *locked(&self.app) = None;
                }
            }
            (MEDIA_NS, "MEDIA_STATUS") => self.update_status(&payload),
            _ => debug!("{}: <- {} {}", self.device_id, message.namespace, kind),
        }

        if let Some(id) = payload["requestId"].as_u64().filter(|id| *id != 0) {
            let waiter = locked(&self.pending).remove(&id);
            if let Some(tx) = waiter {
                if tx.send(payload).is_err() {
                    debug!("{}: reply {} arrived after its requester gave up", self.device_id, id);
                }
            }
        }
    }

    fn update_status(&self, payload: &Value) {
        let mut cached = locked(&self.cached);
        cached.updated = Some(Instant::now());

        let Some(entry) = payload["status"].as_array().and_then(|s| s.first()) else {
            // Empty status list: nothing loaded
            cached.status = DeviceStatus::with_state(PlaybackState::Idle);
            cached.media_session_id = None;
            return;
        };

        let mut state = entry["playerState"]
            .as_str()
            .map(PlaybackState::from)
            .unwrap_or(PlaybackState::Unknown);
        if state == PlaybackState::Idle && entry["idleReason"].as_str() == Some("ERROR") {
            state = PlaybackState::Error;
        }

        cached.status.state = state;
        cached.status.stale = false;
        if let Some(t) = entry["currentTime"].as_f64() {
            cached.status.position_secs = Some(t);
        }
        if let Some(d) = entry["media"]["duration"].as_f64() {
            cached.status.duration_secs = Some(d);
        }
        if let Some(id) = entry["mediaSessionId"].as_i64() {
            cached.media_session_id = Some(id);
        }
        if matches!(state, PlaybackState::Idle | PlaybackState::Error) {
            cached.media_session_id = None;
        }
    }

    async fn connection_lost(&self, reason: String) {
        *self.writer.lock().await = None;
        locked(&self.pending).clear();
        *locked(&self.app) = None;
        if !matches!(self.connection.state(), ConnectionState::Disconnected) {
            self.connection.failed(reason);
        }
    }
}

fn find_app<'a>(payload: &'a Value, app_id: &str) -> Option<&'a Value> {
    payload["status"]["applications"]
        .as_array()?
        .iter()
        .find(|app| app["appId"].as_str() == Some(app_id))
}

async fn read_loop(channel: Arc<Channel>, mut reader: FrameReader, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut *reader) => match frame {
                Ok(message) => channel.dispatch(message).await,
                Err(e) => {
                    warn!("{}: cast channel lost: {}", channel.device_id, e);
                    channel.connection_lost(e.to_string()).await;
                    break;
                }
            }
        }
    }
    debug!("{}: cast reader stopped", channel.device_id);
}

async fn heartbeat_loop(channel: Arc<Channel>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = channel
                    .send(DEFAULT_RECEIVER, HEARTBEAT_NS, &json!({"type": "PING"}))
                    .await
                {
                    debug!("{}: heartbeat failed: {}", channel.device_id, e);
                    break;
                }
            }
        }
    }
}

/// Cast devices present self-signed certificates; the channel is authenticated by
/// being on the local network, not by PKI.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> Result<TlsConnector, DeviceError> {
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| DeviceError::protocol(format!("TLS setup failed: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub struct ChromecastDevice {
    id: String,
    name: String,
    host: String,
    port: u16,
    tls: bool,
    request_timeout: Duration,
    channel: Arc<Channel>,
    shutdown: CancellationToken,
    /// Cancels the reader and heartbeat of the current connection
    link: StdMutex<CancellationToken>,
}

impl ChromecastDevice {
    pub fn new(id: String, descriptor: &ChromecastDescriptor, bus: SharedBus) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            name: descriptor.name.clone().unwrap_or_else(|| id.clone()),
            host: descriptor.host.clone(),
            port: descriptor.port,
            tls: descriptor.tls,
            request_timeout: Duration::from_secs(descriptor.request_timeout.max(1)),
            channel: Arc::new(Channel {
                device_id: id.clone(),
                app_id: descriptor.app_id.clone(),
                writer: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                request_id: AtomicU64::new(0),
                app: StdMutex::new(None),
                cached: StdMutex::new(CachedStatus::default()),
                connection: ConnectionTracker::new(id.clone(), bus),
            }),
            link: StdMutex::new(shutdown.child_token()),
            shutdown,
            id,
        }
    }

    async fn open_streams(&self) -> Result<(FrameReader, FrameWriter), DeviceError> {
        let address = format!("{}:{}", self.host, self.port);
        let tcp = tokio::time::timeout(self.request_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| DeviceError::timed_out(self.request_timeout))??;
        tcp.set_nodelay(true)?;

        if !self.tls {
            let (reader, writer) = tcp.into_split();
            return Ok((Box::new(reader), Box::new(writer)));
        }

        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| DeviceError::protocol(format!("bad cast host {}: {}", self.host, e)))?
            .to_owned();
        let stream = tokio::time::timeout(
            self.request_timeout,
            tls_connector()?.connect(server_name, tcp),
        )
        .await
        .map_err(|_| DeviceError::timed_out(self.request_timeout))??;
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let channel = &self.channel;
        channel.connection.begin_connect();

        let (reader, writer) = match self.open_streams().await {
            Ok(streams) => streams,
            Err(e) => {
                channel.connection.failed(e.to_string());
                return Err(e);
            }
        };
        *channel.writer.lock().await = Some(writer);

        let link = self.shutdown.child_token();
        let previous = std::mem::replace(&mut *locked(&self.link), link.clone());
        previous.cancel();

        tokio::spawn(read_loop(channel.clone(), reader, link.clone()));
        tokio::spawn(heartbeat_loop(channel.clone(), link));

        if let Err(e) = channel
            .send(DEFAULT_RECEIVER, CONNECTION_NS, &json!({"type": "CONNECT"}))
            .await
        {
            channel.connection.failed(e.to_string());
            return Err(e);
        }
        channel.connection.connected();
        info!("{}: cast channel open to {}:{}", self.id, self.host, self.port);
        Ok(())
    }

    /// Connected channel with the receiver app running; returns its transport id.
    async fn ensure_app(&self) -> Result<String, DeviceError> {
        if !self.channel.connection.is_connected() {
            self.connect().await?;
        }
        if let Some(transport_id) = self.channel.transport_id() {
            return Ok(transport_id);
        }

        let mut reply = self
            .channel
            .request(
                DEFAULT_RECEIVER,
                RECEIVER_NS,
                json!({"type": "LAUNCH", "appId": self.channel.app_id}),
                self.request_timeout,
            )
            .await?;

        for _ in 0..LAUNCH_POLLS {
            match reply["type"].as_str() {
                Some("LAUNCH_ERROR") | Some("INVALID_REQUEST") => {
                    return Err(DeviceError::protocol(format!(
                        "launch of {} rejected: {}",
                        self.channel.app_id,
                        reply["reason"].as_str().unwrap_or("unknown reason")
                    )));
                }
                _ => {}
            }

            let transport_id = find_app(&reply, &self.channel.app_id)
                .and_then(|app| app["transportId"].as_str())
                .map(str::to_string);
            if let Some(transport_id) = transport_id {
                self.channel
                    .send(&transport_id, CONNECTION_NS, &json!({"type": "CONNECT"}))
                    .await?;
                *locked(&self.channel.app) = Some(AppSession {
                    transport_id: transport_id.clone(),
                });
                debug!("{}: media channel {}", self.id, transport_id);
                return Ok(transport_id);
            }

            tokio::time::sleep(LAUNCH_POLL_DELAY).await;
            reply = self
                .channel
                .request(
                    DEFAULT_RECEIVER,
                    RECEIVER_NS,
                    json!({"type": "GET_STATUS"}),
                    self.request_timeout,
                )
                .await?;
        }

        Err(DeviceError::protocol(format!(
            "receiver app {} did not start",
            self.channel.app_id
        )))
    }

    async fn media_request(&self, payload: Value) -> Result<Value, DeviceError> {
        let transport_id = self.ensure_app().await?;
        let reply = self
            .channel
            .request(&transport_id, MEDIA_NS, payload, self.request_timeout)
            .await?;
        match reply["type"].as_str() {
            Some("MEDIA_STATUS") => Ok(reply),
            Some(other) => Err(DeviceError::protocol(format!(
                "{}{}",
                other,
                reply["reason"]
                    .as_str()
                    .map(|r| format!(": {}", r))
                    .unwrap_or_default()
            ))),
            None => Err(DeviceError::protocol("media reply without type")),
        }
    }

    async fn session_command(&self, kind: &str) -> Result<(), DeviceError> {
        let media_session_id = self
            .channel
            .media_session_id()
            .ok_or_else(|| DeviceError::protocol("no active media session"))?;
        self.media_request(json!({"type": kind, "mediaSessionId": media_session_id}))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Device for ChromecastDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "chromecast"
    }

    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        let load = json!({
            "type": "LOAD",
            "media": {
                "contentId": media.url,
                "streamType": "BUFFERED",
                "contentType": media.content_type,
                "metadata": {
                    "metadataType": 0,
                    "title": media.display_title(),
                },
            },
            "currentTime": resume_secs,
            "autoplay": true,
        });
        self.media_request(load).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        // No media session means nothing is playing; stay off the wire
        if self.channel.transport_id().is_none() || self.channel.media_session_id().is_none() {
            return Ok(());
        }
        match self.session_command("STOP").await {
            Err(DeviceError::Protocol(reason)) if reason.starts_with("INVALID_REQUEST") => {
                debug!("{}: stop on finished session: {}", self.id, reason);
                Ok(())
            }
            other => other,
        }
    }

    async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let (mut status, updated) = {
            let cached = locked(&self.channel.cached);
            (cached.status.clone(), cached.updated)
        };
        let Some(updated) = updated else {
            return Ok(DeviceStatus::unknown());
        };

        status.stale = updated.elapsed() > STATUS_STALE_AFTER;
        if status.stale && self.channel.connection.is_connected() {
            if let Some(transport_id) = self.channel.transport_id() {
                // Reply lands in the cache through the reader
                let refresh = json!({"type": "GET_STATUS", "requestId": 0});
                if let Err(e) = self.channel.send(&transport_id, MEDIA_NS, &refresh).await {
                    debug!("{}: status refresh failed: {}", self.id, e);
                }
            }
        }
        Ok(status)
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        self.session_command("PAUSE").await
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.session_command("PLAY").await
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        *self.channel.writer.lock().await = None;
        self.channel.connection.disconnected();
    }
}
