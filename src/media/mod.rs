//! Media server: `GET /stream/{token}` with byte-range support.
//!
//! Devices fetch the stream URL handed to them by their adapter. Requests resolve the
//! token against the session registry, probe the source once per session, and stream
//! the selected span from a per-request producer. Error responses never carry internal
//! detail.

pub mod body;
pub mod range;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::bus::{short_token, BusEvent, SharedBus};
use crate::config::MediaConfig;
use crate::content::ContentInfo;
use crate::error::StreamError;
use crate::session::SessionRegistry;

use body::{stream_body, BodyPlan};
use range::parse_range;

/// Knobs the stream handler needs per request
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub block_size: usize,
    pub stall_timeout: Duration,
    pub probe_timeout: Duration,
    pub reader_wait: Duration,
}

impl From<&MediaConfig> for StreamSettings {
    fn from(config: &MediaConfig) -> Self {
        Self {
            block_size: config.block_size.max(1),
            stall_timeout: config.stall_timeout(),
            probe_timeout: config.probe_timeout(),
            reader_wait: config.reader_wait(),
        }
    }
}

#[derive(Clone)]
pub struct MediaState {
    pub sessions: Arc<SessionRegistry>,
    pub bus: SharedBus,
    pub settings: Arc<StreamSettings>,
}

/// Builds the URLs devices fetch streams from
#[derive(Debug, Clone)]
pub struct StreamUrls {
    base: String,
}

impl StreamUrls {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn stream_url(&self, token: &str) -> String {
        format!("{}/stream/{}", self.base, token)
    }
}

pub struct MediaServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    urls: StreamUrls,
    state: MediaState,
}

impl MediaServer {
    /// Bind the listening socket. Failure here is fatal to startup.
    pub async fn bind(
        config: &MediaConfig,
        sessions: Arc<SessionRegistry>,
        bus: SharedBus,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.bind, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind media server on {}", addr))?;
        let local_addr = listener.local_addr()?;

        let host = config
            .public_host
            .clone()
            .unwrap_or_else(|| advertised_ip(local_addr.ip()).to_string());
        let urls = StreamUrls::new(format!("http://{}:{}", host, local_addr.port()));

        tracing::info!(
            "Media server bound on {}, advertising {}",
            local_addr,
            urls.base()
        );

        Ok(Self {
            listener,
            local_addr,
            urls,
            state: MediaState {
                sessions,
                bus,
                settings: Arc::new(StreamSettings::from(config)),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn urls(&self) -> StreamUrls {
        self.urls.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve the stream routes plus `extra` until `shutdown` resolves.
    pub async fn serve<F>(self, extra: Router, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state).merge(extra).layer(TraceLayer::new_for_http());
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Address devices on the LAN can reach us at when no public host is configured.
fn advertised_ip(bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() && !bound.is_loopback() {
        return bound;
    }
    // Connecting a UDP socket sends nothing; it only selects the outbound interface
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:9")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn router(state: MediaState) -> Router {
    Router::new()
        .route(
            "/stream/{token}",
            get(stream_handler)
                .head(stream_handler)
                .options(probe_handler)
                .put(probe_handler),
        )
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
}

async fn healthcheck() -> &'static str {
    "ok"
}

async fn stream_handler(
    State(state): State<MediaState>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match serve_stream(&state, &token, &headers, method == Method::HEAD).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Stream {} refused: {}", short_token(&token), e);
            error_response(&e)
        }
    }
}

/// UPnP renderers probe the stream URL with OPTIONS/PUT before fetching.
async fn probe_handler(State(state): State<MediaState>, Path(token): Path<String>) -> Response {
    match state.sessions.resolve(&token).await {
        Some(session) => {
            let mut response = StatusCode::OK.into_response();
            apply_common_headers(response.headers_mut(), session.known_info());
            response
        }
        None => error_response(&StreamError::SessionNotFound),
    }
}

async fn serve_stream(
    state: &MediaState,
    token: &str,
    headers: &HeaderMap,
    head_only: bool,
) -> Result<Response, StreamError> {
    let settings = &state.settings;
    let session = state
        .sessions
        .resolve(token)
        .await
        .ok_or(StreamError::SessionNotFound)?;
    let info = session.content_info(settings.probe_timeout).await?;

    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    // (status, first byte, last byte, Content-Length, Content-Range)
    let (status, start, end, content_length, content_range) = match (info.length, requested) {
        (Some(length), Some(spec)) => {
            let span = spec.resolve(length)?;
            (
                StatusCode::PARTIAL_CONTENT,
                span.start,
                Some(span.end),
                Some(span.len()),
                Some(span.content_range(Some(length))),
            )
        }
        (Some(0), None) => (StatusCode::OK, 0, None, Some(0), None),
        (Some(length), None) => (StatusCode::OK, 0, Some(length - 1), Some(length), None),
        (None, Some(spec)) => match spec.resolve_unknown() {
            Some(span) => (
                StatusCode::PARTIAL_CONTENT,
                span.start,
                Some(span.end),
                None,
                Some(span.content_range(None)),
            ),
            None => (StatusCode::OK, 0, None, None, None),
        },
        (None, None) => (StatusCode::OK, 0, None, None, None),
    };

    let mut response_headers = HeaderMap::new();
    apply_common_headers(&mut response_headers, Some(&info));
    if let Some(length) = content_length {
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(range) = content_range.as_deref().and_then(|r| HeaderValue::from_str(r).ok()) {
        response_headers.insert(header::CONTENT_RANGE, range);
    }

    if head_only || content_length == Some(0) {
        let mut response = (status, Body::empty()).into_response();
        response.headers_mut().extend(response_headers);
        return Ok(response);
    }

    let source = session.source().clone();
    let lease = source.acquire(settings.reader_wait).await?;

    let want = match end {
        Some(end) => (end - start + 1).min(settings.block_size as u64) as usize,
        None => settings.block_size,
    };
    // Read the first chunk before committing to a status line so a stalled upstream
    // still becomes a 504
    let first = match tokio::time::timeout(settings.stall_timeout, source.read(start, want)).await {
        Err(_) => return Err(StreamError::UpstreamStalled(settings.stall_timeout)),
        Ok(result) => result?,
    };
    if first.is_empty() && content_length.is_some() {
        return Err(StreamError::upstream("source returned no data"));
    }

    tracing::info!(
        "Stream {} opened: {} {}-{}",
        session.token_prefix(),
        status.as_u16(),
        start,
        end.map(|e| e.to_string()).unwrap_or_default()
    );
    state.bus.publish(BusEvent::StreamOpened {
        token_prefix: session.token_prefix(),
        start,
        end,
    });

    let body = if first.is_empty() {
        Body::empty()
    } else {
        stream_body(
            session.open_transport(),
            lease,
            first,
            BodyPlan {
                start,
                end,
                exact: content_length.is_some(),
                chunk_size: settings.block_size,
                stall_timeout: settings.stall_timeout,
            },
            state.sessions.shutdown_token(),
            state.bus.clone(),
        )
    };

    let mut response = (status, body).into_response();
    response.headers_mut().extend(response_headers);
    Ok(response)
}

fn apply_common_headers(headers: &mut HeaderMap, info: Option<&ContentInfo>) {
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Content-Type"),
    );
    headers.insert("transfermode.dlna.org", HeaderValue::from_static("Streaming"));
    headers.insert(
        "timeseekrange.dlna.org",
        HeaderValue::from_static("npt=0.00-"),
    );
    headers.insert(
        "contentfeatures.dlna.org",
        HeaderValue::from_static("DLNA.ORG_OP=01;DLNA.ORG_CI=0;"),
    );

    let Some(info) = info else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&info.mime_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = &info.file_name {
        let disposition = format!("inline; filename=\"{}\"", urlencoding::encode(name));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}

/// Map a stream failure to its status. Bodies are fixed strings.
pub fn error_response(error: &StreamError) -> Response {
    match error {
        StreamError::SessionNotFound | StreamError::SessionExpired | StreamError::Cancelled => {
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
        StreamError::RangeNotSatisfiable { length } => {
            let mut response =
                (StatusCode::RANGE_NOT_SATISFIABLE, "Range Not Satisfiable").into_response();
            let unsatisfied = match length {
                Some(length) => format!("bytes */{}", length),
                None => "bytes */*".to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&unsatisfied) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        StreamError::ConcurrencyLimit
        | StreamError::UpstreamStalled(_)
        | StreamError::Upstream(_)
        | StreamError::Io(_) => (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response(),
    }
}
