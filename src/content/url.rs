//! Content behind an arbitrary HTTP URL.
//!
//! When the upstream honours range requests, reads become ranged GETs of block-aligned
//! windows through the shared cache and any number of readers are served. Otherwise the
//! whole body is downloaded once into a temp buffer and exposed as a sequential-only
//! source: one reader at a time, each read waiting until the download has reached its
//! offset.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::ByteWindowCache;
use super::{
    guess_mime, next_source_id, read_windowed, Access, ContentInfo, ContentSource, ReadLease,
    SourceKind,
};
use crate::error::StreamError;

#[derive(Debug, Clone)]
struct Probed {
    info: ContentInfo,
    ranged: bool,
}

#[derive(Debug, Default)]
struct Progress {
    written: u64,
    finished: Option<Result<(), StreamError>>,
}

/// Temp buffer filled by the background download task
struct Download {
    buffer: NamedTempFile,
    progress: watch::Receiver<Progress>,
}

pub struct UrlDownloadSource {
    id: u64,
    url: String,
    client: reqwest::Client,
    cache: Arc<ByteWindowCache>,
    block_size: usize,
    stall_timeout: Duration,
    /// Global bound on concurrent sequential downloads
    downloads: Arc<Semaphore>,
    probed: OnceCell<Probed>,
    download: OnceCell<Download>,
    /// Single reader gate for the sequential fallback
    reader: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl UrlDownloadSource {
    pub fn new(
        url: impl Into<String>,
        client: reqwest::Client,
        cache: Arc<ByteWindowCache>,
        block_size: usize,
        stall_timeout: Duration,
        downloads: Arc<Semaphore>,
    ) -> Self {
        Self {
            id: next_source_id(),
            url: url.into(),
            client,
            cache,
            block_size: block_size.max(1),
            stall_timeout,
            downloads,
            probed: OnceCell::new(),
            download: OnceCell::new(),
            reader: Arc::new(Semaphore::new(1)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn probed(&self) -> Result<&Probed, StreamError> {
        self.probed.get_or_try_init(|| self.probe_upstream()).await
    }

    async fn probe_upstream(&self) -> Result<Probed, StreamError> {
        let mut length = None;
        let mut ranged = false;
        let mut content_type = None;
        let mut file_name = None;

        match self.client.head(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let headers = resp.headers();
                length = header_u64(headers, CONTENT_LENGTH.as_str());
                ranged = headers
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.contains("bytes"));
                content_type = informative_content_type(headers);
                file_name = disposition_file_name(headers);
            }
            Ok(resp) => debug!("HEAD {} returned {}, probing with GET", self.url, resp.status()),
            Err(e) => debug!("HEAD {} failed ({}), probing with GET", self.url, e),
        }

        if !ranged || length.is_none() {
            let resp = self
                .client
                .get(&self.url)
                .header(RANGE, "bytes=0-0")
                .send()
                .await?;
            let status = resp.status();
            let headers = resp.headers();
            if status == StatusCode::PARTIAL_CONTENT {
                match content_range_total(headers) {
                    Some(total) => {
                        length = Some(total);
                        ranged = true;
                    }
                    None => ranged = false,
                }
            } else if status.is_success() {
                ranged = false;
                length = length.or_else(|| header_u64(headers, CONTENT_LENGTH.as_str()));
            } else {
                return Err(StreamError::upstream(format!(
                    "probe of {} returned {}",
                    self.url, status
                )));
            }
            content_type = content_type.or_else(|| informative_content_type(headers));
            file_name = file_name.or_else(|| disposition_file_name(headers));
            // Dropping the response abandons any body the server started sending
        }

        let file_name = file_name.or_else(|| url_file_name(&self.url));
        let mime_type = content_type
            .unwrap_or_else(|| guess_mime(file_name.as_deref().unwrap_or(&self.url)));
        let access = if ranged {
            Access::RandomAccess
        } else {
            Access::SequentialOnly
        };

        info!(
            "Probed {}: length={:?} type={} access={:?}",
            self.url, length, mime_type, access
        );

        Ok(Probed {
            info: ContentInfo {
                length,
                mime_type,
                file_name,
                access,
            },
            ranged,
        })
    }

    fn range_fetch(&self, index: u64, length: u64) -> BoxFuture<'static, Result<Bytes, StreamError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let cancel = self.cancel.clone();
        let stall = self.stall_timeout;
        let block = self.block_size as u64;
        Box::pin(async move {
            let start = index * block;
            let end = (start + block).min(length).saturating_sub(1);
            let fetch = async {
                let resp = client
                    .get(&url)
                    .header(RANGE, format!("bytes={}-{}", start, end))
                    .send()
                    .await?;
                if resp.status() != StatusCode::PARTIAL_CONTENT {
                    return Err(StreamError::upstream(format!(
                        "upstream answered range request with {}",
                        resp.status()
                    )));
                }
                Ok::<Bytes, StreamError>(resp.bytes().await?)
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(StreamError::Cancelled),
                result = tokio::time::timeout(stall, fetch) => {
                    result.map_err(|_| StreamError::UpstreamStalled(stall))?
                }
            }
        })
    }

    async fn start_download(&self) -> Result<Download, StreamError> {
        let buffer = NamedTempFile::new()?;
        let writer = tokio::fs::File::from_std(buffer.reopen()?);
        let (tx, rx) = watch::channel(Progress::default());

        info!("Buffering {} sequentially into {:?}", self.url, buffer.path());
        tokio::spawn(run_download(
            self.client.clone(),
            self.url.clone(),
            writer,
            tx,
            self.downloads.clone(),
            self.cancel.clone(),
            self.stall_timeout,
        ));

        Ok(Download {
            buffer,
            progress: rx,
        })
    }

    async fn read_sequential(&self, offset: u64, len: usize) -> Result<Bytes, StreamError> {
        let download = self.download.get_or_try_init(|| self.start_download()).await?;
        let mut progress = download.progress.clone();

        // Stalled means no progress for `stall_timeout`, not a slow climb to `offset`
        let (written, finished) = loop {
            {
                let state = progress.borrow_and_update();
                if state.written > offset || state.finished.is_some() {
                    break (state.written, state.finished.clone());
                }
            }
            match tokio::time::timeout(self.stall_timeout, progress.changed()).await {
                Err(_) => return Err(StreamError::UpstreamStalled(self.stall_timeout)),
                Ok(Err(_)) => return Err(StreamError::Cancelled),
                Ok(Ok(())) => {}
            }
        };

        if written <= offset {
            return match finished {
                Some(Err(e)) => Err(e),
                _ => Ok(Bytes::new()),
            };
        }

        let available = (written - offset).min(len as u64) as usize;
        let mut file = tokio::fs::File::open(download.buffer.path()).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; available];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

async fn run_download(
    client: reqwest::Client,
    url: String,
    writer: tokio::fs::File,
    progress: watch::Sender<Progress>,
    downloads: Arc<Semaphore>,
    cancel: CancellationToken,
    stall: Duration,
) {
    let outcome = download_into(&client, &url, writer, &progress, downloads, &cancel, stall).await;
    match &outcome {
        Ok(()) => info!("Finished buffering {}", url),
        Err(StreamError::Cancelled) => debug!("Buffering of {} cancelled", url),
        Err(e) => warn!("Buffering of {} failed: {}", url, e),
    }
    progress.send_modify(|p| p.finished = Some(outcome));
}

async fn download_into(
    client: &reqwest::Client,
    url: &str,
    mut writer: tokio::fs::File,
    progress: &watch::Sender<Progress>,
    downloads: Arc<Semaphore>,
    cancel: &CancellationToken,
    stall: Duration,
) -> Result<(), StreamError> {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return Err(StreamError::Cancelled),
        permit = downloads.acquire_owned() => permit.map_err(|_| StreamError::Cancelled)?,
    };

    let mut response = tokio::select! {
        _ = cancel.cancelled() => return Err(StreamError::Cancelled),
        sent = tokio::time::timeout(stall, client.get(url).send()) => {
            sent.map_err(|_| StreamError::UpstreamStalled(stall))??.error_for_status()?
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            chunk = tokio::time::timeout(stall, response.chunk()) => {
                match chunk {
                    Err(_) => return Err(StreamError::UpstreamStalled(stall)),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(bytes))) => {
                        writer.write_all(&bytes).await?;
                        writer.flush().await?;
                        progress.send_modify(|p| p.written += bytes.len() as u64);
                    }
                }
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ContentSource for UrlDownloadSource {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::UrlDownload
    }

    async fn probe(&self) -> Result<ContentInfo, StreamError> {
        let probed = self.probed().await?;
        let mut info = probed.info.clone();
        // A finished buffer settles a length the upstream never declared
        if info.length.is_none() {
            if let Some(download) = self.download.get() {
                let state = download.progress.borrow();
                if matches!(state.finished, Some(Ok(()))) {
                    info.length = Some(state.written);
                }
            }
        }
        Ok(info)
    }

    async fn acquire(&self, wait: Duration) -> Result<ReadLease, StreamError> {
        if self.probed().await?.ranged {
            return Ok(ReadLease::shared());
        }
        ReadLease::acquire_exclusive(&self.reader, wait).await
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if len == 0 {
            return Ok(Bytes::new());
        }
        let probed = self.probed().await?;
        match (probed.ranged, probed.info.length) {
            (true, Some(length)) => {
                if offset >= length {
                    return Ok(Bytes::new());
                }
                read_windowed(
                    &self.cache,
                    self.id,
                    self.block_size,
                    offset,
                    len,
                    |i| self.range_fetch(i, length),
                )
                .await
            }
            _ => self.read_sequential(offset, len).await,
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.cache.remove_source(self.id).await;
        debug!("Closed URL source {}", self.url);
    }
}

// =============================================================================
// Header helpers
// =============================================================================

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total from `Content-Range: bytes 0-0/12345`; `None` for `*`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse().ok())
}

/// Content type unless it is the generic octet-stream, which tells devices nothing.
fn informative_content_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    if essence.is_empty() || essence.ends_with("/octet-stream") {
        None
    } else {
        Some(essence)
    }
}

fn disposition_file_name(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

fn url_file_name(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    urlencoding::decode(last).ok().map(|s| s.into_owned())
}
