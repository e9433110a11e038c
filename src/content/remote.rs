//! Passthrough proxy to a remote attachment store.
//!
//! Attachments are addressed by an opaque file reference and fetched in parts. Reads are
//! served from block-aligned windows; a part never exceeds one block, which keeps each
//! upstream request under the store's per-request limit. Reading past the highest window
//! fetched so far starts a sequential fetch-ahead of the next few windows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{ByteWindowCache, WindowKey};
use super::{next_source_id, read_windowed, Access, ContentInfo, ContentSource, SourceKind};
use crate::error::StreamError;

/// Opaque handle to a stored attachment plus what the store told us about it
#[derive(Debug, Clone, PartialEq)]
pub struct FileReference {
    pub id: String,
    pub size: u64,
    pub mime_type: String,
    pub file_name: Option<String>,
}

/// Fetches byte parts of stored files.
#[async_trait]
pub trait FilePartTransport: Send + Sync {
    /// Fetch up to `limit` bytes of `file` starting at `offset`.
    async fn fetch_part(
        &self,
        file: &FileReference,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, StreamError>;
}

/// Part transport over plain HTTP range requests against `{base_url}/{file id}`.
pub struct HttpFilePartTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFilePartTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn part_url(&self, file: &FileReference) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(&file.id))
    }
}

#[async_trait]
impl FilePartTransport for HttpFilePartTransport {
    async fn fetch_part(
        &self,
        file: &FileReference,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, StreamError> {
        if limit == 0 {
            return Ok(Bytes::new());
        }
        let last = offset + limit as u64 - 1;
        let response = self
            .client
            .get(self.part_url(file))
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if offset == 0 => {}
            StatusCode::RANGE_NOT_SATISFIABLE => return Ok(Bytes::new()),
            status if status.is_success() => {
                return Err(StreamError::upstream(format!(
                    "file store ignored range request ({})",
                    status
                )))
            }
            status => {
                return Err(StreamError::upstream(format!(
                    "file store returned {}",
                    status
                )))
            }
        }

        if let Some(range) = response.headers().get(CONTENT_RANGE) {
            debug!("Part {}: {:?}", file.id, range);
        }

        let mut body = response.bytes().await?;
        if body.len() > limit {
            body.truncate(limit);
        }
        Ok(body)
    }
}

pub struct RemoteAttachmentSource {
    id: u64,
    file: FileReference,
    transport: Arc<dyn FilePartTransport>,
    cache: Arc<ByteWindowCache>,
    block_size: usize,
    fetch_ahead: usize,
    upstream: Arc<Semaphore>,
    /// Highest window index fetched or scheduled so far
    high_water: AtomicU64,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl RemoteAttachmentSource {
    pub fn new(
        file: FileReference,
        transport: Arc<dyn FilePartTransport>,
        cache: Arc<ByteWindowCache>,
        block_size: usize,
        fetch_ahead: usize,
        upstream: Arc<Semaphore>,
    ) -> Self {
        Self {
            id: next_source_id(),
            file,
            transport,
            cache,
            block_size: block_size.max(1),
            fetch_ahead,
            upstream,
            high_water: AtomicU64::new(0),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn window_count(&self) -> u64 {
        self.file.size.div_ceil(self.block_size as u64)
    }

    /// Future fetching one window, detached from `self` so the cache can share it.
    fn window_fetch(&self, index: u64) -> BoxFuture<'static, Result<Bytes, StreamError>> {
        let transport = self.transport.clone();
        let file = self.file.clone();
        let upstream = self.upstream.clone();
        let cancel = self.cancel.clone();
        let block = self.block_size as u64;
        Box::pin(async move {
            let offset = index * block;
            let limit = block.min(file.size.saturating_sub(offset)) as usize;
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                permit = upstream.acquire_owned() => permit.map_err(|_| StreamError::Cancelled)?,
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(StreamError::Cancelled),
                part = transport.fetch_part(&file, offset, limit) => part,
            }
        })
    }

    /// Schedule windows after `index` that nobody has fetched yet.
    fn schedule_fetch_ahead(&self, index: u64) {
        if self.fetch_ahead == 0 {
            return;
        }
        let last = (index + self.fetch_ahead as u64).min(self.window_count().saturating_sub(1));
        let first_read = !self.started.swap(true, Ordering::AcqRel);
        let previous = self.high_water.fetch_max(last, Ordering::AcqRel);
        let from = if first_read {
            index + 1
        } else {
            previous.max(index) + 1
        };
        if from > last {
            return;
        }

        let fetches: Vec<(u64, BoxFuture<'static, Result<Bytes, StreamError>>)> =
            (from..=last).map(|i| (i, self.window_fetch(i))).collect();
        let cache = self.cache.clone();
        let cancel = self.cancel.clone();
        let source = self.id;
        debug!(
            "Fetch-ahead for source {}: windows {}..={}",
            source, from, last
        );

        tokio::spawn(async move {
            for (i, fetch) in fetches {
                let key = WindowKey::new(source, i);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = cache.get_or_fetch(key, move || fetch) => {
                        if let Err(e) = result {
                            warn!("Fetch-ahead of window {} for source {} failed: {}", i, source, e);
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ContentSource for RemoteAttachmentSource {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::RemoteAttachment
    }

    async fn probe(&self) -> Result<ContentInfo, StreamError> {
        Ok(ContentInfo {
            length: Some(self.file.size),
            mime_type: self.file.mime_type.clone(),
            file_name: self.file.file_name.clone(),
            access: Access::RandomAccess,
        })
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if offset >= self.file.size || len == 0 {
            return Ok(Bytes::new());
        }

        let index = offset / self.block_size as u64;
        self.schedule_fetch_ahead(index);

        read_windowed(
            &self.cache,
            self.id,
            self.block_size,
            offset,
            len,
            |i| self.window_fetch(i),
        )
        .await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let dropped = self.cache.remove_source(self.id).await;
        debug!("Closed attachment {} ({} cached windows dropped)", self.file.id, dropped);
    }
}
