//! Content sources: byte-addressable views of remote video payloads.
//!
//! Every source exposes the same read contract: `read(offset, len)` returns up to `len`
//! bytes starting at `offset`, fewer at a window boundary, and an empty buffer at end of
//! content. Sources that cannot seek upstream reconstruct random access internally and
//! allow only one reader at a time (see [`Access::SequentialOnly`]).

pub mod cache;
pub mod memory;
pub mod remote;
pub mod url;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StreamError;

pub use cache::{ByteWindowCache, CacheStats, WindowKey};
pub use memory::MemorySource;
pub use remote::{FilePartTransport, FileReference, HttpFilePartTransport, RemoteAttachmentSource};
pub use url::UrlDownloadSource;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique source id, used to key cache windows
pub fn next_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Memory,
    RemoteAttachment,
    UrlDownload,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::RemoteAttachment => "remote_attachment",
            Self::UrlDownload => "url_download",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many readers a source can serve at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Any number of concurrent readers at independent offsets
    RandomAccess,
    /// Upstream is a single sequential download; one reader at a time
    SequentialOnly,
}

/// Result of probing a source. Length is `None` when the upstream did not declare one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentInfo {
    pub length: Option<u64>,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub access: Access,
}

/// Permission to read from a source for the duration of one HTTP response.
///
/// Random-access sources hand out unlimited leases; sequential-only sources hold a
/// single-permit semaphore here.
#[derive(Debug)]
pub struct ReadLease {
    permit: Option<OwnedSemaphorePermit>,
}

impl ReadLease {
    pub fn shared() -> Self {
        Self { permit: None }
    }

    pub fn exclusive(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.permit.is_some()
    }

    /// Wait up to `wait` for the only permit of `gate`.
    pub async fn acquire_exclusive(
        gate: &Arc<Semaphore>,
        wait: Duration,
    ) -> Result<Self, StreamError> {
        match tokio::time::timeout(wait, gate.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Self::exclusive(permit)),
            Ok(Err(_)) => Err(StreamError::Cancelled),
            Err(_) => Err(StreamError::ConcurrencyLimit),
        }
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> SourceKind;

    /// Determine length, mime type and access mode. May perform network I/O; callers
    /// bound it with a timeout and memoize the result.
    async fn probe(&self) -> Result<ContentInfo, StreamError>;

    /// Reserve the right to read. Fails with `ConcurrencyLimit` when a sequential-only
    /// source is still held by another reader after `wait`.
    async fn acquire(&self, _wait: Duration) -> Result<ReadLease, StreamError> {
        Ok(ReadLease::shared())
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes, StreamError>;

    /// Cancel background fetches and release buffers. Reads after close fail.
    async fn close(&self) {}
}

pub type SharedSource = Arc<dyn ContentSource>;

/// Serve `[offset, offset + len)` from the window containing `offset`, fetching the
/// window through the shared cache.
///
/// The returned slice never crosses the window boundary, so callers loop for longer reads.
pub(crate) async fn read_windowed<F, Fut>(
    cache: &ByteWindowCache,
    source: u64,
    block_size: usize,
    offset: u64,
    len: usize,
    fetch: F,
) -> Result<Bytes, StreamError>
where
    F: FnOnce(u64) -> Fut,
    Fut: Future<Output = Result<Bytes, StreamError>> + Send + 'static,
{
    let block = block_size as u64;
    let index = offset / block;
    let window = cache
        .get_or_fetch(WindowKey::new(source, index), || fetch(index))
        .await?;

    let skip = (offset - index * block) as usize;
    if skip >= window.len() {
        return Ok(Bytes::new());
    }
    let end = window.len().min(skip + len);
    Ok(window.slice(skip..end))
}

/// Mime type guessed from a file name or URL path, defaulting to MP4 since devices
/// reject loads without an explicit video type.
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "video/mp4".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_are_unique() {
        let a = next_source_id();
        let b = next_source_id();
        assert_ne!(a, b);
    }

    #[test]
    fn source_kind_displays_as_its_name() {
        assert_eq!(SourceKind::UrlDownload.to_string(), "url_download");
        assert_eq!(format!("{} source", SourceKind::Memory), "memory source");
    }

    #[test]
    fn guess_mime_defaults_to_mp4() {
        assert_eq!(guess_mime("clip.mkv"), "video/x-matroska");
        assert_eq!(guess_mime("movie.webm"), "video/webm");
        assert_eq!(guess_mime("no-extension"), "video/mp4");
    }

    #[tokio::test]
    async fn read_windowed_slices_within_window() {
        let cache = ByteWindowCache::new(1 << 20);
        let data: Vec<u8> = (0..=255u8).collect();
        let payload = Bytes::from(data);

        let p = payload.clone();
        let out = read_windowed(&cache, 99, 100, 150, 20, move |index| {
            let start = (index * 100) as usize;
            let end = (start + 100).min(p.len());
            let window = p.slice(start..end);
            async move { Ok(window) }
        })
        .await
        .unwrap();
        assert_eq!(&out[..], &payload[150..170]);

        // Request crossing the boundary is cut at the window end
        let p = payload.clone();
        let out = read_windowed(&cache, 99, 100, 190, 50, move |index| {
            let start = (index * 100) as usize;
            let window = p.slice(start..(start + 100).min(p.len()));
            async move { Ok(window) }
        })
        .await
        .unwrap();
        assert_eq!(&out[..], &payload[190..200]);
    }

    #[tokio::test]
    async fn exclusive_lease_times_out_with_concurrency_limit() {
        let gate = Arc::new(Semaphore::new(1));
        let first = ReadLease::acquire_exclusive(&gate, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(first.is_exclusive());

        let second = ReadLease::acquire_exclusive(&gate, Duration::from_millis(10)).await;
        assert_eq!(second.unwrap_err(), StreamError::ConcurrencyLimit);

        drop(first);
        assert!(ReadLease::acquire_exclusive(&gate, Duration::from_millis(10))
            .await
            .is_ok());
    }
}
