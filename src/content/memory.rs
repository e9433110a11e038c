//! In-process content, always random access.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{next_source_id, Access, ContentInfo, ContentSource, SourceKind};
use crate::error::StreamError;

pub struct MemorySource {
    id: u64,
    data: Bytes,
    mime_type: String,
    file_name: Option<String>,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            id: next_source_id(),
            data: data.into(),
            mime_type: mime_type.into(),
            file_name: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Memory
    }

    async fn probe(&self) -> Result<ContentInfo, StreamError> {
        Ok(ContentInfo {
            length: Some(self.data.len() as u64),
            mime_type: self.mime_type.clone(),
            file_name: self.file_name.clone(),
            access: Access::RandomAccess,
        })
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Cancelled);
        }
        let total = self.data.len() as u64;
        if offset >= total {
            return Ok(Bytes::new());
        }
        let start = offset as usize;
        let end = self.data.len().min(start.saturating_add(len));
        Ok(self.data.slice(start..end))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
