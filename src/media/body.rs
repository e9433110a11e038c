//! Streaming response bodies.
//!
//! Each response gets its own producer task with its own cursor. The task stops as soon
//! as the client goes away (the body receiver is dropped), the server shuts down, or the
//! source stalls; dropping the in-progress read cancels this request's upstream fetch
//! without touching other requests on the same session.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::content::ReadLease;
use crate::error::StreamError;
use crate::session::{StreamSession, TransportGuard};

/// Chunks buffered between the producer and hyper
const BODY_CHANNEL_DEPTH: usize = 4;

pub(crate) struct BodyPlan {
    pub start: u64,
    /// Inclusive last byte; `None` streams until the source reports end of content
    pub end: Option<u64>,
    /// Whether stopping short of `end` is an error (declared length was promised)
    pub exact: bool,
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

impl BodyPlan {
    fn remaining(&self, offset: u64) -> Option<u64> {
        self.end.map(|end| (end + 1).saturating_sub(offset))
    }
}

/// Stream `plan` from the session's source, starting with an already-read `first` chunk.
pub(crate) fn stream_body(
    guard: TransportGuard,
    lease: ReadLease,
    first: Bytes,
    plan: BodyPlan,
    shutdown: CancellationToken,
    bus: SharedBus,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let session = guard.session().clone();
        let outcome = produce(&session, &tx, first, &plan, &shutdown).await;

        let (sent, completed) = match outcome {
            Ok(sent) => (sent, true),
            Err((sent, e)) => {
                match e {
                    StreamError::Cancelled => {
                        debug!("Stream {} ended by client after {} bytes", session.token_prefix(), sent)
                    }
                    ref other => {
                        warn!("Stream {} aborted after {} bytes: {}", session.token_prefix(), sent, other);
                        let reason = std::io::Error::new(std::io::ErrorKind::Other, other.to_string());
                        if tx.send(Err(reason)).await.is_err() {
                            debug!("Client already gone, dropping stream error");
                        }
                    }
                }
                (sent, false)
            }
        };

        bus.publish(BusEvent::StreamClosed {
            token_prefix: session.token_prefix(),
            bytes_sent: sent,
            completed,
        });
        drop(lease);
        drop(guard);
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Returns bytes sent, or bytes sent plus the reason streaming stopped early.
async fn produce(
    session: &Arc<StreamSession>,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    first: Bytes,
    plan: &BodyPlan,
    shutdown: &CancellationToken,
) -> Result<u64, (u64, StreamError)> {
    let source = session.source().clone();
    let mut offset = plan.start;
    let mut sent = 0u64;
    let mut pending = Some(first);

    loop {
        let want = match plan.remaining(offset) {
            Some(0) => return Ok(sent),
            Some(n) => n.min(plan.chunk_size as u64) as usize,
            None => plan.chunk_size,
        };

        let mut chunk = match pending.take() {
            Some(chunk) => chunk,
            None => {
                tokio::select! {
                    _ = tx.closed() => return Err((sent, StreamError::Cancelled)),
                    _ = shutdown.cancelled() => return Err((sent, StreamError::Cancelled)),
                    read = tokio::time::timeout(plan.stall_timeout, source.read(offset, want)) => {
                        match read {
                            Err(_) => return Err((sent, StreamError::UpstreamStalled(plan.stall_timeout))),
                            Ok(Err(e)) => return Err((sent, e)),
                            Ok(Ok(chunk)) => chunk,
                        }
                    }
                }
            }
        };

        if chunk.is_empty() {
            if plan.exact && plan.remaining(offset).is_some_and(|n| n > 0) {
                return Err((sent, StreamError::upstream("content ended before declared length")));
            }
            return Ok(sent);
        }
        if chunk.len() > want {
            chunk.truncate(want);
        }

        let len = chunk.len();
        tokio::select! {
            _ = shutdown.cancelled() => return Err((sent, StreamError::Cancelled)),
            delivered = tx.send(Ok(chunk)) => {
                if delivered.is_err() {
                    return Err((sent, StreamError::Cancelled));
                }
            }
        }

        session.record_served(offset, len, plan.chunk_size);
        offset += len as u64;
        sent += len as u64;
    }
}
