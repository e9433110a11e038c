//! Broadcast bus carrying device, session and stream events
//!
//! Producers publish and forget. The SSE endpoint and tests are the consumers; a
//! consumer that falls behind loses the oldest events rather than stalling a stream.

pub mod events;

pub use events::{BusEvent, ConnectionState, PlaybackState};

use futures::stream::Stream;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

/// Number of token characters that may appear in logs and events
const TOKEN_PREFIX_LEN: usize = 6;

static STREAM_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/stream/([0-9A-Za-z]+)").ok());

/// Events buffered per subscriber before the slowest one starts lagging
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `event` to current subscribers. Returns how many received it.
    pub fn publish(&self, event: BusEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!("No subscribers for {}", event.event_type());
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Stream of events, optionally narrowed to one device.
    ///
    /// With a device filter, events that are not about any device (sessions,
    /// streams, shutdown) still pass; only other devices' events are dropped.
    pub fn events(&self, device: Option<String>) -> impl Stream<Item = BusEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |received| {
            let event = match received {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    debug!("Event subscriber lagged, {} event(s) dropped", missed);
                    return None;
                }
            };
            match (&device, event.device_id()) {
                (Some(wanted), Some(id)) if wanted != id => None,
                _ => Some(event),
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

/// First characters of a session token, safe to log or publish.
pub fn short_token(token: &str) -> String {
    token.chars().take(TOKEN_PREFIX_LEN).collect()
}

/// Shortened token of a `/stream/{token}` URL, if `url` is one
pub fn stream_token_prefix(url: &str) -> Option<String> {
    let re = STREAM_TOKEN.as_ref()?;
    re.captures(url).map(|c| short_token(&c[1]))
}

/// `text` with every `/stream/{token}` cut down to the token prefix.
///
/// Device payloads carry whole stream URLs; this is what gets logged instead.
pub fn redact_stream_tokens(text: &str) -> String {
    match STREAM_TOKEN.as_ref() {
        Some(re) => re
            .replace_all(text, |c: &regex::Captures| {
                format!("/stream/{}...", short_token(&c[1]))
            })
            .into_owned(),
        None => "[redacted]".to_string(),
    }
}
