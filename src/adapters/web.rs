//! Browser display: a page registers with the shared password, then polls for the
//! stream URL it should open in an HTML5 `<video>`.
//!
//! There is no remote protocol; "playing" means parking the URL until every attached
//! page has picked it up. A page that has not polled within the request timeout is
//! considered gone.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{BusEvent, PlaybackState, SharedBus};
use crate::config::WebDescriptor;
use crate::error::DeviceError;

const CLIENT_TOKEN_LEN: usize = 32;

/// Outcome of one poll, mapped 1:1 onto HTTP statuses by the API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Token is not a client token at all (400)
    Malformed,
    /// Well-formed but not attached, or pruned (404)
    UnknownClient,
    /// Open this URL now (200); handed out once
    Play(String),
    /// Keep polling (302)
    NothingPending,
}

#[derive(Debug)]
struct WebClient {
    pending_url: Option<String>,
    now_playing: Option<String>,
    last_poll: Instant,
}

pub struct WebUiDevice {
    id: String,
    name: String,
    password: String,
    client_timeout: Duration,
    clients: Mutex<HashMap<String, WebClient>>,
    bus: SharedBus,
}

impl WebUiDevice {
    pub fn new(id: String, descriptor: &WebDescriptor, bus: SharedBus) -> Self {
        Self {
            name: descriptor
                .name
                .clone()
                .unwrap_or_else(|| "Web browser".to_string()),
            password: descriptor.password.clone(),
            client_timeout: Duration::from_secs(descriptor.request_timeout.max(1)),
            clients: Mutex::new(HashMap::new()),
            bus,
            id,
        }
    }

    /// Attach a browser. Returns its client token, or `None` for a wrong password.
    pub fn register(&self, password: &str) -> Option<String> {
        if password != self.password {
            debug!("{}: rejected registration", self.id);
            return None;
        }

        let mut bytes = [0u8; CLIENT_TOKEN_LEN / 2];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let attached = self.with_clients(|clients| {
            clients.insert(
                token.clone(),
                WebClient {
                    pending_url: None,
                    now_playing: None,
                    last_poll: Instant::now(),
                },
            );
        });
        info!("{}: browser attached ({} total)", self.id, attached.1);
        Some(token)
    }

    pub fn poll(&self, token: &str) -> PollOutcome {
        if token.len() != CLIENT_TOKEN_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return PollOutcome::Malformed;
        }

        let (outcome, _) = self.with_clients(|clients| match clients.get_mut(token) {
            None => PollOutcome::UnknownClient,
            Some(client) => {
                client.last_poll = Instant::now();
                match client.pending_url.take() {
                    Some(url) => {
                        client.now_playing = Some(url.clone());
                        PollOutcome::Play(url)
                    }
                    None => PollOutcome::NothingPending,
                }
            }
        });
        outcome
    }

    pub fn attached_clients(&self) -> usize {
        self.with_clients(|_| ()).1
    }

    /// Run `f` over the live clients after pruning stale ones. Publishes the attached
    /// count whenever it changed.
    fn with_clients<T>(&self, f: impl FnOnce(&mut HashMap<String, WebClient>) -> T) -> (T, usize) {
        let (result, before, after) = {
            let mut clients = match self.clients.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = clients.len();
            let timeout = self.client_timeout;
            clients.retain(|_, c| c.last_poll.elapsed() <= timeout);
            let pruned = before - clients.len();
            if pruned > 0 {
                debug!("{}: pruned {} silent browser(s)", self.id, pruned);
            }
            let result = f(&mut clients);
            (result, before, clients.len())
        };

        if before != after {
            self.bus.publish(BusEvent::WebClientChanged {
                device_id: self.id.clone(),
                attached_clients: after,
            });
        }
        (result, after)
    }
}

#[async_trait]
impl Device for WebUiDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "web"
    }

    /// Browsers seek themselves from the `#t=` media fragment.
    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        let url = if resume_secs >= 1.0 {
            format!("{}#t={}", media.url, resume_secs as u64)
        } else {
            media.url.clone()
        };

        let (_, attached) = self.with_clients(|clients| {
            for client in clients.values_mut() {
                client.pending_url = Some(url.clone());
            }
        });
        if attached == 0 {
            return Err(DeviceError::unreachable("no browser attached"));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.with_clients(|clients| {
            for client in clients.values_mut() {
                client.pending_url = None;
                client.now_playing = None;
            }
        });
        Ok(())
    }

    async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let (playing, attached) =
            self.with_clients(|clients| clients.values().any(|c| c.now_playing.is_some()));
        let state = match (attached, playing) {
            (0, _) => PlaybackState::Unknown,
            (_, true) => PlaybackState::Playing,
            (_, false) => PlaybackState::Idle,
        };
        Ok(DeviceStatus::with_state(state))
    }

    async fn shutdown(&self) {
        self.with_clients(|clients| clients.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;

    fn device(timeout_secs: u64) -> WebUiDevice {
        let descriptor = WebDescriptor {
            name: None,
            password: "hunter2".to_string(),
            request_timeout: timeout_secs,
        };
        WebUiDevice::new("web".to_string(), &descriptor, create_bus())
    }

    #[test]
    fn wrong_password_is_rejected() {
        let web = device(5);
        assert!(web.register("nope").is_none());
        assert_eq!(web.attached_clients(), 0);
    }

    #[test]
    fn poll_distinguishes_malformed_and_unknown() {
        let web = device(5);
        assert_eq!(web.poll("short"), PollOutcome::Malformed);
        assert_eq!(web.poll(&"z".repeat(32)), PollOutcome::Malformed);
        assert_eq!(web.poll(&"a".repeat(32)), PollOutcome::UnknownClient);
    }

    #[tokio::test]
    async fn url_is_handed_out_once() {
        let web = device(5);
        let token = web.register("hunter2").unwrap();
        assert_eq!(web.poll(&token), PollOutcome::NothingPending);

        let media = PlayMedia::new("http://10.0.0.2:8350/stream/abc", "video/mp4");
        web.play(&media, 0.0).await.unwrap();
        assert_eq!(
            web.poll(&token),
            PollOutcome::Play("http://10.0.0.2:8350/stream/abc".into())
        );
        assert_eq!(web.poll(&token), PollOutcome::NothingPending);
        assert_eq!(web.status().await.unwrap().state, PlaybackState::Playing);

        web.stop().await.unwrap();
        assert_eq!(web.status().await.unwrap().state, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn play_without_browser_is_unreachable() {
        let web = device(5);
        let media = PlayMedia::new("http://h/stream/t", "video/mp4");
        assert!(matches!(
            web.play(&media, 0.0).await,
            Err(DeviceError::Unreachable(_))
        ));
        assert_eq!(web.status().await.unwrap().state, PlaybackState::Unknown);
    }

    #[tokio::test]
    async fn resume_becomes_media_fragment() {
        let web = device(5);
        let token = web.register("hunter2").unwrap();
        let media = PlayMedia::new("http://h/stream/t", "video/mp4");
        web.play(&media, 90.4).await.unwrap();
        assert_eq!(
            web.poll(&token),
            PollOutcome::Play("http://h/stream/t#t=90".into())
        );
    }

    #[tokio::test]
    async fn stop_clears_pending_url() {
        let web = device(5);
        let token = web.register("hunter2").unwrap();
        web.play(&PlayMedia::new("http://h/s", "video/mp4"), 0.0)
            .await
            .unwrap();
        web.stop().await.unwrap();
        assert_eq!(web.poll(&token), PollOutcome::NothingPending);
    }

    #[test]
    fn attach_is_published() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let descriptor = WebDescriptor {
            name: Some("lounge".into()),
            password: String::new(),
            request_timeout: 5,
        };
        let web = WebUiDevice::new("lounge".into(), &descriptor, bus);
        web.register("").unwrap();

        match rx.try_recv().unwrap() {
            BusEvent::WebClientChanged {
                device_id,
                attached_clients,
            } => {
                assert_eq!(device_id, "lounge");
                assert_eq!(attached_clients, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
