//! Connection state machine for adapters with long-lived control channels.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲  ▲            │              │
//!      │  └── Failed ◄─┴──────────────┘
//!      └──────── (any) ── teardown
//! ```
//!
//! Adapters consult the tracker before reusing a channel and record every transition
//! through it, so reconnect policy lives in one place instead of at each call site.

use tokio::sync::watch;
use tracing::debug;

use crate::bus::{BusEvent, ConnectionState, SharedBus};
use crate::error::DeviceError;

/// Whether `from -> to` is a legal transition
pub fn is_valid_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Failed { .. }, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed { .. })
            | (Connected, Failed { .. })
            | (_, Disconnected)
    )
}

pub struct ConnectionTracker {
    device_id: String,
    state: watch::Sender<ConnectionState>,
    bus: SharedBus,
}

impl ConnectionTracker {
    pub fn new(device_id: impl Into<String>, bus: SharedBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            device_id: device_id.into(),
            state,
            bus,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply `next` if legal from the current state. Returns whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || !is_valid_transition(current, &next) {
                return false;
            }
            previous = Some(std::mem::replace(current, next.clone()));
            true
        });

        if changed {
            debug!(
                "{}: connection {} -> {}",
                self.device_id,
                previous.map(|p| p.to_string()).unwrap_or_default(),
                next
            );
            self.bus.publish(BusEvent::DeviceConnectionChanged {
                device_id: self.device_id.clone(),
                state: next,
            });
        }
        changed
    }

    /// Start a connection attempt. False when already connecting or connected.
    pub fn begin_connect(&self) -> bool {
        self.transition(ConnectionState::Connecting)
    }

    pub fn connected(&self) -> bool {
        self.transition(ConnectionState::Connected)
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.transition(ConnectionState::Failed {
            reason: reason.into(),
        })
    }

    pub fn disconnected(&self) -> bool {
        self.transition(ConnectionState::Disconnected)
    }

    /// Fold one request/response round trip into the state, for protocols
    /// without a persistent channel. Protocol errors still prove reachability.
    pub fn observe(&self, outcome: Result<(), &DeviceError>) {
        match outcome {
            Ok(()) => {
                if !self.is_connected() {
                    self.begin_connect();
                    self.connected();
                }
            }
            Err(e) if e.is_retryable() => match self.state() {
                ConnectionState::Failed { .. } => {}
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.failed(e.to_string());
                }
                ConnectionState::Disconnected => {
                    self.begin_connect();
                    self.failed(e.to_string());
                }
            },
            Err(_) => self.observe(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;

    #[test]
    fn follows_transition_rules() {
        let tracker = ConnectionTracker::new("vlc@tv", create_bus());
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        // Cannot jump straight to Connected
        assert!(!tracker.connected());
        assert!(tracker.begin_connect());
        assert!(!tracker.begin_connect());
        assert!(tracker.connected());
        assert!(tracker.is_connected());

        assert!(tracker.failed("reset by peer"));
        assert!(matches!(tracker.state(), ConnectionState::Failed { .. }));
        // Failed can only retry or tear down
        assert!(!tracker.connected());
        assert!(tracker.begin_connect());
        assert!(tracker.disconnected());
        assert!(!tracker.disconnected());
    }

    #[test]
    fn transitions_are_published() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let tracker = ConnectionTracker::new("cast@den", bus);

        tracker.begin_connect();
        tracker.connected();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::DeviceConnectionChanged { device_id, state } = event {
                assert_eq!(device_id, "cast@den");
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn observed_round_trips_drive_state() {
        let tracker = ConnectionTracker::new("upnp@tv", create_bus());
        tracker.observe(Err(&DeviceError::unreachable("refused")));
        assert!(matches!(tracker.state(), ConnectionState::Failed { .. }));

        tracker.observe(Ok(()));
        assert!(tracker.is_connected());

        // A rejection means the device answered
        tracker.observe(Err(&DeviceError::protocol("fault")));
        assert!(tracker.is_connected());
    }

    #[tokio::test]
    async fn watchers_see_changes() {
        let tracker = ConnectionTracker::new("x", create_bus());
        let mut rx = tracker.subscribe();
        tracker.begin_connect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }
}
