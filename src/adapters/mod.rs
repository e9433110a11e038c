//! Display device adapters (UPnP, Chromecast, VLC, Kodi, browser) behind one `Device` contract

pub mod cast_proto;
pub mod chromecast;
pub mod connection;
pub mod handle;
pub mod kodi;
pub mod traits;
pub mod upnp;
pub mod vlc;
pub mod web;

pub use connection::ConnectionTracker;
pub use handle::{DeviceHandle, RetryConfig, COMMAND_ROUND_TRIPS};
pub use traits::{Device, DeviceStatus, PlayMedia};
