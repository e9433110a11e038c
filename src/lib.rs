//! castbridge - play videos on separate display devices
//!
//! A video from a message attachment or a URL is bound to an unguessable session
//! token and served over HTTP with byte-range support while its bytes are still
//! being fetched. The device is told to open that stream URL through its own
//! control protocol:
//! - UPnP/DLNA AVTransport (SOAP)
//! - Chromecast (Cast v2 control channel)
//! - VLC (telnet interface)
//! - Kodi (JSON-RPC over HTTP)
//! - A browser page polling for its next URL
//!
//! Server-Sent Events report device and stream activity.

pub mod adapters;
pub mod api;
pub mod bus;
pub mod config;
pub mod content;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod registry;
pub mod session;
