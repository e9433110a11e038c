//! Mock devices for adapter integration testing
//!
//! These mock servers speak the real device protocols (UPnP AVTransport, Kodi
//! JSON-RPC, VLC telnet, Cast v2) on loopback ports, so adapters can be exercised
//! end to end without hardware.

#![allow(dead_code)]

pub mod cast;
pub mod kodi;
pub mod upnp;
pub mod vlc;

pub use cast::MockCastReceiver;
pub use kodi::MockKodiServer;
pub use upnp::MockUpnpRenderer;
pub use vlc::MockVlcServer;
