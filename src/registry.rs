//! DeviceRegistry - the configured devices, addressed by id
//!
//! Built once at startup from the descriptor list and shared by reference. Every
//! device sits behind a [`DeviceHandle`], so callers never reach an adapter without
//! its command lock and timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::adapters::chromecast::ChromecastDevice;
use crate::adapters::kodi::XbmcDevice;
use crate::adapters::upnp::UpnpDevice;
use crate::adapters::vlc::VlcDevice;
use crate::adapters::web::{PollOutcome, WebUiDevice};
use crate::adapters::{Device, DeviceHandle, DeviceStatus, PlayMedia, COMMAND_ROUND_TRIPS};
use crate::bus::SharedBus;
use crate::config::DeviceDescriptor;
use crate::error::DeviceError;

/// Bound on tearing down all devices at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Device listing entry
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
}

pub struct DeviceRegistry {
    /// Config order, for stable listings
    devices: Vec<Arc<DeviceHandle>>,
    by_id: HashMap<String, usize>,
    /// Browser devices, also reachable through the register/poll endpoints
    web: Vec<Arc<WebUiDevice>>,
}

impl DeviceRegistry {
    /// Resolve every descriptor into its adapter. Duplicate ids are a configuration error.
    pub fn from_descriptors(descriptors: &[DeviceDescriptor], bus: SharedBus) -> Result<Self> {
        let mut registry = Self {
            devices: Vec::with_capacity(descriptors.len()),
            by_id: HashMap::new(),
            web: Vec::new(),
        };

        for descriptor in descriptors {
            let id = descriptor.id();
            if registry.by_id.contains_key(&id) {
                bail!("two devices share the id {:?}", id);
            }

            let device: Arc<dyn Device> = match descriptor {
                DeviceDescriptor::Upnp(d) => Arc::new(UpnpDevice::new(id.clone(), d, bus.clone())),
                DeviceDescriptor::Chromecast(d) => {
                    Arc::new(ChromecastDevice::new(id.clone(), d, bus.clone()))
                }
                DeviceDescriptor::Vlc(d) => Arc::new(VlcDevice::new(id.clone(), d, bus.clone())),
                DeviceDescriptor::Xbmc(d) => Arc::new(XbmcDevice::new(id.clone(), d, bus.clone())),
                DeviceDescriptor::Web(d) => {
                    let web = Arc::new(WebUiDevice::new(id.clone(), d, bus.clone()));
                    registry.web.push(web.clone());
                    web
                }
            };

            let command_timeout = descriptor.request_timeout() * COMMAND_ROUND_TRIPS;
            info!(
                "Registered {} device {:?} (command timeout {:?})",
                descriptor.kind(),
                id,
                command_timeout
            );
            registry.insert(device, command_timeout, &bus);
        }

        Ok(registry)
    }

    /// Registry over already-built adapters, all sharing one command timeout.
    pub fn from_devices(
        devices: Vec<Arc<dyn Device>>,
        command_timeout: Duration,
        bus: SharedBus,
    ) -> Result<Self> {
        let mut registry = Self {
            devices: Vec::with_capacity(devices.len()),
            by_id: HashMap::new(),
            web: Vec::new(),
        };
        for device in devices {
            if registry.by_id.contains_key(device.id()) {
                bail!("two devices share the id {:?}", device.id());
            }
            registry.insert(device, command_timeout, &bus);
        }
        Ok(registry)
    }

    fn insert(&mut self, device: Arc<dyn Device>, command_timeout: Duration, bus: &SharedBus) {
        self.by_id.insert(device.id().to_string(), self.devices.len());
        self.devices
            .push(Arc::new(DeviceHandle::new(device, command_timeout, bus.clone())));
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Result<&Arc<DeviceHandle>, DeviceError> {
        self.by_id
            .get(id)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<DeviceSummary> {
        self.devices
            .iter()
            .map(|d| DeviceSummary {
                id: d.id().to_string(),
                name: d.name().to_string(),
                kind: d.kind(),
            })
            .collect()
    }

    pub async fn play(&self, id: &str, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        self.get(id)?.play(media, resume_secs).await
    }

    pub async fn stop(&self, id: &str) -> Result<(), DeviceError> {
        self.get(id)?.stop().await
    }

    pub async fn pause(&self, id: &str) -> Result<(), DeviceError> {
        self.get(id)?.pause().await
    }

    pub async fn resume(&self, id: &str) -> Result<(), DeviceError> {
        self.get(id)?.resume().await
    }

    pub async fn status(&self, id: &str) -> Result<DeviceStatus, DeviceError> {
        self.get(id)?.status().await
    }

    /// Attach a browser to the web device whose password matches.
    pub fn register_browser(&self, password: &str) -> Option<String> {
        self.web.iter().find_map(|web| web.register(password))
    }

    /// Poll on behalf of a browser; the token identifies its web device.
    pub fn poll_browser(&self, token: &str) -> PollOutcome {
        for web in &self.web {
            match web.poll(token) {
                PollOutcome::UnknownClient => continue,
                other => return other,
            }
        }
        PollOutcome::UnknownClient
    }

    /// Tear down every device's connections and background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down {} device(s)", self.devices.len());
        let teardown = join_all(self.devices.iter().map(|d| d.shutdown()));
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
            warn!("Device teardown did not finish within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}
