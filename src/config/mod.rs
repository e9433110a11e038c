//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, an optional `config.{toml,json,yaml}`
//! in the config directory, then `CASTBRIDGE_*` environment variables (`__` separates
//! nesting, e.g. `CASTBRIDGE_MEDIA__BLOCK_SIZE`).

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Media server, session and content-fetch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host advertised in stream URLs handed to devices
    #[serde(default)]
    pub public_host: Option<String>,
    /// Upstream fetch window; reads are aligned to it
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: usize,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// How long a second reader waits on a sequential-only source
    #[serde(default = "default_reader_wait")]
    pub reader_wait_secs: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_idle_gone_timeout")]
    pub idle_gone_timeout_secs: u64,
    /// Empirical sustainable ceiling; sizes fetch-ahead, not enforced
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_bps: u64,
    #[serde(default = "default_fetch_ahead_secs")]
    pub fetch_ahead_secs: u64,
    #[serde(default = "default_upstream_concurrency")]
    pub upstream_concurrency: usize,
    #[serde(default = "default_max_downloads")]
    pub max_concurrent_downloads: usize,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8350
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_cache_budget() -> usize {
    64 * 1024 * 1024
}

fn default_stall_timeout() -> u64 {
    20
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_reader_wait() -> u64 {
    5
}

fn default_session_ttl() -> u64 {
    4 * 60 * 60
}

fn default_idle_gone_timeout() -> u64 {
    900
}

fn default_max_bitrate() -> u64 {
    4_500_000
}

fn default_fetch_ahead_secs() -> u64 {
    4
}

fn default_upstream_concurrency() -> usize {
    4
}

fn default_max_downloads() -> usize {
    10
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            public_host: None,
            block_size: default_block_size(),
            cache_budget_bytes: default_cache_budget(),
            stall_timeout_secs: default_stall_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            reader_wait_secs: default_reader_wait(),
            session_ttl_secs: default_session_ttl(),
            idle_gone_timeout_secs: default_idle_gone_timeout(),
            max_bitrate_bps: default_max_bitrate(),
            fetch_ahead_secs: default_fetch_ahead_secs(),
            upstream_concurrency: default_upstream_concurrency(),
            max_concurrent_downloads: default_max_downloads(),
        }
    }
}

impl MediaConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn reader_wait(&self) -> Duration {
        Duration::from_secs(self.reader_wait_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn idle_gone_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_gone_timeout_secs)
    }

    /// Windows to fetch ahead of the reader so `fetch_ahead_secs` of video at the
    /// bitrate ceiling is already in flight.
    pub fn fetch_ahead_windows(&self) -> usize {
        let bytes = self.max_bitrate_bps / 8 * self.fetch_ahead_secs;
        let block = self.block_size.max(1) as u64;
        (bytes.div_ceil(block) as usize).max(1)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// SSDP search for AVTransport renderers at startup
    #[serde(default)]
    pub upnp: bool,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

fn default_discovery_timeout() -> u64 {
    3
}

// =============================================================================
// Device descriptors
// =============================================================================

/// One configured display device. The `type` tag selects the protocol adapter;
/// an unrecognised tag fails deserialization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceDescriptor {
    Upnp(UpnpDescriptor),
    Chromecast(ChromecastDescriptor),
    Vlc(VlcDescriptor),
    Xbmc(XbmcDescriptor),
    Web(WebDescriptor),
}

fn default_request_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpnpDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    /// AVTransport control URL
    #[serde(default)]
    pub control_url: Option<String>,
    /// Device description URL, resolved to the control URL on first use
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChromecastDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_chromecast_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_cast_app")]
    pub app_id: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_chromecast_port() -> u16 {
    8009
}

fn default_true() -> bool {
    true
}

fn default_cast_app() -> String {
    "CC1AD845".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VlcDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_vlc_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_vlc_port() -> u16 {
    4212
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct XbmcDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_xbmc_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_xbmc_path")]
    pub path: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_xbmc_port() -> u16 {
    8080
}

fn default_xbmc_path() -> String {
    "/jsonrpc".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl DeviceDescriptor {
    /// Protocol tag as written in config
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upnp(_) => "upnp",
            Self::Chromecast(_) => "chromecast",
            Self::Vlc(_) => "vlc",
            Self::Xbmc(_) => "xbmc",
            Self::Web(_) => "web",
        }
    }

    /// Stable id used to address the device: the configured name, else `kind@host`.
    pub fn id(&self) -> String {
        let name = match self {
            Self::Upnp(d) => d.name.as_ref(),
            Self::Chromecast(d) => d.name.as_ref(),
            Self::Vlc(d) => d.name.as_ref(),
            Self::Xbmc(d) => d.name.as_ref(),
            Self::Web(d) => d.name.as_ref(),
        };
        if let Some(name) = name {
            return name.clone();
        }
        match self {
            Self::Upnp(d) => {
                let host = d
                    .control_url
                    .as_deref()
                    .or(d.location.as_deref())
                    .and_then(|u| url::Url::parse(u).ok())
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("upnp@{}", host)
            }
            Self::Chromecast(d) => format!("chromecast@{}", d.host),
            Self::Vlc(d) => format!("vlc@{}", d.host),
            Self::Xbmc(d) => format!("xbmc@{}", d.host),
            Self::Web(_) => "web".to_string(),
        }
    }

    /// Bound on every protocol round-trip for this device
    pub fn request_timeout(&self) -> Duration {
        let secs = match self {
            Self::Upnp(d) => d.request_timeout,
            Self::Chromecast(d) => d.request_timeout,
            Self::Vlc(d) => d.request_timeout,
            Self::Xbmc(d) => d.request_timeout,
            Self::Web(d) => d.request_timeout,
        };
        Duration::from_secs(secs.max(1))
    }
}

impl Config {
    /// Reject descriptor lists the registry cannot build from.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for (i, descriptor) in self.devices.iter().enumerate() {
            if self.devices[..i].contains(descriptor) {
                bail!(
                    "duplicate {} device in config: {}",
                    descriptor.kind(),
                    descriptor.id()
                );
            }
            if !ids.insert(descriptor.id()) {
                bail!("two devices share the id {:?}", descriptor.id());
            }
            if let DeviceDescriptor::Upnp(d) = descriptor {
                if d.control_url.is_none() && d.location.is_none() {
                    bail!(
                        "upnp device {:?} needs either control_url or location",
                        descriptor.id()
                    );
                }
            }
        }
        if self.media.block_size == 0 {
            bail!("media.block_size must be greater than zero");
        }
        Ok(())
    }
}

/// Get config directory (CASTBRIDGE_CONFIG_DIR, XDG_CONFIG_HOME, or platform default)
pub fn get_config_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("CASTBRIDGE_CONFIG_DIR") {
        return std::path::PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join("Library/Application Support/castbridge");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return std::path::PathBuf::from(xdg).join("castbridge");
        }
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join(".config/castbridge");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return std::path::PathBuf::from(appdata).join("castbridge");
        }
    }

    std::path::PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("media.port", default_port() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        .add_source(
            ::config::Environment::with_prefix("CASTBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Port precedence: CASTBRIDGE_PORT > PORT > config > default
    if let Ok(port) = std::env::var("CASTBRIDGE_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("media.port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("media.port", port_num as i64)?;
        }
    }

    let config: Config = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
