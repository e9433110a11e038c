//! UPnP/DLNA adapter - drives a Media Renderer's AVTransport service
//!
//! Control is plain SOAP over HTTP against the renderer's AVTransport control URL,
//! configured directly or resolved from the device description. Renderers are lenient
//! about metadata, so any 2xx SOAP reply counts as success.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use quick_xml::de::from_str as xml_from_str;
use quick_xml::escape::escape;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use ssdp_client::{SearchTarget, URN};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::adapters::connection::ConnectionTracker;
use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{PlaybackState, SharedBus};
use crate::config::UpnpDescriptor;
use crate::error::DeviceError;

const AV_TRANSPORT_URN: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const INSTANCE: &str = "<InstanceID>0</InstanceID>";
const PLAY_ARGS: &str = "<InstanceID>0</InstanceID><Speed>1</Speed>";

/// UPnP error 701, "Transition not available": Stop on a renderer that is not playing
const TRANSITION_NOT_AVAILABLE: u32 = 701;

const DLNA_VIDEO_FLAGS: &str = "21700000000000000000000000000000";

/// Failure of a single SOAP action
#[derive(Debug)]
enum SoapError {
    Device(DeviceError),
    /// The renderer answered with a SOAP fault
    Fault {
        action: &'static str,
        code: Option<u32>,
        description: String,
    },
}

impl From<DeviceError> for SoapError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl From<reqwest::Error> for SoapError {
    fn from(e: reqwest::Error) -> Self {
        Self::Device(e.into())
    }
}

impl From<SoapError> for DeviceError {
    fn from(e: SoapError) -> Self {
        match e {
            SoapError::Device(e) => e,
            SoapError::Fault {
                action,
                code,
                description,
            } => DeviceError::protocol(format!(
                "{} rejected: UPnP error {} ({})",
                action,
                code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
                description
            )),
        }
    }
}

pub struct UpnpDevice {
    id: String,
    name: String,
    http: Client,
    /// AVTransport control URL, resolved from `location` on first use when not configured
    control_url: OnceCell<String>,
    location: Option<String>,
    connection: ConnectionTracker,
}

impl UpnpDevice {
    pub fn new(id: String, descriptor: &UpnpDescriptor, bus: SharedBus) -> Self {
        let timeout = Duration::from_secs(descriptor.request_timeout.max(1));
        Self {
            name: descriptor.name.clone().unwrap_or_else(|| id.clone()),
            http: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            control_url: OnceCell::new_with(descriptor.control_url.clone()),
            location: descriptor.location.clone(),
            connection: ConnectionTracker::new(id.clone(), bus),
            id,
        }
    }

    async fn control_url(&self) -> Result<&str, DeviceError> {
        self.control_url
            .get_or_try_init(|| async {
                let location = self.location.as_deref().ok_or_else(|| {
                    DeviceError::protocol("neither control_url nor location configured")
                })?;
                let url = resolve_control_url(&self.http, location).await?;
                info!("{}: AVTransport control URL {}", self.id, url);
                Ok::<String, DeviceError>(url)
            })
            .await
            .map(String::as_str)
    }

    async fn soap_call(&self, action: &'static str, body: &str) -> Result<String, SoapError> {
        let url = self.control_url().await?;
        let envelope = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action} xmlns:u="{service_type}">{body}</u:{action}>
  </s:Body>
</s:Envelope>"#,
            action = action,
            service_type = AV_TRANSPORT_URN,
            body = body
        );

        debug!("{}: SOAP {}", self.id, action);
        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}#{}\"", AV_TRANSPORT_URN, action))
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        Err(SoapError::Fault {
            action,
            code: extract_xml_value(&text, "errorCode").and_then(|c| c.trim().parse().ok()),
            description: extract_xml_value(&text, "errorDescription")
                .unwrap_or_else(|| format!("HTTP {}", status)),
        })
    }

    /// SOAP call with the outcome folded into the connection state
    async fn invoke(&self, action: &'static str, body: &str) -> Result<String, SoapError> {
        let result = self.soap_call(action, body).await;
        match &result {
            Err(SoapError::Device(e)) => self.connection.observe(Err(e)),
            _ => self.connection.observe(Ok(())),
        }
        result
    }
}

#[async_trait]
impl Device for UpnpDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "upnp"
    }

    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        let metadata = didl_metadata(media);
        let args = format!(
            "{}<CurrentURI>{}</CurrentURI><CurrentURIMetaData>{}</CurrentURIMetaData>",
            INSTANCE,
            escape(media.url.as_str()),
            escape(metadata.as_str())
        );
        self.invoke("SetAVTransportURI", &args).await?;
        self.invoke("Play", PLAY_ARGS).await?;

        if resume_secs >= 1.0 {
            let seek = format!(
                "{}<Unit>REL_TIME</Unit><Target>{}</Target>",
                INSTANCE,
                format_hms(resume_secs)
            );
            // Playback already started; a renderer refusing to seek still plays
            if let Err(e) = self.invoke("Seek", &seek).await {
                warn!("{}: seek to {}s failed: {}", self.id, resume_secs, DeviceError::from(e));
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        match self.invoke("Stop", INSTANCE).await {
            Ok(_) => {}
            Err(SoapError::Fault {
                code: Some(TRANSITION_NOT_AVAILABLE),
                ..
            }) => debug!("{}: already stopped", self.id),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let info = self.invoke("GetTransportInfo", INSTANCE).await?;
        let state = extract_xml_value(&info, "CurrentTransportState")
            .map(|s| PlaybackState::from(s.trim()))
            .ok_or_else(|| DeviceError::protocol("GetTransportInfo reply lacks CurrentTransportState"))?;
        let state = match extract_xml_value(&info, "CurrentTransportStatus").as_deref() {
            Some("ERROR_OCCURRED") => PlaybackState::Error,
            _ => state,
        };

        let mut status = DeviceStatus::with_state(state);
        match self.invoke("GetPositionInfo", INSTANCE).await {
            Ok(position) => {
                status.position_secs =
                    extract_xml_value(&position, "RelTime").and_then(|t| parse_hms(&t));
                status.duration_secs =
                    extract_xml_value(&position, "TrackDuration").and_then(|t| parse_hms(&t));
            }
            Err(e) => debug!("{}: GetPositionInfo failed: {}", self.id, DeviceError::from(e)),
        }
        Ok(status)
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        self.invoke("Pause", INSTANCE).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.invoke("Play", PLAY_ARGS).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.connection.disconnected();
    }
}

// =============================================================================
// Discovery and description parsing
// =============================================================================

/// SSDP search for AVTransport renderers, one descriptor per distinct location.
pub async fn discover(timeout: Duration, request_timeout: u64) -> anyhow::Result<Vec<UpnpDescriptor>> {
    let urn: URN = AV_TRANSPORT_URN.parse()?;
    let search_target = SearchTarget::URN(urn);
    let responses = ssdp_client::search(&search_target, timeout, 2, None).await?;

    futures::pin_mut!(responses);

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    while let Some(response) = responses.next().await {
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!("SSDP response error: {}", e);
                continue;
            }
        };

        let location = response.location().to_string();
        if seen.insert(location.clone()) {
            info!("Discovered UPnP renderer at {}", location);
            found.push(UpnpDescriptor {
                name: None,
                control_url: None,
                location: Some(location),
                request_timeout,
            });
        }
    }

    Ok(found)
}

#[derive(Deserialize)]
struct Root {
    #[serde(rename = "URLBase")]
    url_base: Option<String>,
    device: DeviceDesc,
}

#[derive(Deserialize)]
struct DeviceDesc {
    #[serde(rename = "serviceList")]
    service_list: Option<ServiceList>,
    #[serde(rename = "deviceList")]
    device_list: Option<DeviceList>,
}

#[derive(Deserialize)]
struct ServiceList {
    #[serde(default)]
    service: Vec<ServiceDesc>,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    device: Vec<DeviceDesc>,
}

#[derive(Deserialize)]
struct ServiceDesc {
    #[serde(rename = "serviceType")]
    service_type: String,
    #[serde(rename = "controlURL")]
    control_url: Option<String>,
}

fn find_av_transport(device: &DeviceDesc) -> Option<&str> {
    let own = device.service_list.as_ref().and_then(|list| {
        list.service
            .iter()
            .find(|s| s.service_type.contains("AVTransport"))
            .and_then(|s| s.control_url.as_deref())
    });
    own.or_else(|| {
        device
            .device_list
            .as_ref()
            .and_then(|list| list.device.iter().find_map(find_av_transport))
    })
}

/// Absolute AVTransport control URL from a device description document.
fn parse_description(xml: &str, location: &str) -> Result<String, DeviceError> {
    let root: Root = xml_from_str(xml)
        .map_err(|e| DeviceError::protocol(format!("bad device description: {}", e)))?;
    let control = find_av_transport(&root.device)
        .ok_or_else(|| DeviceError::protocol("device has no AVTransport service"))?;

    let base = root
        .url_base
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(location);
    let base = url::Url::parse(base)
        .map_err(|e| DeviceError::protocol(format!("bad description URL {}: {}", base, e)))?;
    base.join(control.trim())
        .map(|u| u.to_string())
        .map_err(|e| DeviceError::protocol(format!("bad control URL {}: {}", control, e)))
}

async fn resolve_control_url(http: &Client, location: &str) -> Result<String, DeviceError> {
    let response = http.get(location).send().await?;
    if !response.status().is_success() {
        return Err(DeviceError::protocol(format!(
            "description fetch returned {}",
            response.status()
        )));
    }
    let xml = response.text().await?;
    parse_description(&xml, location)
}

// =============================================================================
// Helpers
// =============================================================================

/// DIDL-Lite item describing the stream. Titles are reduced to ASCII, which some
/// renderers require.
fn didl_metadata(media: &PlayMedia) -> String {
    let title: String = media.display_title().chars().filter(char::is_ascii).collect();
    format!(
        r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="0" parentID="-1" restricted="1"><dc:title>{title}</dc:title><upnp:class>object.item.videoItem.movie</upnp:class><res protocolInfo="http-get:*:{mime}:DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS={flags}">{url}</res></item></DIDL-Lite>"#,
        title = escape(title.as_str()),
        mime = escape(media.content_type.as_str()),
        flags = DLNA_VIDEO_FLAGS,
        url = escape(media.url.as_str()),
    )
}

/// Seconds as `H:MM:SS`
fn format_hms(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// `H:MM:SS[.fff]` to seconds; `NOT_IMPLEMENTED` and friends yield `None`
fn parse_hms(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((hours * 3600 + minutes * 60) as f64 + seconds)
}

/// Extract XML value, handling optional namespace prefixes (e.g., <u:Volume> or <Volume>)
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"<(?:[^:>]+:)?{}\b[^>]*>([^<]*)</(?:[^:>]+:)?{}>",
        regex::escape(tag),
        regex::escape(tag)
    );

    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn didl_is_ascii_and_escaped() {
        let media = PlayMedia::new("http://10.0.0.2:8350/stream/ab&cd", "video/x-matroska")
            .with_title("Amélie <2001>");
        let didl = didl_metadata(&media);
        assert!(didl.contains("<dc:title>Amlie &lt;2001&gt;</dc:title>"));
        assert!(didl.contains("object.item.videoItem.movie"));
        assert!(didl.contains("http-get:*:video/x-matroska:DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=217"));
        assert!(didl.contains("/stream/ab&amp;cd</res>"));
    }

    #[test]
    fn hms_round_trip() {
        assert_eq!(format_hms(0.0), "0:00:00");
        assert_eq!(format_hms(3723.9), "1:02:03");
        assert_eq!(parse_hms("1:02:03"), Some(3723.0));
        assert_eq!(parse_hms("00:00:05.500"), Some(5.5));
        assert_eq!(parse_hms("NOT_IMPLEMENTED"), None);
        assert_eq!(parse_hms("1:2"), None);
    }

    #[test]
    fn extracts_prefixed_values() {
        let xml = r#"<s:Body><u:GetTransportInfoResponse><CurrentTransportState>PAUSED_PLAYBACK</CurrentTransportState><m:errorCode xmlns:m="x">701</m:errorCode></u:GetTransportInfoResponse></s:Body>"#;
        assert_eq!(
            extract_xml_value(xml, "CurrentTransportState").as_deref(),
            Some("PAUSED_PLAYBACK")
        );
        assert_eq!(extract_xml_value(xml, "errorCode").as_deref(), Some("701"));
        assert_eq!(extract_xml_value(xml, "Missing"), None);
    }

    #[test]
    fn resolves_relative_control_url() {
        let xml = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <friendlyName>Living Room TV</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <controlURL>/rc/control</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <controlURL>/upnp/control/AVTransport1</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;
        let url = parse_description(xml, "http://192.168.1.20:9197/dmr").unwrap();
        assert_eq!(url, "http://192.168.1.20:9197/upnp/control/AVTransport1");
    }

    #[test]
    fn finds_service_in_embedded_device() {
        let xml = r#"<root>
  <URLBase>http://10.0.0.9:1400/</URLBase>
  <device>
    <deviceList>
      <device>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
            <controlURL>MediaRenderer/AVTransport/Control</controlURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;
        let url = parse_description(xml, "http://10.0.0.9:1400/xml/device.xml").unwrap();
        assert_eq!(url, "http://10.0.0.9:1400/MediaRenderer/AVTransport/Control");
    }

    #[test]
    fn description_without_av_transport_is_protocol_error() {
        let xml = r#"<root><device><serviceList></serviceList></device></root>"#;
        assert!(matches!(
            parse_description(xml, "http://h/d.xml"),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn faults_map_to_protocol_errors() {
        let err: DeviceError = SoapError::Fault {
            action: "Play",
            code: Some(716),
            description: "Resource not found".into(),
        }
        .into();
        assert_eq!(
            err,
            DeviceError::Protocol("Play rejected: UPnP error 716 (Resource not found)".into())
        );
    }
}
