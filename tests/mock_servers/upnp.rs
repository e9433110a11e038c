//! AVTransport renderer double
//!
//! Serves a device description and an AVTransport control endpoint, recording every
//! SOAP action in arrival order. Does not implement SSDP; tests configure the
//! adapter with `control_url()` or `description_url()` directly.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One SOAP action as the renderer saw it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAction {
    pub action: String,
    /// CurrentURI for SetAVTransportURI, Target for Seek
    pub argument: Option<String>,
}

/// Transport as the renderer tracks it, plus everything it was sent
#[derive(Debug, Clone)]
pub struct MockUpnpState {
    pub name: String,
    pub state: String, // PLAYING, PAUSED_PLAYBACK, STOPPED, NO_MEDIA_PRESENT
    pub current_uri: Option<String>,
    pub actions: Vec<RecordedAction>,
    /// Held before answering each action, to widen interleaving windows
    pub action_delay: Duration,
}

impl Default for MockUpnpState {
    fn default() -> Self {
        Self {
            name: "Mock UPnP Renderer".to_string(),
            state: "NO_MEDIA_PRESENT".to_string(),
            current_uri: None,
            actions: Vec::new(),
            action_delay: Duration::ZERO,
        }
    }
}

pub struct MockUpnpRenderer {
    addr: SocketAddr,
    state: Arc<RwLock<MockUpnpState>>,
    handle: JoinHandle<()>,
}

impl MockUpnpRenderer {
    pub async fn start() -> Self {
        Self::start_with_state(MockUpnpState::default()).await
    }

    /// Bind on a loopback port chosen by the OS
    pub async fn start_with_state(initial_state: MockUpnpState) -> Self {
        let state = Arc::new(RwLock::new(initial_state));

        let app = Router::new()
            .route("/description.xml", get(handle_description))
            .route("/upnp/control/AVTransport1", post(handle_av_transport))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn description_url(&self) -> String {
        format!("http://{}/description.xml", self.addr)
    }

    pub fn control_url(&self) -> String {
        format!("http://{}/upnp/control/AVTransport1", self.addr)
    }

    /// Actions received so far, in order
    pub async fn actions(&self) -> Vec<RecordedAction> {
        self.state.read().await.actions.clone()
    }

    pub async fn action_names(&self) -> Vec<String> {
        self.actions().await.into_iter().map(|a| a.action).collect()
    }

    pub async fn transport_state(&self) -> String {
        self.state.read().await.state.clone()
    }

    pub async fn current_uri(&self) -> Option<String> {
        self.state.read().await.current_uri.clone()
    }

    pub async fn set_action_delay(&self, delay: Duration) {
        self.state.write().await.action_delay = delay;
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_description(State(state): State<Arc<RwLock<MockUpnpState>>>) -> impl IntoResponse {
    let name = state.read().await.name.clone();

    // Relative controlURL, joined against the description location by the adapter
    let xml = format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>{}</friendlyName>
    <UDN>uuid:mock-upnp-renderer</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <controlURL>/upnp/control/RenderingControl1</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/upnp/control/AVTransport1</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#,
        name
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(xml))
        .unwrap()
}

/// Text between `<tag>` and `</tag>`, still XML-escaped
fn element(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn envelope(inner: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>{}</s:Body>
</s:Envelope>"#,
        inner
    )
}

fn ok_response(action: &str) -> Response {
    let body = envelope(&format!(
        r#"<u:{}Response xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/>"#,
        action
    ));
    (StatusCode::OK, body).into_response()
}

fn fault(code: u32, description: &str) -> Response {
    let body = envelope(&format!(
        r#"<s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>{}</errorCode>
          <errorDescription>{}</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>"#,
        code, description
    ));
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

/// SOAP actions, answered the way a strict renderer would (701 for illegal transitions)
async fn handle_av_transport(
    State(state): State<Arc<RwLock<MockUpnpState>>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let action = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim_matches('"').rsplit('#').next())
        .unwrap_or("")
        .to_string();

    let argument = match action.as_str() {
        "SetAVTransportURI" => element(&body, "CurrentURI").map(|u| unescape(&u)),
        "Seek" => element(&body, "Target"),
        _ => None,
    };

    // Record on arrival, answer after the delay
    let delay = {
        let mut s = state.write().await;
        s.actions.push(RecordedAction {
            action: action.clone(),
            argument: argument.clone(),
        });
        s.action_delay
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut s = state.write().await;
    match action.as_str() {
        "SetAVTransportURI" => {
            s.current_uri = argument;
            s.state = "STOPPED".to_string();
            ok_response(&action)
        }
        "Play" => {
            if s.current_uri.is_none() {
                return fault(701, "Transition not available");
            }
            s.state = "PLAYING".to_string();
            ok_response(&action)
        }
        "Pause" => {
            if s.state != "PLAYING" {
                return fault(701, "Transition not available");
            }
            s.state = "PAUSED_PLAYBACK".to_string();
            ok_response(&action)
        }
        "Stop" => {
            if s.state == "STOPPED" || s.state == "NO_MEDIA_PRESENT" {
                return fault(701, "Transition not available");
            }
            s.state = "STOPPED".to_string();
            ok_response(&action)
        }
        "Seek" => ok_response(&action),
        "GetTransportInfo" => {
            let body = envelope(&format!(
                r#"<u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <CurrentTransportState>{}</CurrentTransportState>
      <CurrentTransportStatus>OK</CurrentTransportStatus>
      <CurrentSpeed>1</CurrentSpeed>
    </u:GetTransportInfoResponse>"#,
                s.state
            ));
            (StatusCode::OK, body).into_response()
        }
        "GetPositionInfo" => {
            let body = envelope(
                r#"<u:GetPositionInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <Track>1</Track>
      <TrackDuration>0:10:00</TrackDuration>
      <RelTime>0:00:42</RelTime>
    </u:GetPositionInfoResponse>"#,
            );
            (StatusCode::OK, body).into_response()
        }
        _ => fault(401, "Invalid Action"),
    }
}
