//! Kodi (XBMC) adapter - JSON-RPC 2.0 over HTTP
//!
//! Every request carries a fresh id and replies are matched by id, never by position:
//! Kodi answers batch requests in whatever order it finishes them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapters::connection::ConnectionTracker;
use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{PlaybackState, SharedBus};
use crate::config::XbmcDescriptor;
use crate::error::DeviceError;

const VIDEO_PROPERTIES: [&str; 3] = ["speed", "time", "totaltime"];

pub struct XbmcDevice {
    id: String,
    name: String,
    endpoint: String,
    credentials: Option<(String, Option<String>)>,
    http: Client,
    next_id: AtomicU64,
    connection: ConnectionTracker,
}

impl XbmcDevice {
    pub fn new(id: String, descriptor: &XbmcDescriptor, bus: SharedBus) -> Self {
        let path = if descriptor.path.starts_with('/') {
            descriptor.path.clone()
        } else {
            format!("/{}", descriptor.path)
        };
        Self {
            name: descriptor
                .name
                .clone()
                .unwrap_or_else(|| format!("kodi @{}", descriptor.host)),
            endpoint: format!("http://{}:{}{}", descriptor.host, descriptor.port, path),
            credentials: descriptor
                .username
                .clone()
                .map(|user| (user, descriptor.password.clone())),
            http: Client::builder()
                .timeout(Duration::from_secs(descriptor.request_timeout.max(1)))
                .build()
                .unwrap_or_default(),
            next_id: AtomicU64::new(1),
            connection: ConnectionTracker::new(id.clone(), bus),
            id,
        }
    }

    fn request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post(&self, body: &Value) -> Result<Value, DeviceError> {
        let result = self.send_json(body).await;
        self.connection.observe(result.as_ref().map(|_| ()));
        result
    }

    async fn send_json(&self, body: &Value) -> Result<Value, DeviceError> {
        let mut request = self.http.post(&self.endpoint).json(body);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DeviceError::protocol("Kodi rejected the credentials"));
            }
            status if !status.is_success() => {
                return Err(DeviceError::protocol(format!("Kodi returned HTTP {}", status)));
            }
            _ => {}
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| DeviceError::protocol(format!("malformed JSON-RPC reply: {}", e)))
    }

    /// Single JSON-RPC call
    async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        let id = self.request_id();
        debug!("{}: {} #{}", self.id, method, id);
        let reply = self
            .post(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;
        take_result(&reply, id, method)
    }

    /// Several calls in one batch; results come back in request order.
    async fn batch(&self, calls: &[(&str, Value)]) -> Result<Vec<Value>, DeviceError> {
        let ids: Vec<u64> = calls.iter().map(|_| self.request_id()).collect();
        let body: Vec<Value> = calls
            .iter()
            .zip(&ids)
            .map(|((method, params), id)| {
                json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
            })
            .collect();

        let reply = self.post(&Value::Array(body)).await?;
        calls
            .iter()
            .zip(&ids)
            .map(|((method, _), id)| take_result(&reply, *id, method))
            .collect()
    }

    /// Active player ids, video players first
    async fn active_players(&self) -> Result<Vec<u64>, DeviceError> {
        let players = self.call("Player.GetActivePlayers", json!({})).await?;
        let players = players
            .as_array()
            .ok_or_else(|| DeviceError::protocol("GetActivePlayers did not return a list"))?;

        let mut ids: Vec<(bool, u64)> = players
            .iter()
            .filter_map(|p| {
                let id = p["playerid"].as_u64()?;
                Some((p["type"].as_str() != Some("video"), id))
            })
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

/// Pick the reply with `id` out of a single or batched response.
fn take_result(reply: &Value, id: u64, method: &str) -> Result<Value, DeviceError> {
    let entry = match reply {
        Value::Array(entries) => entries.iter().find(|e| e["id"].as_u64() == Some(id)),
        Value::Object(_) if reply["id"].as_u64() == Some(id) => Some(reply),
        _ => None,
    }
    .ok_or_else(|| DeviceError::protocol(format!("no reply to {} (id {})", method, id)))?;

    if let Some(error) = entry.get("error") {
        return Err(DeviceError::protocol(format!(
            "{} failed: {}",
            method,
            error["message"].as_str().unwrap_or("unknown error")
        )));
    }
    entry
        .get("result")
        .cloned()
        .ok_or_else(|| DeviceError::protocol(format!("{} reply has no result", method)))
}

/// Kodi's `{hours, minutes, seconds, milliseconds}` time object
fn time_to_secs(time: &Value) -> Option<f64> {
    let part = |key: &str| time[key].as_f64();
    Some(
        part("hours")? * 3600.0
            + part("minutes")? * 60.0
            + part("seconds")?
            + part("milliseconds").unwrap_or(0.0) / 1000.0,
    )
}

fn secs_to_time(secs: f64) -> Value {
    let total_ms = (secs.max(0.0) * 1000.0) as u64;
    json!({
        "hours": total_ms / 3_600_000,
        "minutes": (total_ms / 60_000) % 60,
        "seconds": (total_ms / 1000) % 60,
        "milliseconds": total_ms % 1000,
    })
}

#[async_trait]
impl Device for XbmcDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "xbmc"
    }

    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        let mut params = json!({"item": {"file": media.url}});
        if resume_secs >= 1.0 {
            params["options"] = json!({"resume": secs_to_time(resume_secs)});
        }
        self.call("Player.Open", params).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        for player in self.active_players().await? {
            self.call("Player.Stop", json!({"playerid": player})).await?;
        }
        Ok(())
    }

    async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let players = self.active_players().await?;
        if players.is_empty() {
            return Ok(DeviceStatus::with_state(PlaybackState::Idle));
        }

        let calls: Vec<(&str, Value)> = players
            .iter()
            .map(|p| {
                (
                    "Player.GetProperties",
                    json!({"playerid": p, "properties": VIDEO_PROPERTIES}),
                )
            })
            .collect();
        let results = self.batch(&calls).await?;
        let props = results
            .first()
            .ok_or_else(|| DeviceError::protocol("empty GetProperties batch"))?;

        let state = match props["speed"].as_f64() {
            Some(speed) if speed == 0.0 => PlaybackState::Paused,
            Some(_) => PlaybackState::Playing,
            None => PlaybackState::Unknown,
        };
        Ok(DeviceStatus {
            state,
            position_secs: time_to_secs(&props["time"]),
            duration_secs: time_to_secs(&props["totaltime"]),
            stale: false,
        })
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        for player in self.active_players().await? {
            self.call("Player.PlayPause", json!({"playerid": player, "play": false}))
                .await?;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        for player in self.active_players().await? {
            self.call("Player.PlayPause", json!({"playerid": player, "play": true}))
                .await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.connection.disconnected();
    }
}
