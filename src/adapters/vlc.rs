//! VLC adapter - line-oriented telnet control interface
//!
//! VLC's telnet interface asks for a password (announced with `IAC WILL ECHO`),
//! then answers every command with its output followed by a `> ` prompt. The
//! connection is kept warm between commands; a reused connection that turns out to
//! be stale is replaced once before the command fails.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::adapters::connection::ConnectionTracker;
use crate::adapters::traits::{Device, DeviceStatus, PlayMedia};
use crate::bus::{redact_stream_tokens, PlaybackState, SharedBus};
use crate::config::VlcDescriptor;
use crate::error::DeviceError;

/// `IAC WILL ECHO`: VLC hides the password prompt's echo
const AUTH_MAGIC: &[u8] = b"\xff\xfb\x01";
const PROMPT: &[u8] = b"> ";
const TELNET_IAC: u8 = 0xff;
/// Upper bound on a single reply; VLC's longest (`help`) is far below this
const MAX_REPLY_LEN: usize = 64 * 1024;

/// `is_playing` polls before giving up on deferred seek
const PLAY_POLLS: u32 = 20;
const PLAY_POLL_DELAY: Duration = Duration::from_millis(250);

static STATE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\(\s*state\s+(\w+)\s*\)").ok());

struct VlcConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl VlcConnection {
    /// Read until the prompt (or the password prompt), returning the text before it.
    async fn read_reply(&mut self) -> Result<Reply, DeviceError> {
        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(DeviceError::unreachable("VLC closed the connection"));
            }
            buf.extend_from_slice(&chunk[..n]);

            if buf.ends_with(AUTH_MAGIC) {
                return Ok(Reply::PasswordPrompt(strip_telnet(&buf)));
            }
            if buf.ends_with(PROMPT) {
                buf.truncate(buf.len() - PROMPT.len());
                return Ok(Reply::Output(strip_telnet(&buf)));
            }
            if buf.len() > MAX_REPLY_LEN {
                return Err(DeviceError::protocol("VLC reply without prompt"));
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn exchange(&mut self, line: &str) -> Result<String, DeviceError> {
        self.write_line(line).await?;
        match self.read_reply().await? {
            Reply::Output(text) => Ok(text),
            Reply::PasswordPrompt(_) => Err(DeviceError::protocol("VLC asked for a password mid-session")),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Reply {
    Output(String),
    PasswordPrompt(String),
}

/// Drop telnet negotiation (`IAC <cmd> <opt>`) and decode the rest as text.
fn strip_telnet(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == TELNET_IAC {
            i += 3;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

/// VLC reports failures inline rather than through a status code.
fn check_reply(command: &str, reply: &str) -> Result<(), DeviceError> {
    let lower = reply.to_lowercase();
    if lower.contains("unknown command") || lower.contains("returned -") || lower.starts_with("error") {
        return Err(DeviceError::protocol(format!("`{}` failed: {}", command, reply)));
    }
    Ok(())
}

fn parse_state(reply: &str) -> Option<PlaybackState> {
    let re = STATE_LINE.as_ref()?;
    re.captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| PlaybackState::from(m.as_str()))
}

/// Last non-empty line as whole seconds; VLC prints nothing when no input is loaded
fn parse_seconds(reply: &str) -> Option<f64> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .next_back()
        .and_then(|l| l.parse::<u64>().ok())
        .map(|s| s as f64)
}

pub struct VlcDevice {
    id: String,
    name: String,
    address: String,
    password: Option<String>,
    request_timeout: Duration,
    connection: Mutex<Option<VlcConnection>>,
    tracker: ConnectionTracker,
}

impl VlcDevice {
    pub fn new(id: String, descriptor: &VlcDescriptor, bus: SharedBus) -> Self {
        Self {
            name: descriptor
                .name
                .clone()
                .unwrap_or_else(|| format!("vlc @{}", descriptor.host)),
            address: format!("{}:{}", descriptor.host, descriptor.port),
            password: descriptor.password.clone(),
            request_timeout: Duration::from_secs(descriptor.request_timeout.max(1)),
            connection: Mutex::new(None),
            tracker: ConnectionTracker::new(id.clone(), bus),
            id,
        }
    }

    async fn open(&self) -> Result<VlcConnection, DeviceError> {
        self.tracker.begin_connect();
        match timeout(self.request_timeout, self.handshake()).await {
            Ok(Ok(conn)) => {
                self.tracker.connected();
                info!("{}: connected to VLC at {}", self.id, self.address);
                Ok(conn)
            }
            Ok(Err(e)) => {
                self.tracker.failed(e.to_string());
                Err(e)
            }
            Err(_) => {
                let e = DeviceError::timed_out(self.request_timeout);
                self.tracker.failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<VlcConnection, DeviceError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut conn = VlcConnection { reader, writer };

        if let Reply::PasswordPrompt(_) = conn.read_reply().await? {
            let password = self
                .password
                .as_deref()
                .ok_or_else(|| DeviceError::protocol("VLC requires a password"))?;
            conn.write_line(password).await?;
            match conn.read_reply().await? {
                Reply::Output(welcome) if welcome.contains("Welcome") => {}
                _ => return Err(DeviceError::protocol("VLC rejected the password")),
            }
        }
        Ok(conn)
    }

    /// Run one command on the warm connection, reconnecting once if it went stale.
    async fn command(&self, line: &str) -> Result<String, DeviceError> {
        debug!("{}: vlc <- {}", self.id, redact_stream_tokens(line));
        let mut conn_guard = self.connection.lock().await;

        let reused = conn_guard.is_some();
        let conn = match conn_guard.take() {
            Some(conn) => conn,
            None => self.open().await?,
        };
        let conn = conn_guard.insert(conn);

        let outcome = match timeout(self.request_timeout, conn.exchange(line)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeviceError::timed_out(self.request_timeout)),
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) if e.is_retryable() && reused => {
                debug!("{}: stale VLC connection ({}), reconnecting", self.id, e);
                *conn_guard = None;
                self.tracker.failed(e.to_string());

                let conn = conn_guard.insert(self.open().await?);
                match timeout(self.request_timeout, conn.exchange(line)).await {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => return Err(self.drop_if_broken(&mut conn_guard, e)),
                    Err(_) => {
                        let e = DeviceError::timed_out(self.request_timeout);
                        return Err(self.drop_if_broken(&mut conn_guard, e));
                    }
                }
            }
            Err(e) => return Err(self.drop_if_broken(&mut conn_guard, e)),
        };

        debug!("{}: vlc -> {:?}", self.id, redact_stream_tokens(&reply));
        check_reply(line, &reply)?;
        Ok(reply)
    }

    fn drop_if_broken(&self, conn: &mut Option<VlcConnection>, e: DeviceError) -> DeviceError {
        if e.is_retryable() {
            *conn = None;
            self.tracker.failed(e.to_string());
        }
        e
    }

    async fn is_playing(&self) -> Result<bool, DeviceError> {
        let reply = self.command("is_playing").await?;
        match reply.lines().next_back().map(str::trim) {
            Some("1") => Ok(true),
            Some("0") => Ok(false),
            _ => Err(DeviceError::protocol(format!("unexpected is_playing reply {:?}", reply))),
        }
    }
}

#[async_trait]
impl Device for VlcDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "vlc"
    }

    async fn play(&self, media: &PlayMedia, resume_secs: f64) -> Result<(), DeviceError> {
        self.command(&format!("add {}", media.url)).await?;
        self.command("play").await?;

        if resume_secs < 1.0 {
            return Ok(());
        }

        // VLC ignores seek until the input is actually playing
        for _ in 0..PLAY_POLLS {
            if self.is_playing().await? {
                self.command(&format!("seek {}", resume_secs as u64)).await?;
                return Ok(());
            }
            tokio::time::sleep(PLAY_POLL_DELAY).await;
        }
        Err(DeviceError::protocol("playback did not start, resume position not applied"))
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.command("stop").await.map(|_| ())
    }

    async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let reply = self.command("status").await?;
        let state = parse_state(&reply).unwrap_or(PlaybackState::Idle);

        let mut status = DeviceStatus::with_state(state);
        if state != PlaybackState::Idle {
            status.position_secs = parse_seconds(&self.command("get_time").await?);
            status.duration_secs = parse_seconds(&self.command("get_length").await?);
        }
        Ok(status)
    }

    async fn pause(&self) -> Result<(), DeviceError> {
        if self.is_playing().await? {
            self.command("pause").await?;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.command("play").await.map(|_| ())
    }

    async fn shutdown(&self) {
        *self.connection.lock().await = None;
        self.tracker.disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_telnet_negotiation() {
        assert_eq!(strip_telnet(b"\xff\xfc\x01\r\nWelcome, Master\r\n"), "Welcome, Master");
        assert_eq!(strip_telnet(b"Password: \xff\xfb\x01"), "Password:");
    }

    #[test]
    fn inline_failures_are_protocol_errors() {
        assert!(check_reply("add x", "").is_ok());
        assert!(check_reply("add x", "add: returned 0 (no error)").is_ok());
        assert!(matches!(
            check_reply("frobnicate", "Unknown command `frobnicate'. Type `help' for help."),
            Err(DeviceError::Protocol(_))
        ));
        assert!(check_reply("seek 9", "seek: returned -1 (generic error)").is_err());
    }

    #[test]
    fn parses_status_and_times() {
        let status = "( new input: http://h/stream/t )\r\n( audio volume: 256 )\r\n( state paused )";
        assert_eq!(parse_state(status), Some(PlaybackState::Paused));
        assert_eq!(parse_state("( audio volume: 256 )"), None);
        assert_eq!(parse_seconds("42\r\n"), Some(42.0));
        assert_eq!(parse_seconds(""), None);
    }
}
