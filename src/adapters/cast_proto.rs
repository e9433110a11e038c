//! Cast v2 channel framing: protobuf `CastMessage` envelopes carrying JSON payloads,
//! each frame prefixed with its length as a 4-byte big-endian integer.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONNECTION_NS: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const HEARTBEAT_NS: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const RECEIVER_NS: &str = "urn:x-cast:com.google.cast.receiver";
pub const MEDIA_NS: &str = "urn:x-cast:com.google.cast.media";

pub const DEFAULT_SENDER: &str = "sender-0";
pub const DEFAULT_RECEIVER: &str = "receiver-0";

/// Frames above this size are treated as a corrupt stream
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv210 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    String = 0,
    Binary = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    /// String-payload message carrying `payload` as JSON
    pub fn json(source: &str, destination: &str, namespace: &str, payload: &Value) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: source.to_string(),
            destination_id: destination.to_string(),
            namespace: namespace.to_string(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some(payload.to_string()),
            payload_binary: None,
        }
    }

    /// Parsed JSON payload; `None` for binary or malformed payloads
    pub fn json_payload(&self) -> Option<Value> {
        if self.payload_type != PayloadType::String as i32 {
            return None;
        }
        serde_json::from_str(self.payload_utf8.as_deref()?).ok()
    }
}

/// Length-prefixed wire encoding of one message
pub fn encode_frame(message: &CastMessage) -> Vec<u8> {
    use prost::Message;

    let body = message.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

pub async fn write_frame<W>(writer: &mut W, message: &CastMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_frame(message)).await?;
    writer.flush().await
}

pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<CastMessage>
where
    R: AsyncRead + Unpin + ?Sized,
{
    use prost::Message;

    let mut size = [0u8; 4];
    reader.read_exact(&mut size).await?;
    let size = u32::from_be_bytes(size) as usize;
    if size > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", size, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    CastMessage::decode(body.as_slice())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
