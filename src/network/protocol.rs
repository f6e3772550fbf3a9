//! Subscriber wire protocol.
//!
//! Records are JSON objects with a mandatory `type` discriminator, framed by
//! a big-endian u32 length prefix. The connection is full duplex: the server
//! pushes tagged records, subscribers send identification and control
//! records.
//!
//! Close semantics use websocket-style codes (1000 normal, 1002 protocol,
//! 1006 abnormal) carried in a final `goodbye` record before the socket
//! shuts down.

use crate::device::{DeviceInfo, LedColor};
use crate::frame::{GestureEvent, MovementEvent, ProcessedFrame, SyncBundle};
use crate::sensor::SensorStatus;
use crate::stream::StreamKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL: u16 = 1002;
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Records sent from the service to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Identify { client_id: u32 },
    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: String,
        server_version: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Frame {
        sensor_type: StreamKind,
        data: ProcessedFrame,
    },
    FrameSync { frame: SyncBundle },
    Movement { data: MovementEvent },
    Gesture { data: GestureEvent },
    Stats { stats: serde_json::Value },
    Status { status: serde_json::Value },
    DeviceInfo { info: DeviceInfo },
    SensorStatus { status: SensorStatus },
    Error { error: String },
    Goodbye { code: u16, reason: String },
}

/// Records sent from subscribers to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Identify {
        name: String,
        version: String,
        platform: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    StartSensor { sensor_type: StreamKind },
    #[serde(rename_all = "camelCase")]
    StopSensor { sensor_type: StreamKind },
    #[serde(rename = "setLED")]
    SetLed { color: LedColor },
    #[serde(rename = "setIREmitter")]
    SetIrEmitter { enabled: bool },
}

/// Serialize a server record into a length-prefixed frame.
pub fn encode_server(message: &ServerMessage) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    Ok(frame_bytes(&body))
}

/// Serialize a client record into a length-prefixed frame.
pub fn encode_client(message: &ClientMessage) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    Ok(frame_bytes(&body))
}

fn frame_bytes(body: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(body);
    Bytes::from(framed)
}

/// Parse a client record from an unframed payload.
pub fn decode_client(payload: &[u8]) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Write one already-framed record.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Bytes,
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one record payload, enforcing the frame size bound.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_len} byte limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_roundtrip() {
        let message = ClientMessage::Identify {
            name: "viewer".to_string(),
            version: "1.2.0".to_string(),
            platform: "linux".to_string(),
            capabilities: vec!["depth".to_string()],
        };
        let framed = encode_client(&message).unwrap();
        let decoded = decode_client(&framed[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_type_discriminators() {
        let json = serde_json::to_value(&ClientMessage::StartSensor {
            sensor_type: StreamKind::Depth,
        })
        .unwrap();
        assert_eq!(json["type"], "startSensor");
        assert_eq!(json["sensorType"], "depth");

        let json = serde_json::to_value(&ClientMessage::SetLed {
            color: LedColor::BlinkGreen,
        })
        .unwrap();
        assert_eq!(json["type"], "setLED");
        assert_eq!(json["color"], "blink_green");

        let json = serde_json::to_value(&ClientMessage::SetIrEmitter { enabled: false }).unwrap();
        assert_eq!(json["type"], "setIREmitter");

        let json = serde_json::to_value(&ServerMessage::Identify { client_id: 9 }).unwrap();
        assert_eq!(json["type"], "identify");
        assert_eq!(json["clientId"], 9);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(decode_client(br#"{"type":"selfDestruct"}"#).is_err());
        assert!(decode_client(b"not json at all").is_err());
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = ClientMessage::StopSensor {
            sensor_type: StreamKind::Body,
        };
        let framed = encode_client(&message).unwrap();
        write_frame(&mut client, &framed).await.unwrap();

        let payload = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(decode_client(&payload).unwrap(), message);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let framed = frame_bytes(&[0u8; 128]);
        write_frame(&mut client, &framed).await.unwrap();
        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
