//! Client frame encodings.
//!
//! Two flavors exist and a listener uses exactly one of them:
//! - [`HexProtobufCodec`]: a frame is the hex encoding of a protobuf [`Message`]
//! - [`LegacyJsonCodec`]: a frame is `{"request_id","method","resource","protobuf"}`
//!   where `protobuf` is the hex-encoded body

use crate::error::{GatewayError, Result};
use crate::protocol::{Message, Route, RoutingStack};
use bytes::Bytes;
use prost::Message as _;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Converts between client text frames and [`Message`]s.
pub trait FrameCodec: Send + Sync {
    /// Decode an inbound frame.
    fn decode(&self, frame: &str) -> Result<Message>;

    /// Encode an outbound frame.
    fn encode(&self, msg: &Message) -> Result<String>;
}

/// Decode hex-encoded protobuf.
pub fn decode_hex_message(hex_payload: &str) -> Result<Message> {
    let bytes = hex::decode(hex_payload.trim())?;
    Ok(Message::decode(bytes.as_slice())?)
}

/// Encode a message as hex-encoded protobuf.
pub fn encode_hex_message(msg: &Message) -> String {
    hex::encode(msg.encode_to_vec())
}

/// Primary flavor: hex-encoded protobuf in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexProtobufCodec;

impl FrameCodec for HexProtobufCodec {
    fn decode(&self, frame: &str) -> Result<Message> {
        decode_hex_message(frame)
    }

    fn encode(&self, msg: &Message) -> Result<String> {
        Ok(encode_hex_message(msg))
    }
}

/// Legacy JSON frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyFrame {
    request_id: String,
    method: i32,
    resource: i32,
    /// Hex-encoded body.
    protobuf: String,
}

/// Legacy flavor.
///
/// Legacy requests carry no routing, so every decoded request is addressed to a fixed
/// destination.
#[derive(Debug, Clone)]
pub struct LegacyJsonCodec {
    destination: Route,
}

impl LegacyJsonCodec {
    pub fn new(destination: Route) -> Self {
        Self { destination }
    }
}

impl FrameCodec for LegacyJsonCodec {
    fn decode(&self, frame: &str) -> Result<Message> {
        let legacy: LegacyFrame = serde_json::from_str(frame)?;
        Ok(Message {
            correlation_id: legacy.request_id,
            method: legacy.method,
            resource: legacy.resource,
            body: Bytes::from(hex::decode(legacy.protobuf.trim())?),
            routing: Some(RoutingStack {
                route_to: vec![self.destination.clone()],
                route_from: Vec::new(),
            }),
            completed: false,
        })
    }

    fn encode(&self, msg: &Message) -> Result<String> {
        let legacy = LegacyFrame {
            request_id: msg.correlation_id.clone(),
            method: msg.method,
            resource: msg.resource,
            protobuf: hex::encode(&msg.body),
        };
        Ok(serde_json::to_string(&legacy)?)
    }
}

/// Frame flavor selected for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    HexProtobuf,
    LegacyJson,
}

impl WireFormat {
    /// Build the codec for this flavor.
    pub fn codec(self, legacy_destination: &Route) -> Arc<dyn FrameCodec> {
        match self {
            WireFormat::HexProtobuf => Arc::new(HexProtobufCodec),
            WireFormat::LegacyJson => Arc::new(LegacyJsonCodec::new(legacy_destination.clone())),
        }
    }
}

impl FromStr for WireFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "hex_protobuf" | "hex" => Ok(WireFormat::HexProtobuf),
            "legacy_json" | "json" => Ok(WireFormat::LegacyJson),
            other => Err(GatewayError::Config(format!("unknown wire format: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Method, Resource};

    fn sample() -> Message {
        Message {
            correlation_id: "req-1".to_string(),
            method: Method::Get as i32,
            resource: Resource::Health as i32,
            body: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            routing: Some(RoutingStack {
                route_to: vec![Route::new("microservice://users")],
                route_from: Vec::new(),
            }),
            completed: true,
        }
    }

    #[test]
    fn test_hex_protobuf_frame() {
        let codec = HexProtobufCodec;
        let frame = codec.encode(&sample()).unwrap();

        assert!(frame.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(codec.decode(&frame).unwrap(), sample());
    }

    #[test]
    fn test_hex_protobuf_rejects_bad_frames() {
        let codec = HexProtobufCodec;
        assert!(matches!(codec.decode("not hex"), Err(GatewayError::Hex(_))));
        // Valid hex, truncated protobuf (field 1, length 16, no data).
        assert!(matches!(codec.decode("0a10"), Err(GatewayError::Protobuf(_))));
    }

    #[test]
    fn test_legacy_decode_injects_destination() {
        let codec = LegacyJsonCodec::new(Route::new("microservice://legacy"));
        let msg = codec
            .decode(r#"{"request_id":"abc","method":1,"resource":2,"protobuf":"0102ff"}"#)
            .unwrap();

        assert_eq!(msg.correlation_id, "abc");
        assert_eq!(msg.method(), Method::Get);
        assert_eq!(msg.body.as_ref(), &[0x01, 0x02, 0xff]);
        assert_eq!(msg.destination().unwrap().uri, "microservice://legacy");
    }

    #[test]
    fn test_legacy_encode() {
        let codec = LegacyJsonCodec::new(Route::new("microservice://legacy"));
        let json: serde_json::Value =
            serde_json::from_str(&codec.encode(&sample()).unwrap()).unwrap();

        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["method"], 1);
        assert_eq!(json["resource"], 2);
        assert_eq!(json["protobuf"], "deadbeef");
    }

    #[test]
    fn test_wire_format_parse() {
        assert_eq!("".parse::<WireFormat>().unwrap(), WireFormat::HexProtobuf);
        assert_eq!("LEGACY_JSON".parse::<WireFormat>().unwrap(), WireFormat::LegacyJson);
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
