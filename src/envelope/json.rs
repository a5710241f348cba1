//! Human-readable envelope form.
//!
//! Encoding always produces the canonical shape: numeric enums and the payload
//! as an array of byte values. Decoding also accepts what dynamically-typed
//! callers tend to send (integer message ids, string payloads, enum names,
//! camelCase keys) and normalizes it at this boundary.

use super::{
    Acknowledgment, EnvelopeParts, MessageEnvelope, MessageType, QosLevel, RoutingMode,
};
use crate::error::MessagingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize)]
struct JsonEnvelopeOut<'a> {
    message_id: &'a str,
    target: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    #[serde(rename = "type")]
    message_type: i32,
    payload: &'a [u8],
    #[serde(rename = "async")]
    is_async: bool,
    timestamp: i64,
    routing: i32,
    qos: i32,
    metadata: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<&'a Acknowledgment>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonEnvelopeIn {
    #[serde(alias = "messageId")]
    message_id: Option<MessageIdRepr>,
    target: u32,
    topic: Option<String>,
    #[serde(rename = "type")]
    message_type: Option<EnumRepr>,
    payload: Option<PayloadRepr>,
    #[serde(rename = "async", alias = "is_async")]
    is_async: bool,
    timestamp: i64,
    routing: Option<EnumRepr>,
    qos: Option<EnumRepr>,
    metadata: Option<BTreeMap<String, ScalarRepr>>,
    ack: Option<Acknowledgment>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MessageIdRepr {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PayloadRepr {
    Bytes(Vec<u8>),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Number(i32),
    Name(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarRepr {
    Text(String),
    Bool(bool),
    Number(serde_json::Number),
}

impl MessageIdRepr {
    fn normalize(self) -> String {
        match self {
            MessageIdRepr::Text(id) => id,
            MessageIdRepr::Signed(id) => id.to_string(),
            MessageIdRepr::Unsigned(id) => id.to_string(),
        }
    }
}

impl PayloadRepr {
    fn normalize(self) -> Vec<u8> {
        match self {
            PayloadRepr::Bytes(bytes) => bytes,
            PayloadRepr::Text(text) => text.into_bytes(),
        }
    }
}

impl EnumRepr {
    /// Unknown numbers and names fall back to the enum's default variant.
    fn resolve<T: Default>(
        self,
        from_i32: impl Fn(i32) -> T,
        from_name: impl Fn(&str) -> Option<T>,
    ) -> T {
        match self {
            EnumRepr::Number(value) => from_i32(value),
            EnumRepr::Name(name) => from_name(&name).unwrap_or_default(),
        }
    }
}

impl ScalarRepr {
    fn normalize(self) -> String {
        match self {
            ScalarRepr::Text(text) => text,
            ScalarRepr::Bool(flag) => flag.to_string(),
            ScalarRepr::Number(number) => number.to_string(),
        }
    }
}

pub fn encode_debug_json(envelope: &MessageEnvelope) -> Result<String, MessagingError> {
    let wire = JsonEnvelopeOut {
        message_id: envelope.message_id(),
        target: envelope.target,
        topic: envelope.topic.as_deref(),
        message_type: envelope.message_type().as_i32(),
        payload: &envelope.payload,
        is_async: envelope.is_async,
        timestamp: envelope.timestamp,
        routing: envelope.routing.as_i32(),
        qos: envelope.qos.as_i32(),
        metadata: &envelope.metadata,
        ack: envelope.ack(),
    };
    serde_json::to_string(&wire)
        .map_err(|e| MessagingError::InvalidEnvelope(format!("JSON encoding failed: {}", e)))
}

pub fn decode_debug_json(text: &str) -> Result<MessageEnvelope, MessagingError> {
    let wire: JsonEnvelopeIn =
        serde_json::from_str(text).map_err(|e| MessagingError::malformed(e.to_string()))?;

    let parts = EnvelopeParts {
        message_id: wire.message_id.map(MessageIdRepr::normalize),
        target: wire.target,
        topic: wire.topic,
        message_type: wire
            .message_type
            .map(|t| t.resolve(MessageType::from_i32, MessageType::from_str_name))
            .unwrap_or_default(),
        payload: wire.payload.map(PayloadRepr::normalize).unwrap_or_default(),
        is_async: wire.is_async,
        timestamp: wire.timestamp,
        routing: wire
            .routing
            .map(|r| r.resolve(RoutingMode::from_i32, RoutingMode::from_str_name))
            .unwrap_or_default(),
        qos: wire
            .qos
            .map(|q| q.resolve(QosLevel::from_i32, QosLevel::from_str_name))
            .unwrap_or_default(),
        metadata: wire
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.normalize()))
            .collect(),
        ack: wire.ack,
    };

    parts.into_envelope()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{build_ack, is_valid_ack, ACK_STATUS_OK};

    #[test]
    fn test_round_trip_request() {
        let envelope = MessageEnvelope::builder(12)
            .message_id("abc")
            .topic("bench")
            .payload(vec![0, 127, 255])
            .is_async(true)
            .metadata_entry("reply_to", "inbox.1")
            .build()
            .unwrap();

        let text = encode_debug_json(&envelope).unwrap();
        assert_eq!(decode_debug_json(&text).unwrap(), envelope);
    }

    #[test]
    fn test_round_trip_ack() {
        let original = MessageEnvelope::builder(1).build().unwrap();
        let ack = build_ack(&original, "1", ACK_STATUS_OK, 3.75);

        let text = encode_debug_json(&ack).unwrap();
        let decoded = decode_debug_json(&text).unwrap();
        assert_eq!(decoded, ack);
        assert!(is_valid_ack(&decoded, original.message_id()));
    }

    #[test]
    fn test_payload_encoded_as_integer_array() {
        let envelope = MessageEnvelope::builder(0)
            .message_id("x")
            .payload(vec![104, 105])
            .build()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&encode_debug_json(&envelope).unwrap()).unwrap();
        assert_eq!(value["payload"], serde_json::json!([104, 105]));
        assert_eq!(value["type"], 1);
        assert_eq!(value["async"], false);
    }

    #[test]
    fn test_accepts_string_payload_and_integer_id() {
        let text = r#"{"message_id": 17, "target": 3, "payload": "hi", "type": 1}"#;
        let envelope = decode_debug_json(text).unwrap();

        assert_eq!(envelope.message_id(), "17");
        assert_eq!(envelope.target, 3);
        assert_eq!(envelope.payload, b"hi".to_vec());
    }

    #[test]
    fn test_accepts_enum_names_and_camel_case() {
        let text = r#"{
            "messageId": "m-1",
            "type": "ACK",
            "routing": "REQUEST_REPLY",
            "qos": "AT_LEAST_ONCE",
            "metadata": {"attempt": 2, "warm": true},
            "ack": {"originalMessageId": "m-0", "received": true, "receiverId": "4", "status": "OK"}
        }"#;
        let envelope = decode_debug_json(text).unwrap();

        assert_eq!(envelope.message_type(), MessageType::Ack);
        assert_eq!(envelope.routing, RoutingMode::RequestReply);
        assert_eq!(envelope.qos, QosLevel::AtLeastOnce);
        assert_eq!(envelope.metadata["attempt"], "2");
        assert_eq!(envelope.metadata["warm"], "true");
        assert!(is_valid_ack(&envelope, "m-0"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let text = r#"{"message_id": "m", "added_later": {"nested": [1, 2]}}"#;
        assert_eq!(decode_debug_json(text).unwrap().message_id(), "m");
    }

    #[test]
    fn test_missing_message_id_is_malformed() {
        let result = decode_debug_json(r#"{"target": 1}"#);
        assert!(matches!(result, Err(MessagingError::MalformedEnvelope(_))));

        let result = decode_debug_json("{not json");
        assert!(matches!(result, Err(MessagingError::MalformedEnvelope(_))));
    }
}
