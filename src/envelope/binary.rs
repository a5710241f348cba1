//! Compact binary form of the envelope.
//!
//! The layout is protobuf wire format: every field is a varint key
//! `(field_number << 3) | wire_type` followed by a varint, a little-endian
//! fixed64 or a length-delimited byte run. Default-valued fields are omitted,
//! metadata entries are written in key order, and unknown fields are skipped
//! so that decoders keep working against peers that add fields.

use super::{
    Acknowledgment, DataMessage, EnvelopeParts, MessageEnvelope, MessageType, QosLevel,
    RoutingMode,
};
use crate::error::MessagingError;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_FIXED32: u8 = 5;

mod envelope_field {
    pub const MESSAGE_ID: u32 = 1;
    pub const TARGET: u32 = 2;
    pub const TOPIC: u32 = 3;
    pub const TYPE: u32 = 4;
    pub const PAYLOAD: u32 = 5;
    pub const ASYNC: u32 = 6;
    pub const TIMESTAMP: u32 = 7;
    pub const ROUTING: u32 = 8;
    pub const QOS: u32 = 9;
    pub const METADATA: u32 = 10;
    pub const ACK: u32 = 11;
}

mod ack_field {
    pub const ORIGINAL_MESSAGE_ID: u32 = 1;
    pub const RECEIVED: u32 = 2;
    pub const LATENCY_MS: u32 = 3;
    pub const RECEIVER_ID: u32 = 4;
    pub const STATUS: u32 = 5;
}

mod map_entry_field {
    pub const KEY: u32 = 1;
    pub const VALUE: u32 = 2;
}

mod data_field {
    pub const MESSAGE_NAME: u32 = 1;
    pub const MESSAGE_VALUE: u32 = 2;
}

/// Encode an envelope. Output is deterministic for equal envelopes.
pub fn encode_binary(envelope: &MessageEnvelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + envelope.payload.len());

    put_string_field(&mut buf, envelope_field::MESSAGE_ID, envelope.message_id());
    if envelope.target != 0 {
        put_varint_field(&mut buf, envelope_field::TARGET, envelope.target as u64);
    }
    if let Some(topic) = envelope.topic.as_deref().filter(|t| !t.is_empty()) {
        put_string_field(&mut buf, envelope_field::TOPIC, topic);
    }
    put_enum_field(&mut buf, envelope_field::TYPE, envelope.message_type().as_i32());
    if !envelope.payload.is_empty() {
        put_bytes_field(&mut buf, envelope_field::PAYLOAD, &envelope.payload);
    }
    if envelope.is_async {
        put_varint_field(&mut buf, envelope_field::ASYNC, 1);
    }
    if envelope.timestamp != 0 {
        put_varint_field(&mut buf, envelope_field::TIMESTAMP, envelope.timestamp as u64);
    }
    put_enum_field(&mut buf, envelope_field::ROUTING, envelope.routing.as_i32());
    put_enum_field(&mut buf, envelope_field::QOS, envelope.qos.as_i32());

    for (key, value) in &envelope.metadata {
        let mut entry = Vec::with_capacity(key.len() + value.len() + 4);
        put_string_field(&mut entry, map_entry_field::KEY, key);
        put_string_field(&mut entry, map_entry_field::VALUE, value);
        put_bytes_field(&mut buf, envelope_field::METADATA, &entry);
    }

    if let Some(ack) = envelope.ack() {
        put_bytes_field(&mut buf, envelope_field::ACK, &encode_ack(ack));
    }

    buf
}

/// Decode an envelope, failing with [`MessagingError::MalformedEnvelope`]
/// on truncation, corruption or a missing `message_id`.
pub fn decode_binary(bytes: &[u8]) -> Result<MessageEnvelope, MessagingError> {
    let mut reader = WireReader::new(bytes);
    let mut parts = EnvelopeParts::default();

    while !reader.is_empty() {
        let (field, wire) = reader.key()?;
        match (field, wire) {
            (envelope_field::MESSAGE_ID, WIRE_LENGTH_DELIMITED) => {
                parts.message_id = Some(reader.string()?)
            }
            (envelope_field::TARGET, WIRE_VARINT) => {
                let target = reader.varint()?;
                parts.target = u32::try_from(target).map_err(|_| {
                    MessagingError::malformed(format!("target {} out of range", target))
                })?;
            }
            (envelope_field::TOPIC, WIRE_LENGTH_DELIMITED) => parts.topic = Some(reader.string()?),
            (envelope_field::TYPE, WIRE_VARINT) => {
                parts.message_type = MessageType::from_i32(reader.varint()? as i32)
            }
            (envelope_field::PAYLOAD, WIRE_LENGTH_DELIMITED) => {
                parts.payload = reader.length_delimited()?.to_vec()
            }
            (envelope_field::ASYNC, WIRE_VARINT) => parts.is_async = reader.varint()? != 0,
            (envelope_field::TIMESTAMP, WIRE_VARINT) => parts.timestamp = reader.varint()? as i64,
            (envelope_field::ROUTING, WIRE_VARINT) => {
                parts.routing = RoutingMode::from_i32(reader.varint()? as i32)
            }
            (envelope_field::QOS, WIRE_VARINT) => {
                parts.qos = QosLevel::from_i32(reader.varint()? as i32)
            }
            (envelope_field::METADATA, WIRE_LENGTH_DELIMITED) => {
                let (key, value) = decode_map_entry(reader.length_delimited()?)?;
                parts.metadata.insert(key, value);
            }
            (envelope_field::ACK, WIRE_LENGTH_DELIMITED) => {
                parts.ack = Some(decode_ack(reader.length_delimited()?)?)
            }
            (envelope_field::MESSAGE_ID..=envelope_field::ACK, _) => {
                return Err(MessagingError::malformed(format!(
                    "field {} has unexpected wire type {}",
                    field, wire
                )))
            }
            _ => reader.skip(wire)?,
        }
    }

    parts.into_envelope()
}

fn encode_ack(ack: &Acknowledgment) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + ack.original_message_id.len());
    if !ack.original_message_id.is_empty() {
        put_string_field(&mut buf, ack_field::ORIGINAL_MESSAGE_ID, &ack.original_message_id);
    }
    if ack.received {
        put_varint_field(&mut buf, ack_field::RECEIVED, 1);
    }
    if ack.latency_ms != 0.0 {
        put_key(&mut buf, ack_field::LATENCY_MS, WIRE_FIXED64);
        buf.put_f64_le(ack.latency_ms);
    }
    if !ack.receiver_id.is_empty() {
        put_string_field(&mut buf, ack_field::RECEIVER_ID, &ack.receiver_id);
    }
    if !ack.status.is_empty() {
        put_string_field(&mut buf, ack_field::STATUS, &ack.status);
    }
    buf
}

fn decode_ack(bytes: &[u8]) -> Result<Acknowledgment, MessagingError> {
    let mut reader = WireReader::new(bytes);
    let mut ack = Acknowledgment::default();

    while !reader.is_empty() {
        match reader.key()? {
            (ack_field::ORIGINAL_MESSAGE_ID, WIRE_LENGTH_DELIMITED) => {
                ack.original_message_id = reader.string()?
            }
            (ack_field::RECEIVED, WIRE_VARINT) => ack.received = reader.varint()? != 0,
            (ack_field::LATENCY_MS, WIRE_FIXED64) => {
                ack.latency_ms = f64::from_bits(reader.fixed64()?)
            }
            (ack_field::RECEIVER_ID, WIRE_LENGTH_DELIMITED) => ack.receiver_id = reader.string()?,
            (ack_field::STATUS, WIRE_LENGTH_DELIMITED) => ack.status = reader.string()?,
            (_, wire) => reader.skip(wire)?,
        }
    }

    Ok(ack)
}

fn decode_map_entry(bytes: &[u8]) -> Result<(String, String), MessagingError> {
    let mut reader = WireReader::new(bytes);
    let mut key = String::new();
    let mut value = String::new();

    while !reader.is_empty() {
        match reader.key()? {
            (map_entry_field::KEY, WIRE_LENGTH_DELIMITED) => key = reader.string()?,
            (map_entry_field::VALUE, WIRE_LENGTH_DELIMITED) => value = reader.string()?,
            (_, wire) => reader.skip(wire)?,
        }
    }

    Ok((key, value))
}

pub(crate) fn encode_data_message(message: &DataMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        message.message_name.len() + message.message_value.iter().map(|v| v.len() + 2).sum::<usize>() + 4,
    );
    if !message.message_name.is_empty() {
        put_string_field(&mut buf, data_field::MESSAGE_NAME, &message.message_name);
    }
    for value in &message.message_value {
        put_string_field(&mut buf, data_field::MESSAGE_VALUE, value);
    }
    buf
}

pub(crate) fn decode_data_message(bytes: &[u8]) -> Result<DataMessage, MessagingError> {
    let mut reader = WireReader::new(bytes);
    let mut message = DataMessage::default();

    while !reader.is_empty() {
        match reader.key()? {
            (data_field::MESSAGE_NAME, WIRE_LENGTH_DELIMITED) => {
                message.message_name = reader.string()?
            }
            (data_field::MESSAGE_VALUE, WIRE_LENGTH_DELIMITED) => {
                message.message_value.push(reader.string()?)
            }
            (_, wire) => reader.skip(wire)?,
        }
    }

    Ok(message)
}

fn put_key(buf: &mut Vec<u8>, field: u32, wire: u8) {
    buf.put_u64_varint(((field as u64) << 3) | wire as u64);
}

fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_key(buf, field, WIRE_VARINT);
    buf.put_u64_varint(value);
}

/// Enums are int32 on the wire; negative values sign-extend to ten bytes.
fn put_enum_field(buf: &mut Vec<u8>, field: u32, value: i32) {
    if value != 0 {
        put_varint_field(buf, field, value as i64 as u64);
    }
}

fn put_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_key(buf, field, WIRE_LENGTH_DELIMITED);
    buf.put_u64_varint(bytes.len() as u64);
    buf.put_slice(bytes);
}

fn put_string_field(buf: &mut Vec<u8>, field: u32, value: &str) {
    put_bytes_field(buf, field, value.as_bytes());
}

/// Cursor over an encoded message that reports every underflow as a
/// malformed envelope instead of panicking.
struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn varint(&mut self) -> Result<u64, MessagingError> {
        self.buf
            .get_u64_varint()
            .map_err(|e| MessagingError::malformed(format!("VarInt error: {:?}", e)))
    }

    fn key(&mut self) -> Result<(u32, u8), MessagingError> {
        let key = self.varint()?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| MessagingError::malformed(format!("field number {} out of range", key >> 3)))?;
        if field == 0 {
            return Err(MessagingError::malformed("field number 0"));
        }
        Ok((field, (key & 0x7) as u8))
    }

    fn length_delimited(&mut self) -> Result<&'a [u8], MessagingError> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.buf.len())
            .ok_or_else(|| {
                MessagingError::malformed(format!(
                    "length {} exceeds remaining {} bytes",
                    len,
                    self.buf.len()
                ))
            })?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, MessagingError> {
        let raw = self.length_delimited()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| MessagingError::malformed(format!("invalid UTF-8: {}", e)))
    }

    fn fixed64(&mut self) -> Result<u64, MessagingError> {
        if self.buf.remaining() < 8 {
            return Err(MessagingError::malformed("truncated fixed64"));
        }
        Ok(self.buf.get_u64_le())
    }

    fn fixed32(&mut self) -> Result<u32, MessagingError> {
        if self.buf.remaining() < 4 {
            return Err(MessagingError::malformed("truncated fixed32"));
        }
        Ok(self.buf.get_u32_le())
    }

    fn skip(&mut self, wire: u8) -> Result<(), MessagingError> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.fixed64().map(|_| ()),
            WIRE_LENGTH_DELIMITED => self.length_delimited().map(|_| ()),
            WIRE_FIXED32 => self.fixed32().map(|_| ()),
            other => Err(MessagingError::malformed(format!(
                "unsupported wire type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{build_ack, ACK_STATUS_OK, REPLY_TO_KEY};

    fn full_envelope() -> MessageEnvelope {
        MessageEnvelope::builder(31)
            .message_id("42")
            .topic("benchmark")
            .message_type(MessageType::RpcRequest)
            .payload(DataMessage::new("test_42", vec!["00FF".into(), "ABCD".into()]).encode())
            .is_async(true)
            .routing(RoutingMode::Fanout)
            .qos(QosLevel::ExactlyOnce)
            .metadata_entry(REPLY_TO_KEY, "inbox.1")
            .metadata_entry("run", "7")
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip_request() {
        let envelope = full_envelope();
        let decoded = decode_binary(&encode_binary(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_round_trip_minimal() {
        let envelope = MessageEnvelope::builder(0).build().unwrap();
        let decoded = decode_binary(&encode_binary(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_round_trip_ack() {
        let ack = build_ack(&full_envelope(), "receiver-31", ACK_STATUS_OK, 1.25);
        let decoded = decode_binary(&encode_binary(&ack)).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.ack().unwrap().latency_ms, 1.25);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let envelope = full_envelope();
        assert_eq!(encode_binary(&envelope), encode_binary(&envelope.clone()));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let envelope = full_envelope();
        let mut bytes = encode_binary(&envelope);
        put_varint_field(&mut bytes, 20, 12345);
        put_string_field(&mut bytes, 21, "from a newer peer");
        put_key(&mut bytes, 22, WIRE_FIXED64);
        bytes.put_u64_le(7);
        put_key(&mut bytes, 23, WIRE_FIXED32);
        bytes.put_u32_le(7);

        let decoded = decode_binary(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_missing_message_id_is_malformed() {
        let mut bytes = Vec::new();
        put_varint_field(&mut bytes, envelope_field::TARGET, 3);
        let err = decode_binary(&bytes).unwrap_err();
        assert!(matches!(err, MessagingError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let bytes = encode_binary(&full_envelope());
        for cut in [1, 3, bytes.len() - 1] {
            let result = decode_binary(&bytes[..cut]);
            assert!(
                matches!(result, Err(MessagingError::MalformedEnvelope(_))),
                "cut at {} decoded as {:?}",
                cut,
                result
            );
        }
    }

    #[test]
    fn test_group_wire_type_is_malformed() {
        let mut bytes = encode_binary(&full_envelope());
        put_key(&mut bytes, 30, 3);
        assert!(decode_binary(&bytes).is_err());
    }

    #[test]
    fn test_empty_input_is_malformed() {
        assert!(matches!(
            decode_binary(&[]),
            Err(MessagingError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_known_field_layout() {
        let envelope = MessageEnvelope::builder(2)
            .message_id("a")
            .build()
            .unwrap();
        let bytes = encode_binary(&envelope);
        // message_id: key 0x0A, length 1, 'a'; target: key 0x10, value 2
        assert_eq!(&bytes[..5], &[0x0A, 0x01, b'a', 0x10, 0x02]);
    }
}
