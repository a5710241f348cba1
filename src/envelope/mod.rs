//! # Message Envelope
//!
//! The envelope is the unit every transport driver carries. It couples routing
//! information (target receiver, topic, routing mode) with an opaque payload
//! and, for replies, an embedded [`Acknowledgment`] correlated to the request
//! it answers.
//!
//! Two serialization forms are provided:
//!
//! - [`binary`]: compact, protobuf-wire-compatible tagged encoding used on the
//!   wire between language implementations
//! - [`json`]: human-readable debug form that also accepts the looser shapes
//!   produced by dynamically-typed callers
//!
//! ACK envelopes are only ever produced by [`build_ack`], which keeps the
//! "ack is present if and only if type is ACK" rule true for every envelope
//! constructed in this process.

use crate::error::MessagingError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

pub mod binary;
pub mod json;

pub use binary::{decode_binary, encode_binary};
pub use json::{decode_debug_json, encode_debug_json};

/// Conventional status string of a successful acknowledgment.
pub const ACK_STATUS_OK: &str = "OK";

/// Metadata key carrying the reply address for transports without a native
/// reply destination.
pub const REPLY_TO_KEY: &str = "reply_to";

/// Prefix of every acknowledgment envelope's message id.
pub const ACK_ID_PREFIX: &str = "ack_";

/// Declares an enum with a fixed wire number per variant.
///
/// Wire number 0 and unknown numbers decode to the first variant so that
/// envelopes produced by newer peers still decode.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $first:ident = ($first_num:literal, $first_str:literal),
            $($variant:ident = ($num:literal, $str:literal),)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub enum $name {
            #[default]
            $first,
            $($variant,)*
        }

        impl $name {
            /// Numeric value used by both serialization forms.
            pub fn as_i32(self) -> i32 {
                match self {
                    $name::$first => $first_num,
                    $($name::$variant => $num,)*
                }
            }

            pub fn from_i32(value: i32) -> Self {
                match value {
                    $($num => $name::$variant,)*
                    _ => $name::$first,
                }
            }

            pub fn as_str_name(self) -> &'static str {
                match self {
                    $name::$first => $first_str,
                    $($name::$variant => $str,)*
                }
            }

            pub fn from_str_name(name: &str) -> Option<Self> {
                match name {
                    $first_str => Some($name::$first),
                    $($str => Some($name::$variant),)*
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str_name())
            }
        }
    };
}

wire_enum! {
    /// Kind of unit carried by an envelope.
    pub enum MessageType {
        DataMessage = (1, "DATA_MESSAGE"),
        RpcRequest = (2, "RPC_REQUEST"),
        RpcResponse = (3, "RPC_RESPONSE"),
        Ack = (4, "ACK"),
        Control = (5, "CONTROL"),
        Event = (6, "EVENT"),
    }
}

wire_enum! {
    /// Delivery pattern requested by the sender.
    pub enum RoutingMode {
        PointToPoint = (1, "POINT_TO_POINT"),
        PublishSubscribe = (2, "PUBLISH_SUBSCRIBE"),
        RequestReply = (3, "REQUEST_REPLY"),
        Fanout = (4, "FANOUT"),
    }
}

wire_enum! {
    /// Advisory delivery guarantee. Never enforced by this crate.
    pub enum QosLevel {
        AtMostOnce = (1, "AT_MOST_ONCE"),
        AtLeastOnce = (2, "AT_LEAST_ONCE"),
        ExactlyOnce = (3, "EXACTLY_ONCE"),
    }
}

/// Receipt embedded in an ACK-type envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Acknowledgment {
    #[serde(alias = "originalMessageId")]
    pub original_message_id: String,
    pub received: bool,
    /// Receiver-side estimate; the sender measures its own round trip.
    #[serde(alias = "latencyMs")]
    pub latency_ms: f64,
    #[serde(alias = "receiverId")]
    pub receiver_id: String,
    pub status: String,
}

/// Application payload built from one test-data record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataMessage {
    pub message_name: String,
    pub message_value: Vec<String>,
}

impl DataMessage {
    pub fn new(message_name: impl Into<String>, message_value: Vec<String>) -> Self {
        Self {
            message_name: message_name.into(),
            message_value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        binary::encode_data_message(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessagingError> {
        binary::decode_data_message(bytes)
    }
}

/// The transmissible unit.
///
/// `message_id`, `message_type` and `ack` are fixed at construction; the
/// remaining fields are plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    message_id: String,
    pub target: u32,
    /// Never `Some("")`; empty topics are normalized to `None`.
    pub topic: Option<String>,
    message_type: MessageType,
    pub payload: Vec<u8>,
    pub is_async: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub routing: RoutingMode,
    pub qos: QosLevel,
    pub metadata: BTreeMap<String, String>,
    ack: Option<Acknowledgment>,
}

impl MessageEnvelope {
    pub fn builder(target: u32) -> EnvelopeBuilder {
        EnvelopeBuilder::new(target)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn ack(&self) -> Option<&Acknowledgment> {
        self.ack.as_ref()
    }

    /// Mutable access to the embedded acknowledgment, used to exercise
    /// validation in tests and diagnostics.
    pub fn ack_mut(&mut self) -> Option<&mut Acknowledgment> {
        self.ack.as_mut()
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == MessageType::Ack
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.metadata.get(REPLY_TO_KEY).map(String::as_str)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_binary(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        decode_binary(bytes)
    }

    pub fn to_debug_json(&self) -> Result<String, MessagingError> {
        encode_debug_json(self)
    }

    pub fn from_debug_json(text: &str) -> Result<Self, MessagingError> {
        decode_debug_json(text)
    }
}

/// Builder for request envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_id: Option<String>,
    target: u32,
    topic: Option<String>,
    message_type: MessageType,
    payload: Vec<u8>,
    is_async: bool,
    routing: RoutingMode,
    qos: QosLevel,
    metadata: BTreeMap<String, String>,
}

impl EnvelopeBuilder {
    pub fn new(target: u32) -> Self {
        Self {
            message_id: None,
            target,
            topic: None,
            message_type: MessageType::DataMessage,
            payload: Vec::new(),
            is_async: false,
            routing: RoutingMode::PointToPoint,
            qos: QosLevel::AtMostOnce,
            metadata: BTreeMap::new(),
        }
    }

    /// Use a caller-supplied id instead of a generated UUID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn routing(mut self, routing: RoutingMode) -> Self {
        self.routing = routing;
        self
    }

    pub fn qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<MessageEnvelope, MessagingError> {
        if self.message_type == MessageType::Ack {
            return Err(MessagingError::InvalidEnvelope(
                "ACK envelopes can only be produced by build_ack".to_string(),
            ));
        }
        let message_id = match self.message_id {
            Some(id) if !id.is_empty() => id,
            _ => new_message_id(),
        };
        Ok(MessageEnvelope {
            message_id,
            target: self.target,
            topic: self.topic.filter(|t| !t.is_empty()),
            message_type: self.message_type,
            payload: self.payload,
            is_async: self.is_async,
            timestamp: next_timestamp_ms(),
            routing: self.routing,
            qos: self.qos,
            metadata: self.metadata,
            ack: None,
        })
    }
}

/// Decoded but not yet validated envelope fields, shared by both decoders.
#[derive(Debug, Default)]
pub(crate) struct EnvelopeParts {
    pub message_id: Option<String>,
    pub target: u32,
    pub topic: Option<String>,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub is_async: bool,
    pub timestamp: i64,
    pub routing: RoutingMode,
    pub qos: QosLevel,
    pub metadata: BTreeMap<String, String>,
    pub ack: Option<Acknowledgment>,
}

impl EnvelopeParts {
    pub fn into_envelope(self) -> Result<MessageEnvelope, MessagingError> {
        let message_id = self
            .message_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MessagingError::malformed("missing message_id"))?;

        match (self.message_type, self.ack.is_some()) {
            (MessageType::Ack, false) => {
                return Err(MessagingError::malformed(format!(
                    "ACK envelope {} carries no acknowledgment",
                    message_id
                )))
            }
            (other, true) if other != MessageType::Ack => {
                return Err(MessagingError::malformed(format!(
                    "{} envelope {} carries an acknowledgment",
                    other, message_id
                )))
            }
            _ => {}
        }

        Ok(MessageEnvelope {
            message_id,
            target: self.target,
            topic: self.topic.filter(|t| !t.is_empty()),
            message_type: self.message_type,
            payload: self.payload,
            is_async: self.is_async,
            timestamp: self.timestamp,
            routing: self.routing,
            qos: self.qos,
            metadata: self.metadata,
            ack: self.ack,
        })
    }
}

/// Build the acknowledgment for `original` on behalf of `receiver_id`.
///
/// A `reply_to` metadata entry on the request is copied forward so that
/// transports without native reply channels can route the ACK back.
pub fn build_ack(
    original: &MessageEnvelope,
    receiver_id: &str,
    status: &str,
    measured_latency_ms: f64,
) -> MessageEnvelope {
    let mut metadata = BTreeMap::new();
    if let Some(reply_to) = original.reply_to() {
        metadata.insert(REPLY_TO_KEY.to_string(), reply_to.to_string());
    }

    MessageEnvelope {
        message_id: format!("{}{}", ACK_ID_PREFIX, original.message_id),
        target: original.target,
        topic: None,
        message_type: MessageType::Ack,
        payload: Vec::new(),
        is_async: original.is_async,
        timestamp: next_timestamp_ms(),
        routing: RoutingMode::RequestReply,
        qos: original.qos,
        metadata,
        ack: Some(Acknowledgment {
            original_message_id: original.message_id.clone(),
            received: true,
            latency_ms: measured_latency_ms,
            receiver_id: receiver_id.to_string(),
            status: status.to_string(),
        }),
    }
}

/// Check `candidate` against the request the caller is waiting for,
/// returning the acknowledgment or the reason it was rejected.
pub fn validate_ack<'a>(
    candidate: &'a MessageEnvelope,
    expected_message_id: &str,
) -> Result<&'a Acknowledgment, MessagingError> {
    if candidate.message_type != MessageType::Ack {
        return Err(MessagingError::InvalidAck(format!(
            "expected ACK, got {}",
            candidate.message_type
        )));
    }
    let ack = candidate
        .ack
        .as_ref()
        .ok_or_else(|| MessagingError::InvalidAck("acknowledgment missing".to_string()))?;
    if !ack.received {
        return Err(MessagingError::InvalidAck(
            "receiver reported received=false".to_string(),
        ));
    }
    if ack.original_message_id != expected_message_id {
        return Err(MessagingError::InvalidAck(format!(
            "acknowledges {} instead of {}",
            ack.original_message_id, expected_message_id
        )));
    }
    if ack.status != ACK_STATUS_OK {
        return Err(MessagingError::InvalidAck(format!(
            "status {:?}",
            ack.status
        )));
    }
    Ok(ack)
}

pub fn is_valid_ack(candidate: &MessageEnvelope, expected_message_id: &str) -> bool {
    validate_ack(candidate, expected_message_id).is_ok()
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, bumped so that successive calls in this process
/// never return the same value twice.
pub fn next_timestamp_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TIMESTAMP_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP_MS.compare_exchange_weak(
            last,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
