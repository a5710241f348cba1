//! Transport-agnostic sender.
//!
//! One logical send goes through BUILD, TRANSMIT, an optional WAIT_FOR_ACK and
//! RECORD. Every driver call on that path is bounded by the per-message
//! deadline, and every call to [`UnifiedSender::send`] records exactly one
//! outcome in the shared [`MessagingStats`].
//!
//! [`UnifiedSender::run_batch`] is the synchronous strategy: one request in
//! flight at a time. The asynchronous strategy lives in
//! [`crate::async_sender`] and drives several senders over one aggregator.

use crate::envelope::{validate_ack, MessageEnvelope, MessageType, REPLY_TO_KEY};
use crate::error::MessagingError;
use crate::metrics::{MessagingStats, StatsSnapshot};
use crate::transport::TransportDriver;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// One unit of work handed to a sender.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    /// Caller-chosen id; a UUID is generated when absent.
    pub message_id: Option<String>,
    pub target: u32,
    pub payload: Vec<u8>,
    pub topic: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(target: u32, payload: Vec<u8>) -> Self {
        Self {
            target,
            payload,
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-send behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub wait_for_ack: bool,
    /// Deadline for the whole exchange, transmit included.
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            wait_for_ack: true,
            timeout: Duration::from_millis(crate::defaults::TIMEOUT_MS),
        }
    }
}

/// Why a send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    Connection,
    Timeout,
    InvalidAck,
    Transport,
    /// Encoding or decoding failed.
    Exception,
}

impl From<&MessagingError> for SendErrorKind {
    fn from(err: &MessagingError) -> Self {
        match err {
            MessagingError::Connection { .. } | MessagingError::NotConnected => {
                SendErrorKind::Connection
            }
            MessagingError::Timeout(_) => SendErrorKind::Timeout,
            MessagingError::InvalidAck(_) => SendErrorKind::InvalidAck,
            MessagingError::Transport(_)
            | MessagingError::BackpressureTimeout
            | MessagingError::Io(_) => SendErrorKind::Transport,
            MessagingError::MalformedEnvelope(_) | MessagingError::InvalidEnvelope(_) => {
                SendErrorKind::Exception
            }
        }
    }
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendErrorKind::Connection => "ConnectionError",
            SendErrorKind::Timeout => "Timeout",
            SendErrorKind::InvalidAck => "InvalidAck",
            SendErrorKind::Transport => "TransportError",
            SendErrorKind::Exception => "Exception",
        };
        f.write_str(name)
    }
}

/// Outcome of one send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub message_id: String,
    /// Wall-clock time from just before transmit to the validated ACK (or
    /// to the end of transmit when not waiting).
    pub latency_ms: f64,
    /// Identity reported in the acknowledgment.
    pub receiver_id: Option<String>,
    pub error_kind: Option<SendErrorKind>,
    pub error: Option<String>,
}

impl SendResult {
    fn succeeded(message_id: String, latency_ms: f64, receiver_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            latency_ms,
            receiver_id,
            error_kind: None,
            error: None,
        }
    }

    fn failed(message_id: String, latency_ms: f64, err: &MessagingError) -> Self {
        Self {
            success: false,
            message_id,
            latency_ms,
            receiver_id: None,
            error_kind: Some(SendErrorKind::from(err)),
            error: Some(err.to_string()),
        }
    }
}

/// Sender state machine over one transport driver.
pub struct UnifiedSender {
    driver: Box<dyn TransportDriver>,
    stats: Arc<MessagingStats>,
    is_async: bool,
    connected: bool,
}

impl UnifiedSender {
    pub fn new(driver: Box<dyn TransportDriver>) -> Self {
        Self::with_stats(driver, Arc::new(MessagingStats::new()))
    }

    /// Record into an aggregator shared with other senders.
    pub fn with_stats(driver: Box<dyn TransportDriver>, stats: Arc<MessagingStats>) -> Self {
        Self {
            driver,
            stats,
            is_async: false,
            connected: false,
        }
    }

    /// Mark outgoing envelopes as sent by the asynchronous strategy.
    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn stats(&self) -> &Arc<MessagingStats> {
        &self.stats
    }

    pub fn transport_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn connect(&mut self) -> Result<(), MessagingError> {
        if self.connected {
            return Ok(());
        }
        self.driver.connect().await?;
        self.connected = true;
        debug!("Sender connected over {}", self.driver.name());
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.driver.disconnect().await;
        self.connected = false;
    }

    /// Send one message and record its outcome.
    ///
    /// Failures are returned in the result, never as an error.
    pub async fn send(&mut self, message: &OutboundMessage, options: &SendOptions) -> SendResult {
        let envelope = match self.build_envelope(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to build envelope for target {}: {}", message.target, e);
                self.stats.record(false, None);
                return SendResult::failed(message.message_id.clone().unwrap_or_default(), 0.0, &e);
            }
        };
        let message_id = envelope.message_id().to_string();

        let started = Instant::now();
        let outcome = self.exchange(&envelope, options, started).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(receiver_id) => {
                self.stats.record(true, Some(latency_ms));
                debug!(
                    "Message {} acknowledged by {:?} in {:.3}ms",
                    message_id, receiver_id, latency_ms
                );
                SendResult::succeeded(message_id, latency_ms, receiver_id)
            }
            Err(e) => {
                if e.poisons_connection() {
                    self.driver.invalidate(envelope.target).await;
                }
                warn!("Message {} to target {} failed: {}", message_id, envelope.target, e);
                self.stats.record(false, None);
                SendResult::failed(message_id, latency_ms, &e)
            }
        }
    }

    /// Synchronous batch: reset the aggregator, send every item in order with
    /// one request in flight, and return the final snapshot.
    ///
    /// Only the initial connect can fail the batch.
    pub async fn run_batch(
        &mut self,
        items: &[OutboundMessage],
        options: &SendOptions,
    ) -> Result<StatsSnapshot, MessagingError> {
        self.stats.reset();
        self.connect().await?;

        info!(
            "Sending {} messages synchronously over {} (wait_for_ack={}, timeout={}ms)",
            items.len(),
            self.driver.name(),
            options.wait_for_ack,
            options.timeout.as_millis()
        );

        self.stats.start();
        for item in items {
            self.send(item, options).await;
        }
        self.stats.finish();

        Ok(self.stats.snapshot())
    }

    fn build_envelope(&self, message: &OutboundMessage) -> Result<MessageEnvelope, MessagingError> {
        let mut builder = MessageEnvelope::builder(message.target)
            .message_type(MessageType::DataMessage)
            .payload(message.payload.clone())
            .is_async(self.is_async)
            .metadata(message.metadata.clone());
        if let Some(id) = &message.message_id {
            builder = builder.message_id(id.clone());
        }
        if let Some(topic) = &message.topic {
            builder = builder.topic(topic.clone());
        }
        if !message.metadata.contains_key(REPLY_TO_KEY) {
            if let Some(address) = self.driver.reply_address() {
                builder = builder.metadata_entry(REPLY_TO_KEY, address);
            }
        }
        builder.build()
    }

    /// Transmit and, if asked, wait for the matching ACK. Returns the
    /// acknowledging receiver's identity.
    async fn exchange(
        &mut self,
        envelope: &MessageEnvelope,
        options: &SendOptions,
        started: Instant,
    ) -> Result<Option<String>, MessagingError> {
        let deadline = started + options.timeout;
        let bytes = envelope.to_bytes();

        timeout_at(deadline, self.driver.send_raw(&bytes, envelope.target))
            .await
            .map_err(|_| MessagingError::Timeout(options.timeout))??;

        if !options.wait_for_ack {
            return Ok(None);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MessagingError::Timeout(options.timeout));
        }

        let reply = match timeout_at(deadline, self.driver.receive_raw(remaining)).await {
            Ok(reply) => reply?,
            Err(_) => None,
        };
        let reply = reply.ok_or(MessagingError::Timeout(options.timeout))?;

        // The first reply decides the outcome, including one correlated to a
        // different request.
        let candidate = MessageEnvelope::from_bytes(&reply)?;
        let ack = validate_ack(&candidate, envelope.message_id()).map_err(|e| {
            warn!("Rejected reply for {}: {:?}", envelope.message_id(), candidate);
            e
        })?;
        Ok(Some(ack.receiver_id.clone()))
    }
}
