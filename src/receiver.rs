//! Transport-agnostic receiver loop.
//!
//! A receiver waits up to its poll interval for a message, decodes it,
//! acknowledges it through the same driver, and checks its stop flag before
//! every wait. Envelopes routed to another receiver id are dropped silently,
//! which lets several receivers share one channel.

use crate::envelope::{build_ack, MessageEnvelope, ACK_STATUS_OK};
use crate::error::MessagingError;
use crate::metrics::MessagingStats;
use crate::transport::TransportDriver;
use crate::utils::current_time_ms;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counts reported by a receiver when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReceiverSummary {
    pub receiver_id: u32,
    pub received: u64,
    pub failed: u64,
    /// Envelopes addressed to another receiver, or stray ACKs.
    pub ignored: u64,
}

/// Cloneable handle that asks a running receiver to stop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct UnifiedReceiver {
    receiver_id: u32,
    identity: String,
    driver: Box<dyn TransportDriver>,
    stats: Arc<MessagingStats>,
    ignored: u64,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    connected: bool,
}

impl UnifiedReceiver {
    pub fn new(receiver_id: u32, driver: Box<dyn TransportDriver>) -> Self {
        Self {
            receiver_id,
            identity: receiver_id.to_string(),
            driver,
            stats: Arc::new(MessagingStats::new()),
            ignored: 0,
            stop: Arc::new(AtomicBool::new(false)),
            poll_interval: crate::defaults::POLL_INTERVAL,
            connected: false,
        }
    }

    /// Upper bound on each wait, and therefore on shutdown latency.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn receiver_id(&self) -> u32 {
        self.receiver_id
    }

    pub fn stats(&self) -> &Arc<MessagingStats> {
        &self.stats
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Request shutdown. An in-flight wait is not interrupted.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn summary(&self) -> ReceiverSummary {
        ReceiverSummary {
            receiver_id: self.receiver_id,
            received: self.stats.received_count(),
            failed: self.stats.failed_count(),
            ignored: self.ignored,
        }
    }

    pub async fn connect(&mut self) -> Result<(), MessagingError> {
        if self.connected {
            return Ok(());
        }
        self.driver.connect().await?;
        self.connected = true;
        Ok(())
    }

    /// Wait up to `wait` for one envelope and acknowledge it.
    ///
    /// Returns the envelope when it was addressed to this receiver and
    /// decoded; `None` on timeout, on a foreign or malformed envelope, and
    /// on driver errors.
    pub async fn receive_and_ack(&mut self, wait: Duration) -> Option<MessageEnvelope> {
        let bytes = match self.driver.receive_raw(wait).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Receiver {} failed to receive: {}", self.receiver_id, e);
                // Back off so a broken driver does not spin the loop.
                tokio::time::sleep(wait).await;
                return None;
            }
        };

        let envelope = match MessageEnvelope::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Receiver {} dropped undecodable message: {}", self.receiver_id, e);
                self.stats.record(false, None);
                return None;
            }
        };

        if envelope.is_ack() || envelope.target != self.receiver_id {
            self.ignored += 1;
            debug!(
                "Receiver {} ignoring {} {} for target {}",
                self.receiver_id,
                envelope.message_type(),
                envelope.message_id(),
                envelope.target
            );
            return None;
        }

        let latency_ms = (current_time_ms() - envelope.timestamp as f64).max(0.0);
        self.stats.record(true, Some(latency_ms));

        let ack = build_ack(&envelope, &self.identity, ACK_STATUS_OK, latency_ms);
        // Drivers bound their own writes; cancelling one could cut a frame.
        match self.driver.send_raw(&ack.to_bytes(), envelope.target).await {
            Ok(()) => debug!(
                "Receiver {} acknowledged {}",
                self.receiver_id,
                envelope.message_id()
            ),
            Err(e) => warn!(
                "Receiver {} failed to send ACK for {}: {}",
                self.receiver_id,
                envelope.message_id(),
                e
            ),
        }

        Some(envelope)
    }

    /// Connect, serve until stopped, then disconnect.
    pub async fn run(&mut self, verbose: bool) -> Result<ReceiverSummary, MessagingError> {
        self.connect().await?;
        if verbose {
            info!(
                "Receiver {} started on {}",
                self.receiver_id,
                self.driver.name()
            );
        }

        self.stats.start();
        while !self.stop.load(Ordering::Acquire) {
            self.receive_and_ack(self.poll_interval).await;
        }
        self.stats.finish();

        self.driver.disconnect().await;
        self.connected = false;

        let summary = self.summary();
        if verbose {
            info!(
                "Receiver {} stopped: {} received, {} failed, {} ignored",
                summary.receiver_id, summary.received, summary.failed, summary.ignored
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::validate_ack;
    use crate::transport::{DriverRole, MemoryAddressing, MemoryBroker, MemoryDriver};

    const SHORT: Duration = Duration::from_millis(50);

    fn shared() -> MemoryAddressing {
        MemoryAddressing::Shared("bench".to_string())
    }

    async fn sender_on(broker: &MemoryBroker) -> MemoryDriver {
        let mut driver = MemoryDriver::new(broker.clone(), DriverRole::Sender, shared());
        driver.connect().await.unwrap();
        driver
    }

    async fn receiver_on(broker: &MemoryBroker, receiver_id: u32) -> UnifiedReceiver {
        let driver = MemoryDriver::new(broker.clone(), DriverRole::Receiver { receiver_id }, shared());
        let mut receiver = UnifiedReceiver::new(receiver_id, Box::new(driver));
        receiver.connect().await.unwrap();
        receiver
    }

    #[tokio::test]
    async fn test_acknowledges_own_target() {
        let broker = MemoryBroker::new();
        let mut receiver = receiver_on(&broker, 3).await;
        let mut sender = sender_on(&broker).await;

        let request = MessageEnvelope::builder(3).payload(b"x".to_vec()).build().unwrap();
        sender.send_raw(&request.to_bytes(), 3).await.unwrap();

        let got = receiver.receive_and_ack(SHORT).await.unwrap();
        assert_eq!(got.message_id(), request.message_id());

        let reply = sender.receive_raw(SHORT).await.unwrap().unwrap();
        let ack = MessageEnvelope::from_bytes(&reply).unwrap();
        let body = validate_ack(&ack, request.message_id()).unwrap();
        assert_eq!(body.receiver_id, "3");
        assert_eq!(receiver.summary().received, 1);
    }

    #[tokio::test]
    async fn test_foreign_target_is_not_acknowledged() {
        let broker = MemoryBroker::new();
        let mut receiver = receiver_on(&broker, 1).await;
        let mut sender = sender_on(&broker).await;

        let request = MessageEnvelope::builder(2).build().unwrap();
        sender.send_raw(&request.to_bytes(), 2).await.unwrap();

        assert!(receiver.receive_and_ack(SHORT).await.is_none());
        assert!(sender.receive_raw(SHORT).await.unwrap().is_none());
        assert_eq!(receiver.summary().ignored, 1);
        assert_eq!(receiver.summary().received, 0);
    }

    #[tokio::test]
    async fn test_malformed_message_counts_as_failure() {
        let broker = MemoryBroker::new();
        let mut receiver = receiver_on(&broker, 0).await;
        let mut sender = sender_on(&broker).await;

        sender.send_raw(&[0x0A, 0x10, 0x01], 0).await.unwrap();
        assert!(receiver.receive_and_ack(SHORT).await.is_none());

        let request = MessageEnvelope::builder(0).build().unwrap();
        sender.send_raw(&request.to_bytes(), 0).await.unwrap();
        assert!(receiver.receive_and_ack(SHORT).await.is_some());

        let summary = receiver.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.received, 1);
    }

    #[tokio::test]
    async fn test_stray_ack_is_ignored() {
        let broker = MemoryBroker::new();
        let mut receiver = receiver_on(&broker, 0).await;
        let mut sender = sender_on(&broker).await;

        let request = MessageEnvelope::builder(0).build().unwrap();
        let ack = build_ack(&request, "9", ACK_STATUS_OK, 0.5);
        sender.send_raw(&ack.to_bytes(), 0).await.unwrap();

        assert!(receiver.receive_and_ack(SHORT).await.is_none());
        assert_eq!(receiver.summary().ignored, 1);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let broker = MemoryBroker::new();
        let driver = MemoryDriver::new(broker, DriverRole::Receiver { receiver_id: 4 }, shared());
        let mut receiver =
            UnifiedReceiver::new(4, Box::new(driver)).with_poll_interval(Duration::from_millis(20));
        let handle = receiver.stop_handle();

        let task = tokio::spawn(async move { receiver.run(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.receiver_id, 4);
        assert!(handle.is_stopped());
    }
}
