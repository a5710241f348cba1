//! In-process broker transport.
//!
//! The broker keeps named channels. Publishing fans a delivery out to every
//! current subscriber of the channel, the way a pub/sub broker would. Each
//! sender driver owns a private `inbox.<uuid>` channel that travels with every
//! delivery as its reply destination.

use super::{DriverRole, TransportDriver, TransportState};
use crate::error::MessagingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// One message as seen by a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub reply_to: Option<String>,
}

/// Shared in-process message broker. Cloning yields another handle to the
/// same channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!("Subscribed to channel '{}'", channel);
        rx
    }

    /// Deliver to every live subscriber of `channel`, returning how many got it.
    pub fn publish(&self, channel: &str, delivery: Delivery) -> usize {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(delivery.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        delivered
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// How targets map onto broker channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MemoryAddressing {
    /// Receiver `k` listens on `receiver.<k>`.
    #[default]
    PerTarget,
    /// Every receiver listens on the same channel and filters by target.
    Shared(String),
}

impl MemoryAddressing {
    pub fn channel_for(&self, target: u32) -> String {
        match self {
            MemoryAddressing::PerTarget => format!("receiver.{}", target),
            MemoryAddressing::Shared(name) => name.clone(),
        }
    }
}

pub struct MemoryDriver {
    broker: MemoryBroker,
    role: DriverRole,
    addressing: MemoryAddressing,
    inbox_name: Option<String>,
    inbox: Option<mpsc::UnboundedReceiver<Delivery>>,
    last_reply_to: Option<String>,
    state: TransportState,
}

impl MemoryDriver {
    pub fn new(broker: MemoryBroker, role: DriverRole, addressing: MemoryAddressing) -> Self {
        Self {
            broker,
            role,
            addressing,
            inbox_name: None,
            inbox: None,
            last_reply_to: None,
            state: TransportState::Uninitialized,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    fn subscribe(&mut self, channel: String) {
        self.inbox = Some(self.broker.subscribe(&channel));
        self.inbox_name = Some(channel);
    }

    /// Drop replies nobody waited for, e.g. ACKs to fire-and-forget sends.
    fn discard_unread(&mut self) {
        let Some(inbox) = self.inbox.as_mut() else {
            return;
        };
        let mut discarded = 0usize;
        while inbox.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            trace!("Discarded {} unread replies", discarded);
        }
    }
}

#[async_trait]
impl TransportDriver for MemoryDriver {
    async fn connect(&mut self) -> Result<(), MessagingError> {
        if self.state == TransportState::Connected {
            return Ok(());
        }

        let channel = match self.role {
            DriverRole::Sender => format!("inbox.{}", Uuid::new_v4()),
            DriverRole::Receiver { receiver_id } => self.addressing.channel_for(receiver_id),
        };
        self.subscribe(channel);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8], target: u32) -> Result<(), MessagingError> {
        if self.state != TransportState::Connected {
            return Err(MessagingError::NotConnected);
        }

        let (channel, reply_to) = match self.role {
            DriverRole::Sender => {
                self.discard_unread();
                (self.addressing.channel_for(target), self.inbox_name.clone())
            }
            DriverRole::Receiver { .. } => {
                let channel = self.last_reply_to.clone().ok_or_else(|| {
                    MessagingError::Transport("no reply destination for response".to_string())
                })?;
                (channel, None)
            }
        };

        let delivered = self.broker.publish(
            &channel,
            Delivery {
                payload: bytes.to_vec(),
                reply_to,
            },
        );
        if delivered == 0 {
            return Err(MessagingError::Transport(format!(
                "no subscribers on channel '{}'",
                channel
            )));
        }
        trace!("Published {} bytes to '{}' ({} subscribers)", bytes.len(), channel, delivered);
        Ok(())
    }

    async fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
        let inbox = self.inbox.as_mut().ok_or(MessagingError::NotConnected)?;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(delivery)) => {
                if matches!(self.role, DriverRole::Receiver { .. }) {
                    self.last_reply_to = delivery.reply_to;
                }
                Ok(Some(delivery.payload))
            }
            Ok(None) => Err(MessagingError::Transport("inbox closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        if self.state == TransportState::Connected {
            debug!(
                "Closing in-memory subscription {}",
                self.inbox_name.as_deref().unwrap_or("")
            );
        }
        // Dropping the receiver closes the subscription; the broker prunes it
        // on the next publish.
        self.inbox = None;
        self.inbox_name = None;
        self.last_reply_to = None;
        if self.state == TransportState::Connected {
            self.state = TransportState::Disconnected;
        }
    }

    fn name(&self) -> &'static str {
        "In-Memory Broker"
    }

    fn reply_address(&self) -> Option<String> {
        match self.role {
            DriverRole::Sender => self.inbox_name.clone(),
            DriverRole::Receiver { .. } => None,
        }
    }

    /// Move a sender to a fresh inbox so late replies to an abandoned request
    /// are never read.
    async fn invalidate(&mut self, _target: u32) {
        if self.role != DriverRole::Sender || self.state != TransportState::Connected {
            return;
        }
        let channel = format!("inbox.{}", Uuid::new_v4());
        debug!(
            "Replacing inbox {} with {}",
            self.inbox_name.as_deref().unwrap_or(""),
            channel
        );
        self.subscribe(channel);
    }
}
