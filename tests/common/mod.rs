//! Scripted transport drivers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use messaging_benchmark::envelope::{build_ack, MessageEnvelope, ACK_STATUS_OK};
use messaging_benchmark::error::MessagingError;
use messaging_benchmark::transport::{DriverFactory, TransportDriver};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// How a [`ScriptedDriver`] answers each request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    /// Acknowledge with status OK.
    Ack,
    /// Acknowledge with the given status string.
    Status(&'static str),
    /// Send an ACK for a different message first, then the real one.
    OtherThenAck,
    /// Never answer.
    Silent,
}

/// In-process driver that answers its own requests.
pub struct ScriptedDriver {
    reply: Reply,
    delay: Duration,
    inbox: VecDeque<Vec<u8>>,
}

impl ScriptedDriver {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            inbox: VecDeque::new(),
        }
    }

    /// Hold every reply back by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn boxed(self) -> Box<dyn TransportDriver> {
        Box::new(self)
    }
}

#[async_trait]
impl TransportDriver for ScriptedDriver {
    async fn connect(&mut self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8], _target: u32) -> Result<(), MessagingError> {
        let request = MessageEnvelope::from_bytes(bytes)?;
        match self.reply {
            Reply::Ack => self.inbox.push_back(ack_bytes(&request, ACK_STATUS_OK)),
            Reply::Status(status) => self.inbox.push_back(ack_bytes(&request, status)),
            Reply::OtherThenAck => {
                let other = MessageEnvelope::builder(request.target)
                    .message_id("some-earlier-message")
                    .build()?;
                self.inbox.push_back(ack_bytes(&other, ACK_STATUS_OK));
                self.inbox.push_back(ack_bytes(&request, ACK_STATUS_OK));
            }
            Reply::Silent => {}
        }
        Ok(())
    }

    async fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
        match self.inbox.pop_front() {
            Some(bytes) if self.delay <= timeout => {
                tokio::time::sleep(self.delay).await;
                Ok(Some(bytes))
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.inbox.clear();
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

fn ack_bytes(request: &MessageEnvelope, status: &str) -> Vec<u8> {
    build_ack(request, "scripted", status, 0.0).to_bytes()
}

/// Factory handing out one fresh [`ScriptedDriver`] per worker.
pub fn scripted_factory(reply: Reply, delay: Duration) -> Arc<dyn DriverFactory> {
    Arc::new(move || -> Result<Box<dyn TransportDriver>, MessagingError> {
        Ok(ScriptedDriver::new(reply).with_delay(delay).boxed())
    })
}
