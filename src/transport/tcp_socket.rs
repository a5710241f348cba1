//! TCP socket transport.
//!
//! Receiver `k` listens on `host:base_port + k` and accepts any number of
//! senders. A sender keeps one pooled stream per target and reads the reply to
//! a request from the same stream it wrote the request to.

use super::inbound::{Acceptor, InboundConnections};
use super::outbound::OutboundStream;
use super::pool::ConnectionPool;
use super::{DriverRole, TransportConfig, TransportDriver, TransportState};
use crate::error::MessagingError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct TcpSocketDriver {
    config: TransportConfig,
    role: DriverRole,
    pool: ConnectionPool<OutboundStream<TcpStream>>,
    last_target: Option<u32>,
    inbound: Option<InboundConnections>,
    state: TransportState,
}

impl TcpSocketDriver {
    pub fn new(config: TransportConfig, role: DriverRole) -> Self {
        Self {
            config,
            role,
            pool: ConnectionPool::new(),
            last_target: None,
            inbound: None,
            state: TransportState::Uninitialized,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Number of targets with an open pooled stream.
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }
}

/// Apply latency-oriented socket options.
fn configure_stream(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(())
}

async fn open_stream(
    config: &TransportConfig,
    target: u32,
) -> Result<OutboundStream<TcpStream>, MessagingError> {
    let addr = config.tcp_endpoint(target)?;
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| MessagingError::connection(&addr, "connect timed out"))?
        .map_err(|e| MessagingError::connection(&addr, e))?;
    configure_stream(&stream, config.buffer_size)
        .map_err(|e| MessagingError::connection(&addr, e))?;
    debug!("Connected to TCP receiver {} at {}", target, addr);
    Ok(OutboundStream::new(stream, config.max_frame_size))
}

struct TcpAcceptor {
    listener: TcpListener,
    buffer_size: usize,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept_peer(&mut self) -> std::io::Result<(TcpStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        if let Err(e) = configure_stream(&stream, self.buffer_size) {
            warn!("Failed to configure socket from {}: {}", addr, e);
        }
        Ok((stream, addr.to_string()))
    }
}

#[async_trait]
impl TransportDriver for TcpSocketDriver {
    async fn connect(&mut self) -> Result<(), MessagingError> {
        if self.state == TransportState::Connected {
            return Ok(());
        }

        if let DriverRole::Receiver { receiver_id } = self.role {
            let addr = self.config.tcp_endpoint(receiver_id)?;
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| MessagingError::connection(&addr, e))?;
            info!("TCP receiver {} listening on {}", receiver_id, addr);

            let mut inbound = InboundConnections::new(self.config.max_frame_size);
            inbound.start(TcpAcceptor {
                listener,
                buffer_size: self.config.buffer_size,
            });
            self.inbound = Some(inbound);
        }

        // Sender streams are opened lazily per target.
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8], target: u32) -> Result<(), MessagingError> {
        if self.state != TransportState::Connected {
            return Err(MessagingError::NotConnected);
        }

        if let Some(inbound) = self.inbound.as_mut() {
            return inbound.reply(bytes).await;
        }

        let config = &self.config;
        let stream = self
            .pool
            .get_or_connect(target, |t| open_stream(config, t))
            .await?;
        match stream.send(bytes).await {
            Ok(()) => {
                self.last_target = Some(target);
                Ok(())
            }
            Err(e) => {
                self.pool.remove(target);
                Err(e)
            }
        }
    }

    async fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
        if let Some(inbound) = self.inbound.as_mut() {
            return inbound.receive(timeout).await;
        }

        let target = self.last_target.ok_or(MessagingError::NotConnected)?;
        let stream = self
            .pool
            .get_mut(target)
            .ok_or(MessagingError::NotConnected)?;
        let reply = stream.receive(timeout).await;
        if reply.is_err() {
            self.pool.remove(target);
        }
        reply
    }

    async fn disconnect(&mut self) {
        self.pool.clear();
        self.last_target = None;
        if let Some(mut inbound) = self.inbound.take() {
            inbound.close().await;
            debug!("TCP listener closed");
        }
        if self.state == TransportState::Connected {
            self.state = TransportState::Disconnected;
        }
    }

    fn name(&self) -> &'static str {
        "TCP Socket"
    }

    async fn invalidate(&mut self, target: u32) {
        self.pool.remove(target);
        if self.last_target == Some(target) {
            self.last_target = None;
        }
    }
}
