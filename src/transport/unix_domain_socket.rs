//! Unix domain socket transport.
//!
//! Same framing and connection model as the TCP driver, addressed by socket
//! file instead of port: receiver `k` binds `<socket_dir>/msgbench_receiver_<k>.sock`.

use super::inbound::{Acceptor, InboundConnections};
use super::outbound::OutboundStream;
use super::pool::ConnectionPool;
use super::{DriverRole, TransportConfig, TransportDriver, TransportState};
use crate::error::MessagingError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

pub struct UnixDomainSocketDriver {
    config: TransportConfig,
    role: DriverRole,
    pool: ConnectionPool<OutboundStream<UnixStream>>,
    last_target: Option<u32>,
    inbound: Option<InboundConnections>,
    bound_path: Option<PathBuf>,
    state: TransportState,
}

impl UnixDomainSocketDriver {
    pub fn new(config: TransportConfig, role: DriverRole) -> Self {
        Self {
            config,
            role,
            pool: ConnectionPool::new(),
            last_target: None,
            inbound: None,
            bound_path: None,
            state: TransportState::Uninitialized,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }
}

async fn open_stream(
    config: &TransportConfig,
    target: u32,
) -> Result<OutboundStream<UnixStream>, MessagingError> {
    let path = config.socket_path(target);
    let endpoint = path.display().to_string();
    let stream = tokio::time::timeout(config.connect_timeout, UnixStream::connect(&path))
        .await
        .map_err(|_| MessagingError::connection(&endpoint, "connect timed out"))?
        .map_err(|e| MessagingError::connection(&endpoint, e))?;
    debug!("Connected to UDS receiver {} at {}", target, endpoint);
    Ok(OutboundStream::new(stream, config.max_frame_size))
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket file {}: {}", path.display(), e);
        }
    }
}

struct UnixAcceptor {
    listener: UnixListener,
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    type Stream = UnixStream;

    async fn accept_peer(&mut self) -> std::io::Result<(UnixStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((stream, format!("{:?}", addr)))
    }
}

#[async_trait]
impl TransportDriver for UnixDomainSocketDriver {
    async fn connect(&mut self) -> Result<(), MessagingError> {
        if self.state == TransportState::Connected {
            return Ok(());
        }

        if let DriverRole::Receiver { receiver_id } = self.role {
            let path = self.config.socket_path(receiver_id);
            // A previous run that was killed leaves its socket file behind.
            remove_socket_file(&path);
            let listener = UnixListener::bind(&path)
                .map_err(|e| MessagingError::connection(path.display().to_string(), e))?;
            info!("UDS receiver {} listening on {}", receiver_id, path.display());

            let mut inbound = InboundConnections::new(self.config.max_frame_size);
            inbound.start(UnixAcceptor { listener });
            self.inbound = Some(inbound);
            self.bound_path = Some(path);
        }

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
        }
        if let Some(path) = self.bound_path.take() {
            remove_socket_file(&path);
            debug!("Removed socket file {}", path.display());
        }
        if self.state == TransportState::Connected {
            self.state = TransportState::Disconnected;
        }
    }

    fn name(&self) -> &'static str {
        "Unix Domain Socket"
    }

    async fn invalidate(&mut self, target: u32) {
        self.pool.remove(target);
        if self.last_target == Some(target) {
            self.last_target = None;
        }
    }
}
