use crate::error::MessagingError;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod framing;
pub mod inbound;
pub mod memory;
pub mod outbound;
pub mod pool;
pub mod tcp_socket;
#[cfg(unix)]
pub mod unix_domain_socket;

pub use memory::{MemoryAddressing, MemoryBroker, MemoryDriver};
pub use pool::ConnectionPool;
pub use tcp_socket::TcpSocketDriver;
#[cfg(unix)]
pub use unix_domain_socket::UnixDomainSocketDriver;

/// Connection identifier for tracking multiple peer connections
pub type ConnectionId = u64;

/// Capability contract every transport binding satisfies.
///
/// The sender and receiver state machines only ever see a
/// `Box<dyn TransportDriver>`; nothing above this trait knows which broker or
/// socket family carries the bytes. All blocking operations are bounded:
/// `connect` by the driver's connect timeout, `send_raw` by the frame write
/// timeout and `receive_raw` by its argument.
#[async_trait]
pub trait TransportDriver: Send {
    /// Establish session state. Calling it on a connected driver is a no-op.
    async fn connect(&mut self) -> Result<(), MessagingError>;

    /// Hand opaque bytes to the transport, addressed at `target`.
    ///
    /// Receiver-role drivers route to the peer that sent the most recent
    /// message and ignore `target`. Callers must not cancel this future:
    /// a frame cut short leaves the connection unusable, so drivers bound
    /// their own writes and drop a connection whose write did not finish.
    async fn send_raw(&mut self, bytes: &[u8], target: u32) -> Result<(), MessagingError>;

    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout.
    async fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, MessagingError>;

    /// Release resources. Safe to call repeatedly or before `connect`.
    async fn disconnect(&mut self);

    /// Get transport name for identification
    fn name(&self) -> &'static str;

    /// Address a receiver should reply to when the transport has no native
    /// reply channel. Carried in the `reply_to` metadata entry.
    fn reply_address(&self) -> Option<String> {
        None
    }

    /// Drop any cached state for `target` after a timeout or transport error,
    /// so the next send starts from a clean connection.
    async fn invalidate(&mut self, _target: u32) {}
}

/// Builds a fresh driver per sender worker.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn TransportDriver>, MessagingError>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Result<Box<dyn TransportDriver>, MessagingError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn TransportDriver>, MessagingError> {
        self()
    }
}

/// Available transport bindings
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process broker
    #[clap(name = "memory")]
    Memory,

    /// TCP sockets, one port per receiver
    #[clap(name = "tcp")]
    Tcp,

    /// Unix domain sockets, one socket file per receiver
    #[clap(name = "uds")]
    UnixDomainSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "In-Memory Broker"),
            TransportKind::Tcp => write!(f, "TCP Socket"),
            TransportKind::UnixDomainSocket => write!(f, "Unix Domain Socket"),
        }
    }
}

/// Which side of the request/acknowledgment exchange a driver serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRole {
    Sender,
    Receiver { receiver_id: u32 },
}

/// Transport state for tracking connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// Transport configuration shared by the socket drivers
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    /// Receiver `k` listens on `base_port + k`.
    pub base_port: u16,
    /// Receiver `k` binds `<socket_dir>/msgbench_receiver_<k>.sock`.
    pub socket_dir: PathBuf,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::HOST.to_string(),
            base_port: crate::defaults::BASE_PORT,
            socket_dir: PathBuf::from(crate::defaults::SOCKET_DIR),
            buffer_size: crate::defaults::BUFFER_SIZE,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            max_frame_size: framing::MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn tcp_endpoint(&self, id: u32) -> Result<String, MessagingError> {
        let port = (self.base_port as u32)
            .checked_add(id)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| {
                MessagingError::connection(
                    format!("{}:{}+{}", self.host, self.base_port, id),
                    "port out of range",
                )
            })?;
        Ok(format!("{}:{}", self.host, port))
    }

    pub fn socket_path(&self, id: u32) -> PathBuf {
        self.socket_dir.join(format!("msgbench_receiver_{}.sock", id))
    }
}

/// Transport factory for creating driver instances
#[derive(Clone)]
pub struct TransportFactory {
    kind: TransportKind,
    config: TransportConfig,
    broker: MemoryBroker,
    addressing: MemoryAddressing,
}

impl TransportFactory {
    pub fn new(kind: TransportKind, config: TransportConfig) -> Self {
        Self {
            kind,
            config,
            broker: MemoryBroker::new(),
            addressing: MemoryAddressing::PerTarget,
        }
    }

    /// Share an existing in-process broker between senders and receivers.
    pub fn with_broker(mut self, broker: MemoryBroker, addressing: MemoryAddressing) -> Self {
        self.broker = broker;
        self.addressing = addressing;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Create a new driver instance for the given role
    pub fn create(&self, role: DriverRole) -> Result<Box<dyn TransportDriver>, MessagingError> {
        match self.kind {
            TransportKind::Memory => Ok(Box::new(MemoryDriver::new(
                self.broker.clone(),
                role,
                self.addressing.clone(),
            ))),
            TransportKind::Tcp => Ok(Box::new(TcpSocketDriver::new(self.config.clone(), role))),
            #[cfg(unix)]
            TransportKind::UnixDomainSocket => Ok(Box::new(UnixDomainSocketDriver::new(
                self.config.clone(),
                role,
            ))),
            #[cfg(not(unix))]
            TransportKind::UnixDomainSocket => Err(MessagingError::Transport(
                "Unix domain sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// Driver factory for sender workers, one fresh driver per call.
    pub fn sender_factory(&self) -> impl DriverFactory + 'static {
        let factory = self.clone();
        move || factory.create(DriverRole::Sender)
    }
}
