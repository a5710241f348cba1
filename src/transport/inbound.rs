//! Receiver-side connection handling for stream sockets.
//!
//! A listener accepts any number of sender connections. Each connection gets
//! a reader task that forwards complete frames into one channel; write halves
//! are kept by connection id so that the acknowledgment for a frame goes back
//! over the connection it arrived on.

use super::framing::{read_frame, write_frame_within, WRITE_TIMEOUT};
use super::ConnectionId;
use crate::error::MessagingError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Writers = Arc<Mutex<HashMap<ConnectionId, BoxedWriter>>>;

/// Source of accepted peer streams.
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Accept the next peer, returning its stream and a printable address.
    async fn accept_peer(&mut self) -> std::io::Result<(Self::Stream, String)>;
}

pub struct InboundConnections {
    frames_tx: mpsc::Sender<(ConnectionId, Vec<u8>)>,
    frames_rx: mpsc::Receiver<(ConnectionId, Vec<u8>)>,
    writers: Writers,
    next_connection_id: Arc<AtomicU64>,
    last_peer: Option<ConnectionId>,
    max_frame_size: usize,
    write_timeout: Duration,
    accept_task: Option<JoinHandle<()>>,
}

impl InboundConnections {
    pub fn new(max_frame_size: usize) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(1000);
        Self {
            frames_tx,
            frames_rx,
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            last_peer: None,
            max_frame_size,
            write_timeout: WRITE_TIMEOUT,
            accept_task: None,
        }
    }

    /// Bound on each reply write before the peer is dropped as stalled.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.is_some()
    }

    /// Start accepting peers in the background.
    pub fn start<A: Acceptor>(&mut self, mut acceptor: A) {
        let frames_tx = self.frames_tx.clone();
        let writers = self.writers.clone();
        let next_connection_id = self.next_connection_id.clone();
        let max_frame_size = self.max_frame_size;

        self.accept_task = Some(tokio::spawn(async move {
            // Dropping the set when this task is aborted aborts every handler.
            let mut handlers = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = acceptor.accept_peer() => match accepted {
                        Ok((stream, peer)) => {
                            let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                            debug!("Accepted connection {} from: {}", connection_id, peer);

                            let (reader, writer) = tokio::io::split(stream);
                            writers.lock().await.insert(connection_id, Box::new(writer));
                            handlers.spawn(handle_connection(
                                connection_id,
                                reader,
                                frames_tx.clone(),
                                writers.clone(),
                                max_frame_size,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            break;
                        }
                    },
                    Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                }
            }
            while handlers.join_next().await.is_some() {}
        }));
    }

    /// Wait up to `wait` for the next frame from any peer.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
        match timeout(wait, self.frames_rx.recv()).await {
            Ok(Some((connection_id, frame))) => {
                self.last_peer = Some(connection_id);
                Ok(Some(frame))
            }
            Ok(None) => Err(MessagingError::Transport(
                "inbound frame channel closed".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }

    /// Send a frame back to the peer that delivered the most recent frame.
    ///
    /// The write is bounded by the write timeout. The writer is taken out of
    /// the table while the frame is in flight and only put back once the
    /// whole frame is written, so a failed, timed out or cancelled reply drops
    /// the connection instead of leaving a partial frame on it.
    pub async fn reply(&mut self, bytes: &[u8]) -> Result<(), MessagingError> {
        let connection_id = self.last_peer.ok_or_else(|| {
            MessagingError::Transport("no peer has sent a message yet".to_string())
        })?;

        let mut writer = self
            .writers
            .lock()
            .await
            .remove(&connection_id)
            .ok_or_else(|| {
                MessagingError::Transport(format!("Connection {} not found", connection_id))
            })?;

        match write_frame_within(&mut writer, bytes, self.write_timeout).await {
            Ok(()) => {
                self.writers.lock().await.insert(connection_id, writer);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping connection {} after failed reply: {}", connection_id, e);
                Err(e)
            }
        }
    }

    pub async fn active_connections(&self) -> usize {
        self.writers.lock().await.len()
    }

    /// Stop accepting, drop every peer connection and discard queued frames.
    pub async fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.writers.lock().await.clear();
        while self.frames_rx.try_recv().is_ok() {}
        self.last_peer = None;
    }
}

async fn handle_connection<S>(
    connection_id: ConnectionId,
    mut reader: ReadHalf<S>,
    frames_tx: mpsc::Sender<(ConnectionId, Vec<u8>)>,
    writers: Writers,
    max_frame_size: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!("Handling connection {}", connection_id);

    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(frame) => {
                if frames_tx.send((connection_id, frame)).await.is_err() {
                    debug!("Frame receiver closed for connection {}", connection_id);
                    break;
                }
            }
            Err(e) => {
                debug!("Connection {} closed: {}", connection_id, e);
                break;
            }
        }
    }

    writers.lock().await.remove(&connection_id);
    debug!("Connection {} handler finished", connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::write_frame;
    use tokio::io::DuplexStream;

    /// Hands out pre-made in-memory streams, then waits forever.
    struct DuplexAcceptor {
        pending: mpsc::Receiver<DuplexStream>,
    }

    #[async_trait]
    impl Acceptor for DuplexAcceptor {
        type Stream = DuplexStream;

        async fn accept_peer(&mut self) -> std::io::Result<(DuplexStream, String)> {
            match self.pending.recv().await {
                Some(stream) => Ok((stream, "duplex".to_string())),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_reply_goes_to_sending_peer() {
        let (peers_tx, peers_rx) = mpsc::channel(4);
        let mut inbound = InboundConnections::new(1024);
        inbound.start(DuplexAcceptor { pending: peers_rx });
        assert!(inbound.is_listening());

        let (mut first, first_server) = tokio::io::duplex(1024);
        let (mut second, second_server) = tokio::io::duplex(1024);
        peers_tx.send(first_server).await.unwrap();
        peers_tx.send(second_server).await.unwrap();

        write_frame(&mut second, b"from second").await.unwrap();
        let frame = inbound.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.unwrap(), b"from second");
        inbound.reply(b"ack second").await.unwrap();
        assert_eq!(read_frame(&mut second, 1024).await.unwrap(), b"ack second");

        write_frame(&mut first, b"from first").await.unwrap();
        let frame = inbound.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.unwrap(), b"from first");
        inbound.reply(b"ack first").await.unwrap();
        assert_eq!(read_frame(&mut first, 1024).await.unwrap(), b"ack first");

        inbound.close().await;
        assert_eq!(inbound.active_connections().await, 0);
        assert!(!inbound.is_listening());
    }

    /// Connects one peer that sends a request and then never reads.
    async fn stalled_peer(inbound: &mut InboundConnections) -> DuplexStream {
        let (peers_tx, peers_rx) = mpsc::channel(1);
        inbound.start(DuplexAcceptor { pending: peers_rx });

        let (mut peer, server) = tokio::io::duplex(64);
        peers_tx.send(server).await.unwrap();
        write_frame(&mut peer, b"request").await.unwrap();
        let frame = inbound.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.unwrap(), b"request");
        assert_eq!(inbound.active_connections().await, 1);
        peer
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped_after_write_timeout() {
        let mut inbound =
            InboundConnections::new(1024).with_write_timeout(Duration::from_millis(50));
        let _peer = stalled_peer(&mut inbound).await;

        let err = inbound.reply(&[1u8; 1024]).await.unwrap_err();
        assert!(matches!(err, MessagingError::BackpressureTimeout));
        assert_eq!(inbound.active_connections().await, 0);

        let err = inbound.reply(b"again").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        inbound.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_reply_drops_the_connection() {
        let mut inbound = InboundConnections::new(1024);
        let _peer = stalled_peer(&mut inbound).await;

        let cancelled = timeout(Duration::from_millis(20), inbound.reply(&[1u8; 1024])).await;
        assert!(cancelled.is_err());

        // Half a frame may sit on that connection; it must not be reused.
        assert_eq!(inbound.active_connections().await, 0);
        assert!(inbound.reply(b"again").await.is_err());
        inbound.close().await;
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let (_peers_tx, peers_rx) = mpsc::channel(1);
        let mut inbound = InboundConnections::new(1024);
        inbound.start(DuplexAcceptor { pending: peers_rx });

        let frame = inbound.receive(Duration::from_millis(20)).await.unwrap();
        assert!(frame.is_none());
        assert!(inbound.reply(b"nobody").await.is_err());
        inbound.close().await;
    }
}
