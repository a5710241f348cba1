//! Sender-side stream connection.
//!
//! The read half of every pooled stream is owned by a background task that
//! keeps pulling frames off the socket, whether or not the sender waits for
//! them. Replies nobody is waiting for are dropped before the next request is
//! written, so a fire-and-forget sender never lets acknowledgments pile up in
//! the socket buffers and stall the receiver.

use super::framing::{read_frame, write_frame};
use crate::error::MessagingError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

type Reply = Result<Vec<u8>, MessagingError>;

pub struct OutboundStream<S> {
    writer: WriteHalf<S>,
    replies: mpsc::UnboundedReceiver<Reply>,
    reader: JoinHandle<()>,
}

impl<S> OutboundStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let (replies_tx, replies) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max_frame_size).await {
                    Ok(frame) => {
                        if replies_tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Outbound stream closed: {}", e);
                        let _ = replies_tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        Self {
            writer,
            replies,
            reader,
        }
    }

    /// Write one request frame after dropping any unread replies.
    ///
    /// A connection whose reader already failed is reported here, before any
    /// bytes are written.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), MessagingError> {
        let mut discarded = 0usize;
        loop {
            match self.replies.try_recv() {
                Ok(Ok(_)) => discarded += 1,
                Ok(Err(e)) => return Err(e),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(closed()),
            }
        }
        if discarded > 0 {
            trace!("Discarded {} unread replies", discarded);
        }

        write_frame(&mut self.writer, bytes).await
    }

    /// Wait up to `wait` for the next reply frame; `Ok(None)` on timeout.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
        match timeout(wait, self.replies.recv()).await {
            Ok(Some(reply)) => reply.map(Some),
            Ok(None) => Err(closed()),
            Err(_) => Ok(None),
        }
    }
}

impl<S> Drop for OutboundStream<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn closed() -> MessagingError {
    MessagingError::Transport("connection closed by receiver".to_string())
}
