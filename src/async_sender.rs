//! Asynchronous send strategy.
//!
//! A fixed pool of workers, each with its own driver and [`UnifiedSender`],
//! drains a shared queue of messages. All workers record into one
//! [`MessagingStats`]; the batch ends when every worker has finished.

use crate::error::MessagingError;
use crate::metrics::{MessagingStats, StatsSnapshot};
use crate::sender::{OutboundMessage, SendOptions, UnifiedSender};
use crate::transport::DriverFactory;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub struct AsyncSenderPool {
    factory: Arc<dyn DriverFactory>,
    workers: NonZeroUsize,
    stats: Arc<MessagingStats>,
}

impl AsyncSenderPool {
    pub fn new(factory: Arc<dyn DriverFactory>, workers: NonZeroUsize) -> Self {
        Self {
            factory,
            workers,
            stats: Arc::new(MessagingStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<MessagingStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<MessagingStats> {
        &self.stats
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    /// Send every item with up to `workers` requests in flight.
    ///
    /// All workers connect before the clock starts; any connect failure
    /// aborts the batch.
    pub async fn run_batch(
        &self,
        items: Vec<OutboundMessage>,
        options: SendOptions,
    ) -> Result<StatsSnapshot, MessagingError> {
        self.stats.reset();
        let worker_count = self.workers.get().min(items.len()).max(1);

        let mut senders = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let connected = match self.factory.create() {
                Ok(driver) => {
                    let mut sender = UnifiedSender::with_stats(driver, self.stats.clone())
                        .asynchronous(true);
                    sender.connect().await.map(|()| sender)
                }
                Err(e) => Err(e),
            };
            match connected {
                Ok(sender) => senders.push(sender),
                Err(e) => {
                    error!("Sender worker failed to connect: {}", e);
                    for mut sender in senders {
                        sender.disconnect().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Sending {} messages asynchronously with {} workers (wait_for_ack={}, timeout={}ms)",
            items.len(),
            worker_count,
            options.wait_for_ack,
            options.timeout.as_millis()
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        self.stats.start();

        let mut tasks = JoinSet::new();
        for (worker_id, mut sender) in senders.into_iter().enumerate() {
            let queue = queue.clone();
            tasks.spawn(async move {
                let mut sent = 0usize;
                loop {
                    let next = queue.lock().pop_front();
                    let Some(message) = next else {
                        break;
                    };
                    sender.send(&message, &options).await;
                    sent += 1;
                }
                (worker_id, sent, sender)
            });
        }

        let mut finished = Vec::with_capacity(worker_count);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((worker_id, sent, sender)) => {
                    debug!("Sender worker {} finished after {} messages", worker_id, sent);
                    finished.push(sender);
                }
                Err(e) => error!("Sender worker task failed: {}", e),
            }
        }
        self.stats.finish();

        for mut sender in finished {
            sender.disconnect().await;
        }

        Ok(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{build_ack, MessageEnvelope};
    use crate::transport::TransportDriver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Replies with a valid ACK, or never replies when `silent`.
    struct LoopbackDriver {
        silent: bool,
        reply: Option<Vec<u8>>,
    }

    #[async_trait]
    impl TransportDriver for LoopbackDriver {
        async fn connect(&mut self) -> Result<(), MessagingError> {
            Ok(())
        }

        async fn send_raw(&mut self, bytes: &[u8], _target: u32) -> Result<(), MessagingError> {
            if !self.silent {
                let request = MessageEnvelope::from_bytes(bytes)?;
                assert!(request.is_async);
                self.reply = Some(build_ack(&request, "loop", "OK", 0.0).to_bytes());
            }
            Ok(())
        }

        async fn receive_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, MessagingError> {
            match self.reply.take() {
                Some(bytes) => Ok(Some(bytes)),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        }

        async fn disconnect(&mut self) {}

        fn name(&self) -> &'static str {
            "loopback"
        }
    }

    fn factory(silent: bool) -> Arc<dyn DriverFactory> {
        Arc::new(move || -> Result<Box<dyn TransportDriver>, MessagingError> {
            Ok(Box::new(LoopbackDriver {
                silent,
                reply: None,
            }))
        })
    }

    fn items(count: u32) -> Vec<OutboundMessage> {
        (0..count).map(|i| OutboundMessage::new(i % 4, vec![1, 2, 3])).collect()
    }

    #[tokio::test]
    async fn test_every_item_is_recorded_once() {
        let pool = AsyncSenderPool::new(factory(false), NonZeroUsize::new(4).unwrap());
        let snapshot = pool
            .run_batch(items(25), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(snapshot.total_sent, 25);
        assert_eq!(snapshot.total_received, 25);
        assert_eq!(snapshot.total_failed, 0);
    }

    #[tokio::test]
    async fn test_timeouts_overlap_across_workers() {
        let pool = AsyncSenderPool::new(factory(true), NonZeroUsize::new(8).unwrap());
        let options = SendOptions {
            wait_for_ack: true,
            timeout: Duration::from_millis(50),
        };

        let started = Instant::now();
        let snapshot = pool.run_batch(items(8), options).await.unwrap();

        assert_eq!(snapshot.total_failed, 8);
        assert!(started.elapsed() < Duration::from_millis(8 * 50));
    }

    #[tokio::test]
    async fn test_worker_count_is_capped_by_items() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory: Arc<dyn DriverFactory> =
            Arc::new(move || -> Result<Box<dyn TransportDriver>, MessagingError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(LoopbackDriver {
                    silent: false,
                    reply: None,
                }))
            });

        let pool = AsyncSenderPool::new(factory, NonZeroUsize::new(100).unwrap());
        pool.run_batch(items(3), SendOptions::default()).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let factory: Arc<dyn DriverFactory> =
            Arc::new(|| -> Result<Box<dyn TransportDriver>, MessagingError> {
                Err(MessagingError::connection("broker", "refused"))
            });
        let pool = AsyncSenderPool::new(factory, NonZeroUsize::new(2).unwrap());

        let err = pool.run_batch(items(4), SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, MessagingError::Connection { .. }));
        assert_eq!(pool.stats().sent_count(), 0);
    }
}
