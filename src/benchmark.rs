//! # Benchmark Orchestration
//!
//! Ties the core pieces into a runnable benchmark:
//!
//! - **BenchmarkConfig**: transport, execution strategy and per-message options
//!   for one run
//! - **BenchmarkRunner**: builds drivers through a [`TransportFactory`] and
//!   runs a batch with either the synchronous [`UnifiedSender`] or the
//!   asynchronous [`AsyncSenderPool`], producing [`BenchmarkResults`]
//! - **ReceiverFleet**: N [`UnifiedReceiver`] tasks in this process, used by
//!   the loopback command and the end-to-end tests
//!
//! The two execution strategies are selected here and nowhere else; both
//! drive the same `send` primitive and record into one aggregator.

use crate::async_sender::AsyncSenderPool;
use crate::cli::{SenderArgs, TransportArgs};
use crate::metrics::MessagingStats;
use crate::receiver::{ReceiverSummary, StopHandle, UnifiedReceiver};
use crate::results::BenchmarkResults;
use crate::sender::{OutboundMessage, SendOptions, UnifiedSender};
use crate::transport::{DriverRole, TransportConfig, TransportFactory, TransportKind};
use anyhow::{Context, Result};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Batch execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// One request in flight at a time.
    Sync,
    /// A fixed pool of `workers` concurrent senders.
    Async { workers: NonZeroUsize },
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMode::Sync => write!(f, "sync"),
            ConcurrencyMode::Async { workers } => write!(f, "async ({} workers)", workers),
        }
    }
}

/// Configuration for one benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Label written to the report
    pub service: String,
    pub transport: TransportKind,
    pub transport_config: TransportConfig,
    pub concurrency: ConcurrencyMode,
    pub send_options: SendOptions,
    /// Size of the receiver fleet the data is addressed to
    pub receivers: u32,
    pub percentiles: Vec<f64>,
}

impl BenchmarkConfig {
    pub fn from_args(transport: &TransportArgs, sender: &SenderArgs, receivers: u32) -> Result<Self> {
        sender.validate_percentiles()?;
        crate::utils::validate_port_range(transport.base_port, receivers as usize)?;

        Ok(Self {
            service: sender
                .service
                .clone()
                .unwrap_or_else(|| transport.transport.to_string()),
            transport: transport.transport,
            transport_config: transport.to_config(),
            concurrency: sender.concurrency()?,
            send_options: sender.send_options()?,
            receivers,
            percentiles: sender.percentiles.clone(),
        })
    }
}

impl fmt::Display for BenchmarkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----------------------------------------------------------------")?;
        writeln!(f, "Starting Benchmark for: {}", self.service)?;
        writeln!(f, "  Transport:          {}", self.transport)?;
        writeln!(f, "  Mode:               {}", self.concurrency)?;
        writeln!(f, "  Receivers:          {}", self.receivers)?;
        writeln!(f, "  Wait For ACK:       {}", self.send_options.wait_for_ack)?;
        writeln!(f, "  Timeout:            {}ms", self.send_options.timeout.as_millis())?;
        write!(f, "-----------------------------------------------------------------")
    }
}

pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    factory: TransportFactory,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Self {
        let factory = TransportFactory::new(config.transport, config.transport_config.clone());
        Self { config, factory }
    }

    /// Use a prepared factory, e.g. one sharing an in-process broker with a
    /// [`ReceiverFleet`].
    pub fn with_factory(config: BenchmarkConfig, factory: TransportFactory) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn factory(&self) -> &TransportFactory {
        &self.factory
    }

    /// Run one batch with the configured strategy.
    pub async fn run(&self, items: &[OutboundMessage]) -> Result<BenchmarkResults> {
        info!("\n{}", self.config);

        let stats = Arc::new(MessagingStats::with_percentiles(self.config.percentiles.clone()));
        let snapshot = match self.config.concurrency {
            ConcurrencyMode::Sync => {
                let driver = self
                    .factory
                    .create(DriverRole::Sender)
                    .context("Failed to create sender transport")?;
                let mut sender = UnifiedSender::with_stats(driver, stats);
                let outcome = sender.run_batch(items, &self.config.send_options).await;
                sender.disconnect().await;
                outcome.context("Sender failed to connect")?
            }
            ConcurrencyMode::Async { workers } => {
                let pool = AsyncSenderPool::new(Arc::new(self.factory.sender_factory()), workers)
                    .with_stats(stats);
                pool.run_batch(items.to_vec(), self.config.send_options)
                    .await
                    .context("Sender pool failed to connect")?
            }
        };

        info!(
            "Batch finished: {} sent, {} received, {} failed",
            snapshot.total_sent, snapshot.total_received, snapshot.total_failed
        );
        Ok(BenchmarkResults::new(&self.config, snapshot))
    }
}

/// Receivers `0..n` running as tasks in this process.
pub struct ReceiverFleet {
    stop_handles: Vec<StopHandle>,
    stats: Vec<Arc<MessagingStats>>,
    tasks: JoinSet<(u32, Result<ReceiverSummary, crate::error::MessagingError>)>,
}

impl ReceiverFleet {
    /// Connect every receiver, then start their loops. Each receiver is bound
    /// before this returns, so senders can start immediately.
    pub async fn spawn(
        factory: &TransportFactory,
        receivers: u32,
        poll_interval: Duration,
        verbose: bool,
    ) -> Result<Self> {
        let mut fleet = Self {
            stop_handles: Vec::with_capacity(receivers as usize),
            stats: Vec::with_capacity(receivers as usize),
            tasks: JoinSet::new(),
        };

        for receiver_id in 0..receivers {
            if let Err(e) = fleet
                .start_one(factory, receiver_id, poll_interval, verbose)
                .await
            {
                // Release whatever already started before reporting.
                let _ = fleet.shutdown().await;
                return Err(e);
            }
        }

        info!("Started {} receivers over {}", receivers, factory.kind());
        Ok(fleet)
    }

    async fn start_one(
        &mut self,
        factory: &TransportFactory,
        receiver_id: u32,
        poll_interval: Duration,
        verbose: bool,
    ) -> Result<()> {
        let driver = factory
            .create(DriverRole::Receiver { receiver_id })
            .with_context(|| format!("Failed to create transport for receiver {}", receiver_id))?;
        let mut receiver = UnifiedReceiver::new(receiver_id, driver).with_poll_interval(poll_interval);
        receiver
            .connect()
            .await
            .with_context(|| format!("Receiver {} failed to connect", receiver_id))?;

        self.stop_handles.push(receiver.stop_handle());
        self.stats.push(receiver.stats().clone());
        self.tasks
            .spawn(async move { (receiver_id, receiver.run(verbose).await) });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stop_handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stop_handles.is_empty()
    }

    pub fn stop_handles(&self) -> &[StopHandle] {
        &self.stop_handles
    }

    /// Messages accepted so far across the whole fleet.
    pub fn received(&self) -> u64 {
        self.stats.iter().map(|stats| stats.received_count()).sum()
    }

    /// Stop every receiver and wait for their loops to exit. Takes up to one
    /// poll interval.
    pub async fn shutdown(mut self) -> Result<Vec<ReceiverSummary>> {
        for handle in &self.stop_handles {
            handle.stop();
        }

        let mut summaries = Vec::with_capacity(self.stop_handles.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(summary))) => summaries.push(summary),
                Ok((receiver_id, Err(e))) => error!("Receiver {} failed: {}", receiver_id, e),
                Err(e) => error!("Receiver task failed: {}", e),
            }
        }
        summaries.sort_by_key(|summary| summary.receiver_id);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data::generate_test_data;
    use crate::transport::{MemoryAddressing, MemoryBroker};

    fn memory_config(concurrency: ConcurrencyMode, receivers: u32) -> BenchmarkConfig {
        BenchmarkConfig {
            service: "unit".to_string(),
            transport: TransportKind::Memory,
            transport_config: TransportConfig::default(),
            concurrency,
            send_options: SendOptions {
                wait_for_ack: true,
                timeout: Duration::from_millis(500),
            },
            receivers,
            percentiles: vec![50.0, 99.0],
        }
    }

    fn shared_factory() -> TransportFactory {
        TransportFactory::new(TransportKind::Memory, TransportConfig::default())
            .with_broker(MemoryBroker::new(), MemoryAddressing::PerTarget)
    }

    fn items(count: usize, receivers: u32) -> Vec<OutboundMessage> {
        generate_test_data(count, receivers)
            .iter()
            .map(|item| item.to_outbound())
            .collect()
    }

    #[tokio::test]
    async fn test_sync_run_against_fleet() {
        let factory = shared_factory();
        let fleet = ReceiverFleet::spawn(&factory, 4, Duration::from_millis(20), false)
            .await
            .unwrap();
        assert_eq!(fleet.len(), 4);

        let runner = BenchmarkRunner::with_factory(memory_config(ConcurrencyMode::Sync, 4), factory);
        let results = runner.run(&items(12, 4)).await.unwrap();
        assert_eq!(results.stats.total_received, 12);
        assert!(!results.is_async);

        let summaries = fleet.shutdown().await.unwrap();
        assert_eq!(summaries.len(), 4);
        assert!(summaries.iter().all(|s| s.received == 3 && s.ignored == 0));
    }

    #[tokio::test]
    async fn test_async_run_against_fleet() {
        let factory = shared_factory();
        let fleet = ReceiverFleet::spawn(&factory, 3, Duration::from_millis(20), false)
            .await
            .unwrap();

        let workers = NonZeroUsize::new(5).unwrap();
        let runner = BenchmarkRunner::with_factory(
            memory_config(ConcurrencyMode::Async { workers }, 3),
            factory,
        );
        let results = runner.run(&items(30, 3)).await.unwrap();
        assert_eq!(results.stats.total_sent, 30);
        assert_eq!(results.stats.total_failed, 0);
        assert!(results.is_async);
        assert_eq!(results.workers, 5);

        let total: u64 = fleet.shutdown().await.unwrap().iter().map(|s| s.received).sum();
        assert_eq!(total, 30);
    }

    #[tokio::test]
    async fn test_missing_receivers_fail_every_message() {
        let runner = BenchmarkRunner::with_factory(
            memory_config(ConcurrencyMode::Sync, 2),
            shared_factory(),
        );
        let results = runner.run(&items(4, 2)).await.unwrap();
        assert_eq!(results.stats.total_failed, 4);
        assert!(results.stats.message_timing_stats.is_none());
    }

    #[test]
    fn test_concurrency_mode_display() {
        assert_eq!(ConcurrencyMode::Sync.to_string(), "sync");
        let workers = NonZeroUsize::new(100).unwrap();
        assert_eq!(
            ConcurrencyMode::Async { workers }.to_string(),
            "async (100 workers)"
        );
    }
}
