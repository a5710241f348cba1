//! # Messaging Benchmark Library
//!
//! A transport-agnostic core for request/acknowledge messaging benchmarks.
//! Every transport carries the same [`MessageEnvelope`]; senders correlate
//! each reply to its request through an embedded acknowledgment, and all
//! outcomes land in one thread-safe statistics aggregator.
//!
//! ## Architecture Overview
//!
//! - `envelope`: the envelope, acknowledgment and data-message types with a
//!   protobuf-compatible binary codec and a lenient debug JSON codec
//! - `transport`: the [`TransportDriver`] trait plus in-memory, TCP and Unix
//!   domain socket drivers
//! - `sender` / `async_sender`: the per-message state machine and the
//!   synchronous and bounded-concurrency batch strategies
//! - `receiver`: the receive/acknowledge loop with targeted routing
//! - `metrics`: the statistics aggregator and its snapshots
//! - `benchmark`, `results`, `test_data`: orchestration, reporting and
//!   benchmark input
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use messaging_benchmark::transport::{DriverRole, TransportConfig, TransportFactory, TransportKind};
//! use messaging_benchmark::{OutboundMessage, SendOptions, UnifiedSender};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let factory = TransportFactory::new(TransportKind::Tcp, TransportConfig::default());
//!     let mut sender = UnifiedSender::new(factory.create(DriverRole::Sender)?);
//!
//!     let items = vec![OutboundMessage::new(0, b"hello".to_vec())];
//!     let stats = sender.run_batch(&items, &SendOptions::default()).await?;
//!
//!     println!("{} of {} acknowledged", stats.total_received, stats.total_sent);
//!     Ok(())
//! }
//! ```

/// Batch orchestration and the in-process receiver fleet
pub mod benchmark;

/// Command-line interface and configuration
pub mod cli;

pub mod async_sender;
pub mod envelope;
pub mod error;
pub mod logging;

/// Statistics aggregation
///
/// Counters and latency samples behind one lock, with snapshots carrying
/// min/max/mean/median, population standard deviation and percentiles.
pub mod metrics;

pub mod receiver;

/// Report object and JSON-lines report file handling
pub mod results;

pub mod sender;
pub mod test_data;

/// Transport driver trait and concrete bindings
pub mod transport;

pub mod utils;

pub use async_sender::AsyncSenderPool;
pub use benchmark::{BenchmarkConfig, BenchmarkRunner, ConcurrencyMode, ReceiverFleet};
pub use envelope::{
    build_ack, is_valid_ack, Acknowledgment, DataMessage, MessageEnvelope, MessageType,
    QosLevel, RoutingMode,
};
pub use error::MessagingError;
pub use metrics::{MessagingStats, StatsSnapshot, TimingStats};
pub use receiver::{ReceiverSummary, StopHandle, UnifiedReceiver};
pub use results::{BenchmarkResults, ResultsManager};
pub use sender::{OutboundMessage, SendErrorKind, SendOptions, SendResult, UnifiedSender};
pub use transport::{TransportDriver, TransportFactory, TransportKind};

/// The current version of the messaging benchmark
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Host TCP receivers bind to and senders connect to
    pub const HOST: &str = "127.0.0.1";

    /// Receiver `k` listens on `BASE_PORT + k`
    pub const BASE_PORT: u16 = 5556;

    /// Directory for Unix domain socket files
    pub const SOCKET_DIR: &str = "/tmp";

    /// Socket send and receive buffer size in bytes
    pub const BUFFER_SIZE: usize = 8192;

    pub const CONNECT_TIMEOUT_MS: u64 = 2000;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(CONNECT_TIMEOUT_MS);

    /// Per-message acknowledgment timeout
    pub const TIMEOUT_MS: u64 = 5000;

    /// How long a receiver waits per poll; also its worst-case stop latency
    pub const POLL_INTERVAL_MS: u64 = 1000;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(POLL_INTERVAL_MS);

    /// Worker pool size of the asynchronous strategy
    pub const ASYNC_WORKERS: usize = 100;

    /// Receivers in a full fleet
    pub const RECEIVERS: u32 = 32;

    /// Records generated when no count is given
    pub const MESSAGE_COUNT: usize = 10;

    /// JSON-lines report file
    pub const REPORT_FILE: &str = "report.txt";

    pub const TEST_DATA_FILE: &str = "test_data.json";

    /// Latency percentiles reported by default
    pub const PERCENTILES: [f64; 3] = [50.0, 95.0, 99.0];
}
