use crate::benchmark::ConcurrencyMode;
use crate::sender::SendOptions;
use crate::transport::{TransportConfig, TransportKind};
use crate::utils::{validate_timeout_ms, validate_workers};
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Messaging Benchmark - request/acknowledge latency over pluggable transports
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Verbose output (debug-level logging)
    #[clap(short = 'v', long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Also write logs to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a batch of test records to receivers running elsewhere
    Send(SendArgs),

    /// Run one receiver until interrupted
    Receive(ReceiveArgs),

    /// Run a receiver fleet and a sender in this process
    Loopback(LoopbackArgs),

    /// Write a test data file
    GenerateData(GenerateDataArgs),
}

/// How the sender batch is executed
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SendMode {
    /// One request in flight at a time
    #[clap(name = "sync")]
    Sync,

    /// Bounded pool of concurrent workers
    #[clap(name = "async")]
    Async,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TransportArgs {
    /// Transport binding
    #[clap(long, value_enum, default_value_t = TransportKind::Tcp, help_heading = "Transport Options")]
    pub transport: TransportKind,

    /// Host address for TCP receivers
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "Transport Options")]
    pub host: String,

    /// Receiver k listens on base_port + k
    #[clap(long, default_value_t = crate::defaults::BASE_PORT, help_heading = "Transport Options")]
    pub base_port: u16,

    /// Directory holding Unix domain socket files
    #[clap(long, default_value = crate::defaults::SOCKET_DIR, help_heading = "Transport Options")]
    pub socket_dir: PathBuf,

    /// Socket send/receive buffer size in bytes
    #[clap(long, default_value_t = crate::defaults::BUFFER_SIZE, help_heading = "Transport Options")]
    pub buffer_size: usize,

    /// Connect timeout in milliseconds
    #[clap(long, default_value_t = crate::defaults::CONNECT_TIMEOUT_MS, help_heading = "Transport Options")]
    pub connect_timeout_ms: u64,
}

impl TransportArgs {
    pub fn to_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            base_port: self.base_port,
            socket_dir: self.socket_dir.clone(),
            buffer_size: self.buffer_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..TransportConfig::default()
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SenderArgs {
    /// Batch execution strategy
    #[clap(long, value_enum, default_value_t = SendMode::Sync, help_heading = "Sender Options")]
    pub mode: SendMode,

    /// Worker pool size for async mode
    #[clap(short = 'w', long, default_value_t = crate::defaults::ASYNC_WORKERS, help_heading = "Sender Options")]
    pub workers: usize,

    /// Per-message acknowledgment timeout in milliseconds
    #[clap(short = 't', long, default_value_t = crate::defaults::TIMEOUT_MS, help_heading = "Sender Options")]
    pub timeout_ms: u64,

    /// Do not wait for acknowledgments
    #[clap(long, default_value_t = false, help_heading = "Sender Options")]
    pub no_ack: bool,

    /// Report file; one JSON object is appended per run
    #[clap(short = 'o', long, default_value = crate::defaults::REPORT_FILE, help_heading = "Sender Options")]
    pub output: PathBuf,

    /// Latency percentiles to report
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::PERCENTILES.to_vec(), help_heading = "Sender Options")]
    pub percentiles: Vec<f64>,

    /// Service label recorded in the report (defaults to the transport name)
    #[clap(long, help_heading = "Sender Options")]
    pub service: Option<String>,
}

impl SenderArgs {
    pub fn concurrency(&self) -> Result<ConcurrencyMode> {
        match self.mode {
            SendMode::Sync => Ok(ConcurrencyMode::Sync),
            SendMode::Async => {
                validate_workers(self.workers)?;
                let workers = NonZeroUsize::new(self.workers).context("Worker count cannot be zero")?;
                Ok(ConcurrencyMode::Async { workers })
            }
        }
    }

    pub fn send_options(&self) -> Result<SendOptions> {
        validate_timeout_ms(self.timeout_ms)?;
        Ok(SendOptions {
            wait_for_ack: !self.no_ack,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }

    pub fn validate_percentiles(&self) -> Result<()> {
        for p in &self.percentiles {
            if !(*p > 0.0 && *p <= 100.0) {
                anyhow::bail!("Percentile {} must be in (0, 100]", p);
            }
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SendArgs {
    #[clap(flatten)]
    pub transport: TransportArgs,

    #[clap(flatten)]
    pub sender: SenderArgs,

    /// Test data file
    #[clap(short = 'd', long, default_value = crate::defaults::TEST_DATA_FILE)]
    pub data: PathBuf,

    /// Number of receivers the records are validated against
    #[clap(short = 'r', long, default_value_t = crate::defaults::RECEIVERS)]
    pub receivers: u32,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ReceiveArgs {
    #[clap(flatten)]
    pub transport: TransportArgs,

    /// Receiver id; only envelopes targeted at this id are acknowledged
    #[clap(long)]
    pub id: u32,

    /// Receive poll interval in milliseconds (bounds shutdown latency)
    #[clap(long, default_value_t = crate::defaults::POLL_INTERVAL_MS)]
    pub poll_ms: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LoopbackArgs {
    #[clap(flatten)]
    pub transport: TransportArgs,

    #[clap(flatten)]
    pub sender: SenderArgs,

    /// Number of in-process receivers
    #[clap(short = 'r', long, default_value_t = crate::defaults::RECEIVERS)]
    pub receivers: u32,

    /// Number of generated messages (ignored with --data)
    #[clap(short = 'n', long, default_value_t = crate::defaults::MESSAGE_COUNT)]
    pub messages: usize,

    /// Use records from this file instead of generating them
    #[clap(short = 'd', long)]
    pub data: Option<PathBuf>,

    /// Receive poll interval in milliseconds
    #[clap(long, default_value_t = crate::defaults::POLL_INTERVAL_MS)]
    pub poll_ms: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct GenerateDataArgs {
    /// Number of records
    #[clap(short = 'n', long, default_value_t = crate::defaults::MESSAGE_COUNT)]
    pub count: usize,

    /// Records are spread round-robin over this many receivers
    #[clap(short = 'r', long, default_value_t = crate::defaults::RECEIVERS)]
    pub receivers: u32,

    /// Output file
    #[clap(short = 'o', long, default_value = crate::defaults::TEST_DATA_FILE)]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_defaults() {
        let args = Args::try_parse_from(["messaging-benchmark", "send"]).unwrap();
        let Command::Send(send) = args.command else {
            panic!("expected send subcommand");
        };

        assert_eq!(send.transport.transport, TransportKind::Tcp);
        assert_eq!(send.transport.base_port, 5556);
        assert_eq!(send.sender.mode, SendMode::Sync);
        assert_eq!(send.sender.timeout_ms, 5000);
        assert_eq!(send.sender.percentiles, vec![50.0, 95.0, 99.0]);
        assert_eq!(send.data, PathBuf::from("test_data.json"));
        assert!(matches!(send.sender.concurrency().unwrap(), ConcurrencyMode::Sync));
        assert!(send.sender.send_options().unwrap().wait_for_ack);
    }

    #[test]
    fn test_loopback_async_flags() {
        let args = Args::try_parse_from([
            "messaging-benchmark",
            "-v",
            "loopback",
            "--transport",
            "memory",
            "--mode",
            "async",
            "--workers",
            "8",
            "--timeout-ms",
            "20",
            "--no-ack",
            "--percentiles",
            "90,99.9",
            "-r",
            "4",
            "-n",
            "100",
        ])
        .unwrap();
        assert!(args.verbose);

        let Command::Loopback(loopback) = args.command else {
            panic!("expected loopback subcommand");
        };
        assert_eq!(loopback.transport.transport, TransportKind::Memory);
        assert_eq!(loopback.receivers, 4);
        assert_eq!(loopback.messages, 100);
        assert_eq!(loopback.sender.percentiles, vec![90.0, 99.9]);

        match loopback.sender.concurrency().unwrap() {
            ConcurrencyMode::Async { workers } => assert_eq!(workers.get(), 8),
            other => panic!("unexpected mode {:?}", other),
        }
        let options = loopback.sender.send_options().unwrap();
        assert!(!options.wait_for_ack);
        assert_eq!(options.timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_sender_values_are_rejected() {
        let args = Args::try_parse_from([
            "messaging-benchmark",
            "send",
            "--mode",
            "async",
            "--workers",
            "0",
            "--timeout-ms",
            "0",
            "--percentiles",
            "0",
        ])
        .unwrap();
        let Command::Send(send) = args.command else {
            panic!("expected send subcommand");
        };
        assert!(send.sender.concurrency().is_err());
        assert!(send.sender.send_options().is_err());
        assert!(send.sender.validate_percentiles().is_err());
    }

    #[test]
    fn test_receive_requires_id() {
        assert!(Args::try_parse_from(["messaging-benchmark", "receive"]).is_err());

        let args =
            Args::try_parse_from(["messaging-benchmark", "receive", "--id", "3", "--transport", "uds"]).unwrap();
        let Command::Receive(receive) = args.command else {
            panic!("expected receive subcommand");
        };
        assert_eq!(receive.id, 3);
        assert_eq!(receive.poll_ms, 1000);
        assert_eq!(receive.transport.transport, TransportKind::UnixDomainSocket);
    }

    #[test]
    fn test_transport_args_to_config() {
        let args = Args::try_parse_from([
            "messaging-benchmark",
            "receive",
            "--id",
            "0",
            "--host",
            "0.0.0.0",
            "--base-port",
            "7000",
            "--connect-timeout-ms",
            "250",
        ])
        .unwrap();
        let Command::Receive(receive) = args.command else {
            panic!("expected receive subcommand");
        };
        let config = receive.transport.to_config();
        assert_eq!(config.tcp_endpoint(2).unwrap(), "0.0.0.0:7002");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_generate_data_defaults() {
        let args = Args::try_parse_from(["messaging-benchmark", "generate-data", "-n", "50"]).unwrap();
        let Command::GenerateData(generate) = args.command else {
            panic!("expected generate-data subcommand");
        };
        assert_eq!(generate.count, 50);
        assert_eq!(generate.receivers, 32);
    }
}
