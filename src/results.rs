use crate::benchmark::{BenchmarkConfig, ConcurrencyMode};
use crate::metrics::StatsSnapshot;
use crate::receiver::ReceiverSummary;
use crate::utils::{
    format_duration_ms, format_latency_ms, format_message_rate, print_table_row,
    print_table_separator,
};
use anyhow::{Context, Result};
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One benchmark run as written to the report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub service: String,
    pub language: String,
    pub transport: String,
    #[serde(rename = "async")]
    pub is_async: bool,
    /// Worker pool size; 1 for synchronous runs.
    pub workers: usize,
    pub wait_for_ack: bool,
    pub timeout_ms: u64,
    pub receivers: u32,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

impl BenchmarkResults {
    pub fn new(config: &BenchmarkConfig, stats: StatsSnapshot) -> Self {
        let (is_async, workers) = match config.concurrency {
            ConcurrencyMode::Sync => (false, 1),
            ConcurrencyMode::Async { workers } => (true, workers.get()),
        };
        Self {
            service: config.service.clone(),
            language: "Rust".to_string(),
            transport: config.transport.to_string(),
            is_async,
            workers,
            wait_for_ack: config.send_options.wait_for_ack,
            timeout_ms: config.send_options.timeout.as_millis() as u64,
            receivers: config.receivers,
            stats,
            timestamp: chrono::Utc::now(),
            system_info: SystemInfo::default(),
        }
    }

    /// Print a colorized human-readable summary to stdout.
    pub fn print_summary(&self) {
        let stats = &self.stats;
        let mode = if self.is_async {
            format!("async, {} workers", self.workers)
        } else {
            "sync".to_string()
        };

        println!();
        println!(
            "{}",
            format!("=== {} over {} ({}) ===", self.service, self.transport, mode)
                .bold()
                .cyan()
        );
        println!(
            "  Messages:    {} sent, {} received, {}",
            stats.total_sent,
            stats.total_received.to_string().green(),
            if stats.total_failed > 0 {
                format!("{} failed", stats.total_failed).red()
            } else {
                "0 failed".normal()
            }
        );
        println!("  Success:     {:.1}%", stats.success_rate() * 100.0);
        println!("  Duration:    {}", format_duration_ms(stats.duration_ms));
        println!("  Throughput:  {}", format_message_rate(stats.messages_per_ms));

        match &stats.message_timing_stats {
            Some(timing) => {
                println!(
                    "  Latency:     min {} / mean {} / median {} / max {}",
                    format_latency_ms(timing.min_ms),
                    format_latency_ms(timing.mean_ms),
                    format_latency_ms(timing.median_ms),
                    format_latency_ms(timing.max_ms)
                );
                if let Some(stdev) = timing.stdev_ms {
                    println!("  Std dev:     {}", format_latency_ms(stdev));
                }
                if !timing.percentiles.is_empty() {
                    let line = timing
                        .percentiles
                        .iter()
                        .map(|p| format!("P{} {}", p.percentile, format_latency_ms(p.value_ms)))
                        .collect::<Vec<_>>()
                        .join(" / ");
                    println!("  Percentiles: {}", line);
                }
            }
            None => println!("  Latency:     {}", "no samples".yellow()),
        }
        println!();
    }
}

/// Print per-receiver counts as a table.
pub fn print_receiver_table(summaries: &[ReceiverSummary]) {
    let widths = [10, 10, 8, 8];
    print_table_separator(&widths);
    print_table_row(&["Receiver", "Received", "Failed", "Ignored"], &widths);
    print_table_separator(&widths);
    for summary in summaries {
        let cells = [
            summary.receiver_id.to_string(),
            summary.received.to_string(),
            summary.failed.to_string(),
            summary.ignored.to_string(),
        ];
        let columns: Vec<&str> = cells.iter().map(String::as_str).collect();
        print_table_row(&columns, &widths);
    }
    print_table_separator(&widths);
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Appends results to a JSON-lines report file, one object per run.
pub struct ResultsManager {
    output_file: PathBuf,
    written: usize,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            written: 0,
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Number of results appended by this manager.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append(&mut self, results: &BenchmarkResults) -> Result<()> {
        let json = serde_json::to_string(results).context("Failed to serialize results")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_file)
            .with_context(|| format!("Failed to open report file {}", self.output_file.display()))?;
        writeln!(file, "{}", json)?;
        file.flush()?;

        self.written += 1;
        debug!("Appended result #{} to {:?}", self.written, self.output_file);
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }

    /// Read every result from a report file, skipping blank lines.
    pub fn load(path: &Path) -> Result<Vec<BenchmarkResults>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report file {}", path.display()))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid result on line {} of {}", number + 1, path.display()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MessagingStats;
    use crate::sender::SendOptions;
    use crate::transport::{TransportConfig, TransportKind};
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(concurrency: ConcurrencyMode) -> BenchmarkConfig {
        BenchmarkConfig {
            service: "memory".to_string(),
            transport: TransportKind::Memory,
            transport_config: TransportConfig::default(),
            concurrency,
            send_options: SendOptions {
                wait_for_ack: true,
                timeout: Duration::from_millis(250),
            },
            receivers: 4,
            percentiles: vec![50.0],
        }
    }

    fn snapshot() -> StatsSnapshot {
        let stats = MessagingStats::new();
        stats.set_duration(1000.0, 1010.0);
        for latency in [1.0, 2.0, 3.0] {
            stats.record(true, Some(latency));
        }
        stats.record(false, None);
        stats.snapshot()
    }

    #[test]
    fn test_results_from_config() {
        let workers = NonZeroUsize::new(16).unwrap();
        let results = BenchmarkResults::new(&config(ConcurrencyMode::Async { workers }), snapshot());

        assert_eq!(results.language, "Rust");
        assert_eq!(results.transport, "In-Memory Broker");
        assert!(results.is_async);
        assert_eq!(results.workers, 16);
        assert_eq!(results.timeout_ms, 250);
        assert_eq!(results.stats.total_sent, 4);
    }

    #[test]
    fn test_report_line_shape() {
        let results = BenchmarkResults::new(&config(ConcurrencyMode::Sync), snapshot());
        let value: serde_json::Value = serde_json::to_value(&results).unwrap();

        assert_eq!(value["async"], false);
        assert_eq!(value["total_sent"], 4);
        assert_eq!(value["total_failed"], 1);
        assert_eq!(value["duration_ms"], 10.0);
        assert_eq!(value["message_timing_stats"]["median_ms"], 2.0);
        assert_eq!(value["message_timing_stats"]["count"], 3);
        assert!(value["system_info"]["cpu_cores"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.txt");
        let mut manager = ResultsManager::new(&path);

        manager.append(&BenchmarkResults::new(&config(ConcurrencyMode::Sync), snapshot())).unwrap();
        manager.append(&BenchmarkResults::new(&config(ConcurrencyMode::Sync), snapshot())).unwrap();
        assert_eq!(manager.written(), 2);

        let loaded = ResultsManager::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].stats, loaded[0].stats);
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();

        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
        assert_eq!(info.benchmark_version, crate::VERSION);
    }
}
