//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the benchmark runner, the CLI and the statistics
//! code: wall-clock timestamps, human-readable formatting of latencies and
//! rates, parameter validation, and console table output.
//!
//! ## Usage Examples
//!
//! ```rust
//! use messaging_benchmark::utils::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_latency_ms(0.25), "250.00μs");
//! assert_eq!(format_message_rate(15.5), "15.50K msg/s");
//!
//! validate_workers(100)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current wall-clock time as fractional milliseconds since Unix epoch
///
/// Sub-millisecond precision matters here: run durations for small batches
/// are often only a few milliseconds long, and throughput is reported per
/// millisecond.
///
/// ## Error Handling
///
/// If the system time is before the Unix epoch (very rare), returns 0
/// to provide a safe fallback rather than panicking.
pub fn current_time_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// Format a latency given in milliseconds
///
/// Selects microseconds below one millisecond and seconds above one thousand
/// milliseconds.
///
/// ## Examples
///
/// ```rust
/// # use messaging_benchmark::utils::format_latency_ms;
/// assert_eq!(format_latency_ms(0.5), "500.00μs");
/// assert_eq!(format_latency_ms(12.5), "12.50ms");
/// assert_eq!(format_latency_ms(2500.0), "2.50s");
/// ```
pub fn format_latency_ms(ms: f64) -> String {
    if ms < 1.0 {
        format!("{:.2}μs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{:.2}ms", ms)
    } else {
        format!("{:.2}s", ms / 1000.0)
    }
}

/// Format a run duration given in milliseconds.
pub fn format_duration_ms(ms: f64) -> String {
    if ms < 1000.0 {
        format!("{:.2}ms", ms)
    } else if ms < 60_000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        let total_secs = (ms / 1000.0) as u64;
        format!("{}m{}s", total_secs / 60, total_secs % 60)
    }
}

/// Format message rate in a human-readable way
///
/// Takes the per-millisecond rate produced by the statistics snapshot and
/// displays it per second.
///
/// ## Examples
///
/// ```rust
/// # use messaging_benchmark::utils::format_message_rate;
/// assert_eq!(format_message_rate(0.75), "750 msg/s");
/// assert_eq!(format_message_rate(15.5), "15.50K msg/s");
/// assert_eq!(format_message_rate(2300.0), "2.30M msg/s");
/// ```
pub fn format_message_rate(messages_per_ms: f64) -> String {
    let messages_per_second = messages_per_ms * 1000.0;
    if messages_per_second < 1000.0 {
        format!("{:.0} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

/// Validate the size of the asynchronous worker pool (1..=4096).
pub fn validate_workers(workers: usize) -> Result<()> {
    if workers == 0 {
        anyhow::bail!("Worker count cannot be zero");
    }
    if workers > 4096 {
        anyhow::bail!("Worker count {} is too high (maximum 4096)", workers);
    }
    Ok(())
}

/// Validate a per-message acknowledgment timeout in milliseconds.
pub fn validate_timeout_ms(timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 {
        anyhow::bail!("Timeout must be at least 1ms");
    }
    if timeout_ms > 600_000 {
        anyhow::bail!("Timeout {}ms is too long (maximum 10 minutes)", timeout_ms);
    }
    Ok(())
}

/// Validate a base port so that `base_port + receivers - 1` still fits.
pub fn validate_port_range(base_port: u16, receivers: usize) -> Result<()> {
    if base_port == 0 {
        anyhow::bail!("Base port cannot be zero");
    }
    if base_port as usize + receivers.saturating_sub(1) > u16::MAX as usize {
        anyhow::bail!(
            "Base port {} leaves no room for {} receivers",
            base_port,
            receivers
        );
    }
    Ok(())
}

/// Get the number of CPU cores available
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Print a formatted table row
///
/// ```rust
/// # use messaging_benchmark::utils::{print_table_row, print_table_separator};
/// let widths = [10, 10, 10];
/// print_table_separator(&widths);
/// print_table_row(&["Receiver", "Acked", "Ignored"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a table separator
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}
