//! # Messaging Statistics
//!
//! [`MessagingStats`] is the accumulator shared by every send task of a run.
//! Counters and the latency sample list live behind one mutex so that
//! `sent == received + failed` holds whenever a [`MessagingStats::record`]
//! call returns, no matter how many tasks record concurrently.
//!
//! Derived metrics are computed on demand by [`MessagingStats::snapshot`]:
//! exact min/max/mean/median and population standard deviation over the raw
//! samples, plus HDR histogram percentiles for tail analysis.

use crate::utils::current_time_ms;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Percentile value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ms: f64,
}

/// Latency distribution over successful sends, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    /// Population standard deviation; omitted for a single sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdev_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub percentiles: Vec<PercentileValue>,
}

/// Frozen view of a run's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_sent: u64,
    pub total_received: u64,
    pub total_failed: u64,
    pub duration_ms: f64,
    /// Successful messages per millisecond.
    pub messages_per_ms: f64,
    pub failed_per_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timing_stats: Option<TimingStats>,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.total_received as f64 / self.total_sent as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    sent_count: u64,
    received_count: u64,
    failed_count: u64,
    message_timings: Vec<f64>,
    start_time_ms: Option<f64>,
    end_time_ms: Option<f64>,
}

/// Thread-safe accumulator for one logical test run.
#[derive(Debug)]
pub struct MessagingStats {
    inner: Mutex<StatsInner>,
    percentiles: Vec<f64>,
}

impl Default for MessagingStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingStats {
    pub fn new() -> Self {
        Self::with_percentiles(crate::defaults::PERCENTILES.to_vec())
    }

    /// Create an accumulator that also reports the given latency percentiles.
    pub fn with_percentiles(percentiles: Vec<f64>) -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
            percentiles,
        }
    }

    /// Clear counters, samples and timing marks.
    pub fn reset(&self) {
        *self.inner.lock() = StatsInner::default();
    }

    /// Mark the start of the measured interval.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.start_time_ms = Some(current_time_ms());
        inner.end_time_ms = None;
    }

    /// Mark the end of the measured interval.
    pub fn finish(&self) {
        self.inner.lock().end_time_ms = Some(current_time_ms());
    }

    pub fn set_duration(&self, start_time_ms: f64, end_time_ms: f64) {
        let mut inner = self.inner.lock();
        inner.start_time_ms = Some(start_time_ms);
        inner.end_time_ms = Some(end_time_ms);
    }

    /// Record the outcome of one send attempt.
    ///
    /// Latency samples are kept only for successes with a positive value.
    pub fn record(&self, success: bool, latency_ms: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.sent_count += 1;
        if success {
            inner.received_count += 1;
            if let Some(latency) = latency_ms.filter(|l| *l > 0.0) {
                inner.message_timings.push(latency);
            }
        } else {
            inner.failed_count += 1;
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.inner.lock().sent_count
    }

    pub fn received_count(&self) -> u64 {
        self.inner.lock().received_count
    }

    pub fn failed_count(&self) -> u64 {
        self.inner.lock().failed_count
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().message_timings.len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // Copy out under the lock, compute outside it.
        let (sent, received, failed, timings, start, end) = {
            let inner = self.inner.lock();
            (
                inner.sent_count,
                inner.received_count,
                inner.failed_count,
                inner.message_timings.clone(),
                inner.start_time_ms,
                inner.end_time_ms,
            )
        };

        let duration_ms = match (start, end) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => 0.0,
        };
        let per_ms = |count: u64| {
            if duration_ms > 0.0 {
                count as f64 / duration_ms
            } else {
                0.0
            }
        };

        StatsSnapshot {
            total_sent: sent,
            total_received: received,
            total_failed: failed,
            duration_ms,
            messages_per_ms: per_ms(received),
            failed_per_ms: per_ms(failed),
            message_timing_stats: compute_timing_stats(timings, &self.percentiles),
        }
    }
}

fn compute_timing_stats(mut samples: Vec<f64>, percentiles: &[f64]) -> Option<TimingStats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);

    let count = samples.len();
    let mean = samples.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
        (samples[count / 2 - 1] + samples[count / 2]) / 2.0
    } else {
        samples[count / 2]
    };
    let stdev = if count >= 2 {
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count as f64;
        Some(variance.sqrt())
    } else {
        None
    };

    Some(TimingStats {
        count,
        min_ms: samples[0],
        max_ms: samples[count - 1],
        mean_ms: mean,
        median_ms: median,
        stdev_ms: stdev,
        percentiles: histogram_percentiles(&samples, percentiles),
    })
}

/// Percentiles at microsecond resolution with three significant figures.
fn histogram_percentiles(samples: &[f64], percentiles: &[f64]) -> Vec<PercentileValue> {
    if percentiles.is_empty() {
        return Vec::new();
    }
    let mut histogram = match Histogram::<u64>::new(3) {
        Ok(histogram) => histogram,
        Err(_) => return Vec::new(),
    };
    for sample in samples {
        histogram.saturating_record(((sample * 1000.0).round() as u64).max(1));
    }

    percentiles
        .iter()
        .map(|&p| PercentileValue {
            percentile: p,
            value_ms: histogram.value_at_percentile(p) as f64 / 1000.0,
        })
        .collect()
}
