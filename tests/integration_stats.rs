use messaging_benchmark::MessagingStats;
use std::sync::Arc;

/// Every record lands exactly once no matter how many tasks write at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_records_are_not_lost() {
    let stats = Arc::new(MessagingStats::new());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..1000 {
        let stats = stats.clone();
        tasks.spawn(async move { stats.record(true, Some(1.0)) });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    assert_eq!(stats.sent_count(), 1000);
    assert_eq!(stats.received_count(), 1000);
    assert_eq!(stats.failed_count(), 0);
    assert_eq!(stats.sample_count(), 1000);

    let timing = stats.snapshot().message_timing_stats.unwrap();
    assert_eq!(timing.mean_ms, 1.0);
    assert_eq!(timing.stdev_ms, Some(0.0));
}

#[test]
fn counts_stay_consistent_for_mixed_outcomes() {
    let stats = MessagingStats::new();
    let outcomes = [true, false, true, true, false, false, true];
    for (i, success) in outcomes.iter().enumerate() {
        stats.record(*success, Some(i as f64 + 0.5));

        let recorded = i as u64 + 1;
        assert_eq!(stats.sent_count(), recorded);
        assert_eq!(stats.received_count() + stats.failed_count(), recorded);
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_received, 4);
    assert_eq!(snapshot.total_failed, 3);
    // Failures never contribute latency samples.
    assert_eq!(snapshot.message_timing_stats.unwrap().count, 4);
}

#[test]
fn median_and_population_stdev() {
    let stats = MessagingStats::new();
    for latency in [4.0, 1.0, 3.0, 2.0] {
        stats.record(true, Some(latency));
    }
    let timing = stats.snapshot().message_timing_stats.unwrap();
    assert_eq!(timing.median_ms, 2.5);
    assert!((timing.stdev_ms.unwrap() - 1.25_f64.sqrt()).abs() < 1e-9);

    let single = MessagingStats::new();
    single.record(true, Some(5.0));
    let timing = single.snapshot().message_timing_stats.unwrap();
    assert_eq!(timing.median_ms, 5.0);
    assert!(timing.stdev_ms.is_none());
}
