use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stereo_rt::perf::MAX_OPEN_MEASUREMENTS;
use stereo_rt::{HistogramConfig, MeasurementHandle, PerformanceMonitor, RtError};

#[test]
fn misused_handles_leave_statistics_untouched() {
    let monitor = PerformanceMonitor::new();
    let handle = monitor.begin_measurement("capture");
    monitor
        .end_measurement("capture", handle, Some(Duration::from_secs(1)))
        .unwrap();
    let before = monitor.task_stats("capture").unwrap();

    let reused = monitor.end_measurement("capture", handle, None);
    assert!(matches!(reused, Err(RtError::MeasurementMisuse(_))));

    let forged = MeasurementHandle::unregistered(Instant::now());
    let err = monitor.end_measurement("capture", forged, None).unwrap_err();
    assert_eq!(err.code(), "MEASUREMENT_MISUSE");

    assert_eq!(monitor.task_stats("capture").unwrap(), before);
    assert_eq!(monitor.pending_measurements(), 0);
}

#[test]
fn handles_from_another_monitor_are_rejected() {
    let first = PerformanceMonitor::new();
    let second = PerformanceMonitor::new();
    let handle = first.begin_measurement("detect");
    let other = second.begin_measurement("detect");
    assert!(second.end_measurement("detect", handle, None).is_err());
    assert!(!second.has_task("detect"));
    assert!(first.end_measurement("detect", handle, None).is_ok());
    assert!(second.end_measurement("detect", other, None).is_ok());
}

#[test]
fn abandoned_handles_do_not_accumulate() {
    let monitor = PerformanceMonitor::new();
    for _ in 0..10_000 {
        let _ = monitor.begin_measurement("capture");
    }
    assert_eq!(monitor.pending_measurements(), MAX_OPEN_MEASUREMENTS);

    let handle = monitor.begin_measurement("capture");
    assert!(monitor.end_measurement("capture", handle, None).is_ok());
    assert_eq!(monitor.pending_measurements(), MAX_OPEN_MEASUREMENTS - 1);
    assert_eq!(monitor.task_stats("capture").unwrap().total_executions, 1);
}

#[test]
fn unknown_task_queries_fail() {
    let monitor = PerformanceMonitor::new();
    assert!(matches!(
        monitor.task_stats("nobody"),
        Err(RtError::UnknownTask(_))
    ));
    assert!(monitor.reset_statistics("nobody").is_err());
    assert!(monitor.execution_time_histogram("nobody").is_err());
}

#[test]
fn reset_only_touches_the_named_task() {
    let monitor = PerformanceMonitor::new();
    for ms in [1, 2, 3] {
        monitor.record("left", Duration::from_millis(ms), Some(Duration::from_millis(2)));
        monitor.record("right", Duration::from_millis(ms), None);
    }
    let right_before = monitor.task_stats("right").unwrap();

    monitor.reset_statistics("left").unwrap();
    let left = monitor.task_stats("left").unwrap();
    assert_eq!(left.total_executions, 0);
    assert_eq!(left.missed_deadlines, 0);
    assert_eq!(left.deadline_meet_rate, 1.0);
    assert!(monitor.execution_time_histogram("left").unwrap().is_empty());

    assert_eq!(monitor.task_stats("right").unwrap(), right_before);
}

#[test]
fn statistics_follow_recorded_samples() {
    let monitor = PerformanceMonitor::new();
    let deadline = Some(Duration::from_micros(2_500));
    for us in [1_000, 2_000, 3_000, 4_000] {
        monitor.record("preprocess", Duration::from_micros(us), deadline);
    }
    let stats = monitor.task_stats("preprocess").unwrap();
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.missed_deadlines, 2);
    assert_eq!(stats.deadline_meet_rate, 0.5);
    assert!((stats.average_execution_time_us - 2_500.0).abs() < 1e-6);
    assert!((stats.min_execution_time_us - 1_000.0).abs() < 1e-6);
    assert!((stats.max_execution_time_us - 4_000.0).abs() < 1e-6);
    assert!((stats.last_execution_time_us - 4_000.0).abs() < 1e-6);
    // sample standard deviation of 1, 2, 3, 4 ms
    assert!((stats.jitter_us - 1_290.994).abs() < 0.01);
}

#[test]
fn histogram_accounts_for_every_sample() {
    let monitor = PerformanceMonitor::with_histogram(HistogramConfig {
        bin_width: Duration::from_micros(100),
        max_bins: 10,
    });
    for us in [50, 150, 160, 999, 5_000] {
        monitor.record("monitor", Duration::from_micros(us), None);
    }
    let histogram = monitor.execution_time_histogram("monitor").unwrap();
    assert_eq!(histogram.bin_width_us, 100);
    assert_eq!(histogram.total(), 5);
    assert_eq!(histogram.bins.get(&0), Some(&1));
    assert_eq!(histogram.bins.get(&100), Some(&2));
    // 999us and 5ms both land in the last bin
    assert_eq!(histogram.bins.get(&900), Some(&2));
}

#[test]
fn concurrent_measurements_are_all_counted() {
    let monitor = Arc::new(PerformanceMonitor::new());
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let monitor = monitor.clone();
            thread::spawn(move || {
                let name = if i % 2 == 0 { "even" } else { "odd" };
                for _ in 0..250 {
                    let handle = monitor.begin_measurement(name);
                    monitor.end_measurement(name, handle, None).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let all = monitor.all_task_stats();
    assert_eq!(all["even"].total_executions, 500);
    assert_eq!(all["odd"].total_executions, 500);
    assert_eq!(
        monitor.execution_time_histogram("even").unwrap().total(),
        all["even"].total_executions
    );
    assert_eq!(monitor.pending_measurements(), 0);
}
