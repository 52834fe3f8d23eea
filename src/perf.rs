//! Per-task timing statistics.
//!
//! `PerformanceMonitor` keeps an online summary per task name: counts,
//! running mean and variance (Welford), extrema, and a fixed-width
//! execution-time histogram. No sample history is retained.
//!
//! Measurements are bracketed by `begin_measurement` / `end_measurement`.
//! A handle is valid for exactly one `end_measurement` on the monitor that
//! issued it; anything else is reported as `RtError::MeasurementMisuse` and
//! leaves every task's statistics untouched. At most
//! `MAX_OPEN_MEASUREMENTS` handles stay open per monitor: opening one more
//! forgets the oldest, which then fails like any unknown handle.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{RtError, RtResult};

pub const DEFAULT_BIN_WIDTH_US: u64 = 100;
pub const DEFAULT_MAX_BINS: usize = 512;

pub const MAX_OPEN_MEASUREMENTS: usize = 1024;

/// Monitor ids are unique in the process, so a handle issued by one monitor
/// is never accepted by another.
static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Monitor id carried by handles that did not come from `begin_measurement`.
const UNREGISTERED_MONITOR: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistogramConfig {
    pub bin_width: Duration,
    /// Samples beyond the last bin are folded into it.
    pub max_bins: usize,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bin_width: Duration::from_micros(DEFAULT_BIN_WIDTH_US),
            max_bins: DEFAULT_MAX_BINS,
        }
    }
}

impl HistogramConfig {
    fn bin_width_us(&self) -> u64 {
        (self.bin_width.as_micros() as u64).max(1)
    }

    fn bin_for(&self, elapsed_us: u64) -> u64 {
        let width = self.bin_width_us();
        let last = self.max_bins.max(1) as u64 - 1;
        (elapsed_us / width).min(last) * width
    }
}

/// Opaque start timestamp. Carries no task name.
#[derive(Clone, Copy, Debug)]
pub struct MeasurementHandle {
    monitor: u64,
    seq: u64,
    start: Instant,
}

impl MeasurementHandle {
    /// A handle that no monitor issued. Ending it always fails.
    pub fn unregistered(start: Instant) -> Self {
        Self {
            monitor: UNREGISTERED_MONITOR,
            seq: 0,
            start,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeasurementSample {
    pub execution_time: Duration,
    pub deadline_missed: bool,
}

/// Immutable snapshot of one task's statistics. Times are microseconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskStats {
    pub name: String,
    pub total_executions: u64,
    pub missed_deadlines: u64,
    pub failed_executions: u64,
    pub overruns: u64,
    pub average_execution_time_us: f64,
    pub max_execution_time_us: f64,
    pub min_execution_time_us: f64,
    pub last_execution_time_us: f64,
    pub jitter_us: f64,
    pub deadline_meet_rate: f64,
    /// How late the task's thread woke past its scheduled release.
    pub average_wakeup_latency_us: f64,
    pub max_wakeup_latency_us: f64,
}

impl TaskStats {
    /// Statistics of a task that has not completed an iteration yet.
    pub fn empty(name: &str) -> Self {
        TaskAccumulator::default().snapshot(name)
    }
}

/// Ordered execution-time histogram. Keys are bin lower bounds in microseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub bin_width_us: u64,
    pub bins: BTreeMap<u64, u64>,
}

impl Histogram {
    pub fn total(&self) -> u64 {
        self.bins.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

#[derive(Default)]
struct TaskAccumulator {
    total: u64,
    missed: u64,
    failed: u64,
    overruns: u64,
    mean_us: f64,
    m2: f64,
    max_us: f64,
    min_us: f64,
    last_us: f64,
    histogram: BTreeMap<u64, u64>,
    wakeups: u64,
    wake_mean_us: f64,
    wake_max_us: f64,
}

impl TaskAccumulator {
    fn record(
        &mut self,
        elapsed: Duration,
        missed: bool,
        failed: bool,
        histogram: &HistogramConfig,
    ) {
        let elapsed_us = elapsed.as_nanos() as f64 / 1_000.0;

        self.total += 1;
        if missed {
            self.missed += 1;
        }
        if failed {
            self.failed += 1;
        }

        let delta = elapsed_us - self.mean_us;
        self.mean_us += delta / self.total as f64;
        self.m2 += delta * (elapsed_us - self.mean_us);

        if self.total == 1 || elapsed_us > self.max_us {
            self.max_us = elapsed_us;
        }
        if self.total == 1 || elapsed_us < self.min_us {
            self.min_us = elapsed_us;
        }
        self.last_us = elapsed_us;

        let bin = histogram.bin_for(elapsed.as_micros() as u64);
        *self.histogram.entry(bin).or_insert(0) += 1;
    }

    fn record_wakeup(&mut self, latency: Duration) {
        let latency_us = latency.as_nanos() as f64 / 1_000.0;
        self.wakeups += 1;
        self.wake_mean_us += (latency_us - self.wake_mean_us) / self.wakeups as f64;
        self.wake_max_us = self.wake_max_us.max(latency_us);
    }

    fn jitter_us(&self) -> f64 {
        if self.total < 2 {
            return 0.0;
        }
        (self.m2.max(0.0) / (self.total - 1) as f64).sqrt()
    }

    fn snapshot(&self, name: &str) -> TaskStats {
        let deadline_meet_rate = if self.total == 0 {
            1.0
        } else {
            1.0 - self.missed as f64 / self.total as f64
        };
        TaskStats {
            name: name.to_string(),
            total_executions: self.total,
            missed_deadlines: self.missed,
            failed_executions: self.failed,
            overruns: self.overruns,
            average_execution_time_us: self.mean_us,
            max_execution_time_us: self.max_us,
            min_execution_time_us: self.min_us,
            last_execution_time_us: self.last_us,
            jitter_us: self.jitter_us(),
            deadline_meet_rate,
            average_wakeup_latency_us: self.wake_mean_us,
            max_wakeup_latency_us: self.wake_max_us,
        }
    }
}

#[derive(Default)]
struct Ledger {
    tasks: HashMap<String, TaskAccumulator>,
    last_seq: u64,
    /// Sequence numbers of open handles. Issued in increasing order, so the
    /// first entry is always the oldest.
    open: BTreeSet<u64>,
}

/// Thread-safe statistics collector shared by every task of a scheduler.
pub struct PerformanceMonitor {
    id: u64,
    ledger: Mutex<Ledger>,
    histogram: HistogramConfig,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_histogram(HistogramConfig::default())
    }

    pub fn with_histogram(histogram: HistogramConfig) -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            ledger: Mutex::new(Ledger::default()),
            histogram,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin_measurement(&self, name: &str) -> MeasurementHandle {
        let mut ledger = self.ledger();
        ledger.last_seq += 1;
        let seq = ledger.last_seq;
        ledger.open.insert(seq);
        if ledger.open.len() > MAX_OPEN_MEASUREMENTS {
            if let Some(oldest) = ledger.open.pop_first() {
                log::debug!("measurement {} was never ended; forgetting it", oldest);
            }
        }
        log::trace!("measurement {} opened for {}", seq, name);
        MeasurementHandle {
            monitor: self.id,
            seq,
            start: Instant::now(),
        }
    }

    /// Close a measurement and fold it into `name`'s statistics.
    ///
    /// The deadline, when given, decides whether the sample counts as a miss.
    pub fn end_measurement(
        &self,
        name: &str,
        handle: MeasurementHandle,
        deadline: Option<Duration>,
    ) -> RtResult<MeasurementSample> {
        self.end_measurement_with(name, handle, deadline, false)
    }

    /// `end_measurement` for an iteration whose outcome is already known.
    /// A failed iteration still contributes its execution time.
    pub fn end_measurement_with(
        &self,
        name: &str,
        handle: MeasurementHandle,
        deadline: Option<Duration>,
        failed: bool,
    ) -> RtResult<MeasurementSample> {
        let elapsed = handle.start.elapsed();
        let mut ledger = self.ledger();
        if handle.monitor != self.id || !ledger.open.remove(&handle.seq) {
            return Err(RtError::MeasurementMisuse(format!(
                "measurement for '{}' was never started, already ended or expired",
                name
            )));
        }
        Ok(record_locked(
            &mut ledger,
            &self.histogram,
            name,
            elapsed,
            deadline,
            failed,
        ))
    }

    /// Fold an externally timed sample into `name`'s statistics.
    pub fn record(
        &self,
        name: &str,
        elapsed: Duration,
        deadline: Option<Duration>,
    ) -> MeasurementSample {
        let mut ledger = self.ledger();
        record_locked(&mut ledger, &self.histogram, name, elapsed, deadline, false)
    }

    pub fn record_wakeup(&self, name: &str, latency: Duration) {
        let mut ledger = self.ledger();
        ledger
            .tasks
            .entry(name.to_string())
            .or_default()
            .record_wakeup(latency);
    }

    /// Count periods skipped because an iteration of `name` overran.
    pub fn record_overruns(&self, name: &str, periods: u64) {
        if periods == 0 {
            return;
        }
        let mut ledger = self.ledger();
        ledger.tasks.entry(name.to_string()).or_default().overruns += periods;
    }

    pub fn task_stats(&self, name: &str) -> RtResult<TaskStats> {
        self.ledger()
            .tasks
            .get(name)
            .map(|acc| acc.snapshot(name))
            .ok_or_else(|| unknown_task(name))
    }

    pub fn all_task_stats(&self) -> BTreeMap<String, TaskStats> {
        self.ledger()
            .tasks
            .iter()
            .map(|(name, acc)| (name.clone(), acc.snapshot(name)))
            .collect()
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.ledger().tasks.contains_key(name)
    }

    /// Zero `name`'s counters in place. The task stays known.
    pub fn reset_statistics(&self, name: &str) -> RtResult<()> {
        let mut ledger = self.ledger();
        let acc = ledger
            .tasks
            .get_mut(name)
            .ok_or_else(|| unknown_task(name))?;
        *acc = TaskAccumulator::default();
        Ok(())
    }

    pub fn execution_time_histogram(&self, name: &str) -> RtResult<Histogram> {
        let ledger = self.ledger();
        let acc = ledger.tasks.get(name).ok_or_else(|| unknown_task(name))?;
        Ok(Histogram {
            bin_width_us: self.histogram.bin_width_us(),
            bins: acc.histogram.clone(),
        })
    }

    /// Handles issued but not yet ended or expired.
    pub fn pending_measurements(&self) -> usize {
        self.ledger().open.len()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn record_locked(
    ledger: &mut Ledger,
    histogram: &HistogramConfig,
    name: &str,
    elapsed: Duration,
    deadline: Option<Duration>,
    failed: bool,
) -> MeasurementSample {
    let deadline_missed = deadline.is_some_and(|deadline| elapsed > deadline);
    ledger
        .tasks
        .entry(name.to_string())
        .or_default()
        .record(elapsed, deadline_missed, failed, histogram);
    MeasurementSample {
        execution_time: elapsed,
        deadline_missed,
    }
}

fn unknown_task(name: &str) -> RtError {
    RtError::UnknownTask(format!("no measurements recorded for '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn constant_workload_has_zero_jitter() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..20 {
            monitor.record("steady", ms(3), None);
        }
        let stats = monitor.task_stats("steady").unwrap();
        assert_eq!(stats.total_executions, 20);
        assert_eq!(stats.jitter_us, 0.0);
        assert_eq!(stats.average_execution_time_us, 3000.0);
        assert_eq!(stats.max_execution_time_us, 3000.0);
        assert_eq!(stats.min_execution_time_us, 3000.0);
    }

    #[test]
    fn varying_workload_has_positive_jitter() {
        let monitor = PerformanceMonitor::new();
        for i in 0..10 {
            monitor.record("varying", ms(1 + i % 3), None);
        }
        let stats = monitor.task_stats("varying").unwrap();
        assert!(stats.jitter_us > 0.0);
        assert_eq!(stats.max_execution_time_us, 3000.0);
        assert_eq!(stats.min_execution_time_us, 1000.0);
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let monitor = PerformanceMonitor::new();
        for v in [1, 2, 3, 4, 5] {
            monitor.record("mean", ms(v), None);
        }
        let stats = monitor.task_stats("mean").unwrap();
        assert!((stats.average_execution_time_us - 3000.0).abs() < 1e-6);
        // sample std dev of 1..=5 ms is sqrt(2.5) ms
        assert!((stats.jitter_us - 2.5f64.sqrt() * 1000.0).abs() < 1e-6);
    }

    #[test]
    fn deadline_outcomes_drive_meet_rate() {
        let monitor = PerformanceMonitor::new();
        monitor.record("dl", ms(2), Some(ms(1)));
        monitor.record("dl", ms(1), Some(ms(1)));
        monitor.record("dl", ms(5), None);
        monitor.record("dl", ms(3), Some(ms(1)));
        let stats = monitor.task_stats("dl").unwrap();
        assert_eq!(stats.missed_deadlines, 2);
        assert_eq!(stats.deadline_meet_rate, 0.5);
    }

    #[test]
    fn meet_rate_is_one_without_executions() {
        let monitor = PerformanceMonitor::new();
        monitor.record_overruns("idle", 2);
        let stats = monitor.task_stats("idle").unwrap();
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.overruns, 2);
        assert_eq!(stats.deadline_meet_rate, 1.0);
    }

    #[test]
    fn handle_is_single_use() {
        let monitor = PerformanceMonitor::new();
        let handle = monitor.begin_measurement("once");
        monitor.end_measurement("once", handle, None).unwrap();
        let err = monitor.end_measurement("once", handle, None).unwrap_err();
        assert!(matches!(err, RtError::MeasurementMisuse(_)));
        assert_eq!(monitor.task_stats("once").unwrap().total_executions, 1);
        assert_eq!(monitor.pending_measurements(), 0);
    }

    #[test]
    fn handle_from_other_monitor_is_rejected() {
        let a = PerformanceMonitor::new();
        let b = PerformanceMonitor::new();
        let handle = a.begin_measurement("x");
        assert!(b.end_measurement("x", handle, None).is_err());
        assert!(!b.has_task("x"));
        assert!(a.end_measurement("x", handle, None).is_ok());
    }

    #[test]
    fn failed_iteration_lands_with_its_sample() {
        let monitor = PerformanceMonitor::new();
        let handle = monitor.begin_measurement("f");
        monitor
            .end_measurement_with("f", handle, Some(ms(1)), true)
            .unwrap();
        let stats = monitor.task_stats("f").unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.failed_executions, 1);
    }

    #[test]
    fn oldest_open_handle_expires_first() {
        let monitor = PerformanceMonitor::new();
        let oldest = monitor.begin_measurement("w");
        let kept = monitor.begin_measurement("w");
        for _ in 0..MAX_OPEN_MEASUREMENTS - 1 {
            let _ = monitor.begin_measurement("w");
        }
        assert_eq!(monitor.pending_measurements(), MAX_OPEN_MEASUREMENTS);
        assert!(matches!(
            monitor.end_measurement("w", oldest, None),
            Err(RtError::MeasurementMisuse(_))
        ));
        assert!(monitor.end_measurement("w", kept, None).is_ok());
    }

    #[test]
    fn wakeup_latency_tracks_mean_and_max() {
        let monitor = PerformanceMonitor::new();
        monitor.record_wakeup("w", Duration::from_micros(100));
        monitor.record_wakeup("w", Duration::from_micros(300));
        let stats = monitor.task_stats("w").unwrap();
        assert_eq!(stats.total_executions, 0);
        assert!((stats.average_wakeup_latency_us - 200.0).abs() < 1e-6);
        assert_eq!(stats.max_wakeup_latency_us, 300.0);
    }

    #[test]
    fn histogram_bins_fold_overflow_into_last_bin() {
        let monitor = PerformanceMonitor::with_histogram(HistogramConfig {
            bin_width: Duration::from_micros(500),
            max_bins: 4,
        });
        monitor.record("h", Duration::from_micros(100), None);
        monitor.record("h", Duration::from_micros(700), None);
        monitor.record("h", Duration::from_micros(999), None);
        monitor.record("h", ms(50), None);
        let hist = monitor.execution_time_histogram("h").unwrap();
        assert_eq!(hist.bin_width_us, 500);
        assert_eq!(hist.bins.get(&0), Some(&1));
        assert_eq!(hist.bins.get(&500), Some(&2));
        assert_eq!(hist.bins.get(&1500), Some(&1));
        assert_eq!(hist.total(), 4);
    }

    #[test]
    fn reset_clears_histogram_and_keeps_task_known() {
        let monitor = PerformanceMonitor::new();
        monitor.record("r", ms(1), Some(Duration::from_micros(10)));
        monitor.record_overruns("r", 3);
        monitor.reset_statistics("r").unwrap();
        assert!(monitor.has_task("r"));
        let stats = monitor.task_stats("r").unwrap();
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.missed_deadlines, 0);
        assert_eq!(stats.overruns, 0);
        assert_eq!(stats.average_execution_time_us, 0.0);
        assert!(monitor.execution_time_histogram("r").unwrap().is_empty());
    }

    #[test]
    fn unknown_names_are_reported() {
        let monitor = PerformanceMonitor::new();
        assert!(matches!(
            monitor.task_stats("ghost"),
            Err(RtError::UnknownTask(_))
        ));
        assert!(monitor.reset_statistics("ghost").is_err());
        assert!(monitor.execution_time_histogram("ghost").is_err());
        assert!(!monitor.has_task("ghost"));
    }
}
