//! Periodic task scheduler.
//!
//! Each task gets its own `PeriodicContext`. Per release the task:
//! 1. waits for the next period (the only suspension point the scheduler owns),
//! 2. runs its work item inside a measurement,
//! 3. reports the elapsed time and deadline outcome to the shared
//!    `PerformanceMonitor`,
//! 4. on a miss, logs it and invokes the deadline callback.
//!
//! Work item failures and panics are caught at the iteration boundary,
//! logged, counted, and never end the task.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::context::{ContextAttributes, PeriodicContext, PeriodicTimer, RealtimePolicy, StopSignal};
use crate::error::{resource_err, RtResult};
use crate::perf::{PerformanceMonitor, TaskStats};
use crate::task::{validate_task_set, TaskConfig, TaskSpec, WorkFn};

/// Extra time granted to a task on top of two periods before `stop` detaches it.
const JOIN_GRACE: Duration = Duration::from_millis(250);

pub type DeadlineCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

type WorkSlot = Arc<Mutex<Option<WorkFn>>>;

struct TaskSlot {
    spec: TaskSpec,
    work: WorkSlot,
}

pub struct Scheduler {
    slots: Vec<TaskSlot>,
    contexts: Vec<(PeriodicContext, Duration)>,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    monitor: Arc<PerformanceMonitor>,
    deadline_callback: Arc<RwLock<Option<DeadlineCallback>>>,
    policy: RealtimePolicy,
}

impl Scheduler {
    pub fn new(tasks: Vec<TaskConfig>) -> RtResult<Self> {
        Self::with_policy(tasks, RealtimePolicy::default())
    }

    pub fn with_policy(tasks: Vec<TaskConfig>, policy: RealtimePolicy) -> RtResult<Self> {
        Self::with_monitor(tasks, policy, Arc::new(PerformanceMonitor::new()))
    }

    pub fn with_monitor(
        tasks: Vec<TaskConfig>,
        policy: RealtimePolicy,
        monitor: Arc<PerformanceMonitor>,
    ) -> RtResult<Self> {
        validate_task_set(&tasks)?;
        let slots = tasks
            .into_iter()
            .map(|task| TaskSlot {
                spec: task.spec,
                work: Arc::new(Mutex::new(task.work)),
            })
            .collect();
        Ok(Self {
            slots,
            contexts: Vec::new(),
            stop: StopSignal::new(),
            running: Arc::new(AtomicBool::new(false)),
            monitor,
            deadline_callback: Arc::new(RwLock::new(None)),
            policy,
        })
    }

    /// Launch one context per task. Starting a running scheduler is a no-op.
    ///
    /// If any context cannot be created or cannot get its affinity/priority
    /// under `RealtimePolicy::Strict`, every context already launched is
    /// stopped and joined before the error is returned.
    pub fn start(&mut self) -> RtResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stop = StopSignal::new();
        let mut contexts = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let launched = if lock_slot(&slot.work).is_none() {
                Err(resource_err(format!(
                    "task '{}': work item was lost by an earlier run",
                    slot.spec.name
                )))
            } else {
                let runner = TaskRunner {
                    spec: slot.spec.clone(),
                    work: slot.work.clone(),
                    monitor: self.monitor.clone(),
                    callback: self.deadline_callback.clone(),
                    stop: stop.clone(),
                };
                let attrs = ContextAttributes {
                    name: slot.spec.name.clone(),
                    priority: slot.spec.priority,
                    core: slot.spec.core,
                    policy: self.policy,
                };
                PeriodicContext::spawn(attrs, move || runner.run())
            };

            match launched {
                Ok(ctx) => contexts.push((ctx, join_timeout(&slot.spec))),
                Err(err) => {
                    log::error!("scheduler start aborted: {}", err);
                    stop.request();
                    join_all(contexts);
                    return Err(err);
                }
            }
        }

        self.stop = stop;
        self.contexts = contexts;
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "scheduler started {} tasks ({:?} policy)",
            self.slots.len(),
            self.policy
        );
        Ok(())
    }

    /// Ask every task to exit at its next period boundary and join them.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && self.contexts.is_empty() {
            return;
        }
        self.stop.request();
        join_all(std::mem::take(&mut self.contexts));
        log::info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of every task's statistics, in declaration order.
    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.slots
            .iter()
            .map(|slot| {
                self.monitor
                    .task_stats(&slot.spec.name)
                    .unwrap_or_else(|_| TaskStats::empty(&slot.spec.name))
            })
            .collect()
    }

    /// Replace the handler invoked with the task name on every deadline miss.
    pub fn set_deadline_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut guard = self
            .deadline_callback
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *guard = Some(Arc::new(callback));
    }

    /// Stop invoking any deadline handler. Misses are still recorded.
    pub fn clear_deadline_callback(&self) {
        let mut guard = self
            .deadline_callback
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn policy(&self) -> RealtimePolicy {
        self.policy
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_timeout(spec: &TaskSpec) -> Duration {
    spec.period * 2 + JOIN_GRACE
}

fn join_all(contexts: Vec<(PeriodicContext, Duration)>) {
    for (ctx, timeout) in contexts {
        if let Err(err) = ctx.join(timeout) {
            log::error!("{}", err);
        }
    }
}

fn lock_slot(slot: &WorkSlot) -> MutexGuard<'_, Option<WorkFn>> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

/// Holds a task's work item while its context runs and returns it to the
/// slot on exit, so a stopped scheduler can be started again.
struct WorkLease {
    slot: WorkSlot,
    work: Option<WorkFn>,
}

impl Drop for WorkLease {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            *lock_slot(&self.slot) = Some(work);
        }
    }
}

struct TaskRunner {
    spec: TaskSpec,
    work: WorkSlot,
    monitor: Arc<PerformanceMonitor>,
    callback: Arc<RwLock<Option<DeadlineCallback>>>,
    stop: StopSignal,
}

impl TaskRunner {
    fn run(self) {
        let Some(work) = lock_slot(&self.work).take() else {
            log::error!("task '{}' has no work item; not running", self.spec.name);
            return;
        };
        let mut lease = WorkLease {
            slot: self.work.clone(),
            work: Some(work),
        };

        log::info!(
            "task '{}' started (period {:?}, deadline {:?}, priority {}, core {})",
            self.spec.name,
            self.spec.period,
            self.spec.deadline,
            self.spec.priority,
            self.spec.core
        );

        let mut timer = PeriodicTimer::start_now(self.spec.period);
        while let Some(tick) = timer.wait_next_period(&self.stop) {
            self.monitor
                .record_wakeup(&self.spec.name, tick.wakeup_latency);
            if tick.overruns > 0 {
                self.monitor.record_overruns(&self.spec.name, tick.overruns);
                log::debug!(
                    "task '{}' skipped {} release(s)",
                    self.spec.name,
                    tick.overruns
                );
            }
            if let Some(work) = lease.work.as_mut() {
                self.iterate(work);
            }
        }

        log::info!("task '{}' exiting", self.spec.name);
    }

    fn iterate(&self, work: &mut WorkFn) {
        let name = self.spec.name.as_str();
        let handle = self.monitor.begin_measurement(name);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work()));
        let failed = !matches!(outcome, Ok(Ok(())));
        let sample = match self.monitor.end_measurement_with(
            name,
            handle,
            Some(self.spec.deadline),
            failed,
        ) {
            Ok(sample) => sample,
            Err(err) => {
                log::error!("task '{}': {}", name, err);
                return;
            }
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("task '{}' iteration failed: {:#}", name, err);
            }
            Err(payload) => {
                log::error!(
                    "task '{}' iteration panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                );
            }
        }

        if sample.deadline_missed {
            log::warn!(
                "task '{}' missed deadline: {}us > {}us",
                name,
                sample.execution_time.as_micros(),
                self.spec.deadline.as_micros()
            );
            self.notify_deadline_miss(name);
        }
    }

    fn notify_deadline_miss(&self, name: &str) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(name))).is_err() {
                log::error!("deadline callback panicked for task '{}'", name);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    fn counting_task(name: &str, period_ms: u64, counter: Arc<AtomicU64>) -> TaskConfig {
        TaskConfig::new(name, Duration::from_millis(period_ms), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn start_is_idempotent_and_stop_resets_running() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut scheduler = Scheduler::new(vec![counting_task("a", 5, counter.clone())]).unwrap();
        assert!(!scheduler.is_running());
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        thread::sleep(Duration::from_millis(30));
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn restart_after_stop_reuses_work_items() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut scheduler = Scheduler::new(vec![counting_task("again", 5, counter.clone())]).unwrap();
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        scheduler.stop();
        let first = counter.load(Ordering::SeqCst);
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        scheduler.stop();
        assert!(counter.load(Ordering::SeqCst) > first);
    }

    #[test]
    fn failing_and_panicking_iterations_are_counted_not_fatal() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let task = TaskConfig::new("flaky", Duration::from_millis(5), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            match n % 3 {
                0 => Err(anyhow::anyhow!("sensor timeout")),
                1 => panic!("bad frame"),
                _ => Ok(()),
            }
        });
        let mut scheduler = Scheduler::new(vec![task]).unwrap();
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        scheduler.stop();

        let stats = &scheduler.task_stats()[0];
        let calls = calls.load(Ordering::SeqCst);
        assert!(calls >= 3);
        assert_eq!(stats.total_executions, calls);
        let ok = calls / 3;
        assert_eq!(stats.failed_executions, calls - ok);
    }

    #[test]
    fn failures_never_trail_their_samples() {
        let task = TaskConfig::new("broken", Duration::from_millis(2), || {
            Err(anyhow::anyhow!("no frame"))
        });
        let mut scheduler = Scheduler::new(vec![task]).unwrap();
        let monitor = scheduler.monitor().clone();
        scheduler.start().unwrap();
        for _ in 0..200 {
            if let Ok(stats) = monitor.task_stats("broken") {
                assert_eq!(stats.failed_executions, stats.total_executions);
            }
            thread::yield_now();
        }
        scheduler.stop();
        let stats = &scheduler.task_stats()[0];
        assert!(stats.total_executions > 0);
        assert_eq!(stats.failed_executions, stats.total_executions);
    }

    #[test]
    fn every_release_reports_its_wakeup() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut scheduler = Scheduler::new(vec![counting_task("wake", 5, counter)]).unwrap();
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        scheduler.stop();
        let stats = &scheduler.task_stats()[0];
        assert!(stats.max_wakeup_latency_us > 0.0);
        assert!(stats.max_wakeup_latency_us >= stats.average_wakeup_latency_us);
    }

    #[test]
    fn stats_cover_tasks_that_never_ran() {
        let scheduler = Scheduler::new(vec![TaskConfig::new(
            "idle",
            Duration::from_secs(1),
            || Ok(()),
        )])
        .unwrap();
        let stats = scheduler.task_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "idle");
        assert_eq!(stats[0].total_executions, 0);
    }

    #[test]
    fn strict_start_failure_releases_started_tasks() {
        let counter = Arc::new(AtomicU64::new(0));
        let tasks = vec![
            counting_task("fine", 5, counter.clone()),
            counting_task("impossible", 5, counter).pinned_to(100_000),
        ];
        let mut scheduler = Scheduler::with_policy(tasks, RealtimePolicy::Strict).unwrap();
        let err = scheduler.start().unwrap_err();
        assert!(err.is_resource());
        assert!(!scheduler.is_running());
    }
}
