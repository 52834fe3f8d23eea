//! Periodic execution contexts.
//!
//! A context is one OS thread with an optional CPU pin and fixed priority,
//! released on a fixed period grid by `PeriodicTimer`. Waiting for the next
//! release is the only place a context sleeps on its own, and the sleep is
//! cut short by `StopSignal`.
//!
//! On Linux the pin uses `sched_setaffinity` and the priority uses
//! `SCHED_FIFO`. Both normally need `CAP_SYS_NICE`. Without them the
//! achievable jitter is whatever the default CFS scheduler gives a sleeping
//! thread (typically tens to hundreds of microseconds on an idle machine,
//! unbounded under load). `RealtimePolicy::BestEffort` accepts that and logs
//! it; `RealtimePolicy::Strict` refuses to start.

use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{resource_err, RtResult};
use crate::task::CpuCore;

const JOIN_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimePolicy {
    /// Affinity or priority failures abort start.
    Strict,
    /// Affinity or priority failures are logged and the task runs unconstrained.
    #[default]
    BestEffort,
}

/// Cooperative stop request shared by a set of contexts.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep until `deadline`. Returns `true` when woken by a stop request.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            stopped = guard;
        }
    }
}

/// One release of a periodic context.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    /// Scheduled release instant on the period grid.
    pub release: Instant,
    /// Whole periods skipped since the previous release.
    pub overruns: u64,
    /// How late the thread actually woke relative to `release`.
    pub wakeup_latency: Duration,
}

/// Absolute-time period grid. Never drifts: releases are `start + k * period`.
pub struct PeriodicTimer {
    period: Duration,
    next_release: Instant,
}

impl PeriodicTimer {
    /// First release is immediate.
    pub fn start_now(period: Duration) -> Self {
        Self::start_at(Instant::now(), period)
    }

    pub fn start_at(first_release: Instant, period: Duration) -> Self {
        Self {
            period,
            next_release: first_release,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until the next release. `None` means stop was requested.
    ///
    /// Releases missed while the previous iteration overran are skipped,
    /// not replayed, so a late task re-aligns instead of bursting.
    pub fn wait_next_period(&mut self, stop: &StopSignal) -> Option<Tick> {
        let now = Instant::now();
        let mut overruns = 0;
        if now > self.next_release + self.period {
            let period_ns = self.period.as_nanos().max(1);
            let skipped = (now - self.next_release).as_nanos() / period_ns;
            overruns = skipped as u64;
            self.next_release += Duration::from_nanos((period_ns * skipped) as u64);
        }

        if stop.sleep_until(self.next_release) {
            return None;
        }

        let release = self.next_release;
        self.next_release += self.period;
        Some(Tick {
            release,
            overruns,
            wakeup_latency: Instant::now().saturating_duration_since(release),
        })
    }
}

/// Attributes applied by the new thread to itself before its body runs.
#[derive(Clone, Debug)]
pub struct ContextAttributes {
    pub name: String,
    pub priority: u8,
    pub core: CpuCore,
    pub policy: RealtimePolicy,
}

pub struct PeriodicContext {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicContext {
    /// Create the thread, apply affinity and priority, then run `body`.
    ///
    /// Returns only after the thread has reported whether its attributes
    /// were applied. Under `Strict`, a failure is returned here and `body`
    /// never runs.
    pub fn spawn<F>(attrs: ContextAttributes, body: F) -> RtResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let thread_attrs = attrs.clone();
        let handle = thread::Builder::new()
            .name(attrs.name.clone())
            .spawn(move || {
                let applied = apply_attributes(&thread_attrs);
                let proceed = applied.is_ok();
                let _ = ready_tx.send(applied);
                if proceed {
                    body();
                }
            })
            .map_err(|e| resource_err(format!("failed to create task '{}': {}", attrs.name, e)))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err("thread exited before reporting its attributes".to_string())
        });
        if let Err(reason) = ready {
            let _ = handle.join();
            return Err(resource_err(format!("task '{}': {}", attrs.name, reason)));
        }

        Ok(Self {
            name: attrs.name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Join with an upper bound. A thread still running after `timeout`
    /// is detached and reported as an error.
    pub fn join(mut self, timeout: Duration) -> RtResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(resource_err(format!(
                    "task '{}' did not exit within {:?}; detached",
                    self.name, timeout
                )));
            }
            thread::sleep(JOIN_POLL);
        }
        handle
            .join()
            .map_err(|_| resource_err(format!("task '{}' thread panicked", self.name)))
    }
}

fn apply_attributes(attrs: &ContextAttributes) -> Result<(), String> {
    let mut problems = Vec::new();
    if let CpuCore::Pinned(core) = attrs.core {
        if let Err(e) = platform::pin_current_thread(core) {
            problems.push(format!("cpu affinity {}: {}", core, e));
        }
    }
    if attrs.priority > 0 {
        if let Err(e) = platform::set_current_priority(attrs.priority) {
            problems.push(format!("priority {}: {}", attrs.priority, e));
        }
    }
    if problems.is_empty() {
        return Ok(());
    }
    let summary = problems.join("; ");
    match attrs.policy {
        RealtimePolicy::Strict => Err(summary),
        RealtimePolicy::BestEffort => {
            log::warn!(
                "task '{}' running without realtime guarantees ({})",
                attrs.name,
                summary
            );
            Ok(())
        }
    }
}

/// Number of cores the process may run on.
pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io;

    pub(super) fn pin_current_thread(core: usize) -> Result<(), String> {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(format!("core index out of range (max {})", libc::CPU_SETSIZE - 1));
        }
        // SAFETY: cpu_set_t is plain data; pid 0 targets the calling thread.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().to_string());
        }
        Ok(())
    }

    pub(super) fn set_current_priority(priority: u8) -> Result<(), String> {
        // SAFETY: sched_param is plain data and pthread_self is always valid.
        let rc = unsafe {
            let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
            let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
            let mut param: libc::sched_param = std::mem::zeroed();
            param.sched_priority = (priority as libc::c_int).clamp(min, max);
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).to_string());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    pub(super) fn pin_current_thread(_core: usize) -> Result<(), String> {
        Err("cpu affinity is not supported on this platform".to_string())
    }

    pub(super) fn set_current_priority(_priority: u8) -> Result<(), String> {
        Err("realtime priority is not supported on this platform".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn unconstrained(name: &str) -> ContextAttributes {
        ContextAttributes {
            name: name.to_string(),
            priority: 0,
            core: CpuCore::Any,
            policy: RealtimePolicy::Strict,
        }
    }

    #[test]
    fn timer_releases_on_grid() {
        let stop = StopSignal::new();
        let period = Duration::from_millis(5);
        let start = Instant::now();
        let mut timer = PeriodicTimer::start_at(start, period);
        let mut releases = Vec::new();
        for _ in 0..4 {
            releases.push(timer.wait_next_period(&stop).unwrap().release);
        }
        for (k, release) in releases.iter().enumerate() {
            assert_eq!(*release, start + period * k as u32);
        }
        assert!(start.elapsed() >= period * 3);
    }

    #[test]
    fn timer_skips_missed_releases() {
        let stop = StopSignal::new();
        let period = Duration::from_millis(2);
        let mut timer = PeriodicTimer::start_now(period);
        timer.wait_next_period(&stop).unwrap();
        thread::sleep(Duration::from_millis(11));
        let tick = timer.wait_next_period(&stop).unwrap();
        assert!(tick.overruns >= 4, "overruns = {}", tick.overruns);
    }

    #[test]
    fn stop_interrupts_wait() {
        let stop = StopSignal::new();
        let mut timer = PeriodicTimer::start_now(Duration::from_secs(30));
        timer.wait_next_period(&stop).unwrap();
        let remote = stop.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request();
        });
        let begun = Instant::now();
        assert!(timer.wait_next_period(&stop).is_none());
        assert!(begun.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn context_runs_body_and_joins() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let ctx = PeriodicContext::spawn(unconstrained("body"), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(ctx.name(), "body");
        ctx.join(Duration::from_secs(1)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn bounded_join_reports_hung_thread() {
        let stop = StopSignal::new();
        let inner = stop.clone();
        let ctx = PeriodicContext::spawn(unconstrained("hung"), move || {
            inner.sleep_until(Instant::now() + Duration::from_secs(2));
        })
        .unwrap();
        let err = ctx.join(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_resource());
        stop.request();
    }

    #[test]
    fn strict_policy_rejects_impossible_core() {
        let attrs = ContextAttributes {
            core: CpuCore::Pinned(100_000),
            ..unconstrained("nowhere")
        };
        let err = PeriodicContext::spawn(attrs, || {}).err().expect("spawn must fail");
        assert!(err.is_resource());
    }

    #[test]
    fn best_effort_policy_runs_anyway() {
        let attrs = ContextAttributes {
            core: CpuCore::Pinned(100_000),
            policy: RealtimePolicy::BestEffort,
            ..unconstrained("anywhere")
        };
        let ctx = PeriodicContext::spawn(attrs, || {}).unwrap();
        ctx.join(Duration::from_secs(1)).unwrap();
    }
}
