//! Periodic task descriptors.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::{config_err, RtResult};

/// Highest accepted priority. Maps onto the top of the `SCHED_FIFO` range.
pub const MAX_PRIORITY: u8 = 99;

/// Unit of work invoked once per period.
///
/// Returning `Err` (or panicking) marks the iteration as failed; the task keeps running.
pub type WorkFn = Box<dyn FnMut() -> anyhow::Result<()> + Send + 'static>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuCore {
    #[default]
    Any,
    Pinned(usize),
}

impl fmt::Display for CpuCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuCore::Any => write!(f, "any"),
            CpuCore::Pinned(core) => write!(f, "{}", core),
        }
    }
}

/// Timing identity of a task, without its work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub period: Duration,
    pub deadline: Duration,
    /// 0 = normal scheduling, 1..=99 = fixed realtime priority (higher wins).
    pub priority: u8,
    pub core: CpuCore,
}

impl TaskSpec {
    pub fn validate(&self) -> RtResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_err("task name must not be empty"));
        }
        if self.period.is_zero() {
            return Err(config_err(format!(
                "task '{}': period must be greater than zero",
                self.name
            )));
        }
        if self.deadline.is_zero() {
            return Err(config_err(format!(
                "task '{}': deadline must be greater than zero",
                self.name
            )));
        }
        if self.deadline > self.period {
            return Err(config_err(format!(
                "task '{}': deadline {:?} exceeds period {:?}",
                self.name, self.deadline, self.period
            )));
        }
        if self.priority > MAX_PRIORITY {
            return Err(config_err(format!(
                "task '{}': priority {} above maximum {}",
                self.name, self.priority, MAX_PRIORITY
            )));
        }
        Ok(())
    }
}

/// A task as handed to the scheduler.
pub struct TaskConfig {
    pub spec: TaskSpec,
    pub work: Option<WorkFn>,
}

impl TaskConfig {
    /// Deadline defaults to the period, priority to 0, core to unconstrained.
    pub fn new<F>(name: impl Into<String>, period: Duration, work: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            spec: TaskSpec {
                name: name.into(),
                period,
                deadline: period,
                priority: 0,
                core: CpuCore::Any,
            },
            work: Some(Box::new(work)),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.spec.deadline = deadline;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn pinned_to(mut self, core: usize) -> Self {
        self.spec.core = CpuCore::Pinned(core);
        self
    }

    pub fn on_core(mut self, core: CpuCore) -> Self {
        self.spec.core = core;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn validate(&self) -> RtResult<()> {
        self.spec.validate()?;
        if self.work.is_none() {
            return Err(config_err(format!(
                "task '{}': work item is missing",
                self.spec.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("spec", &self.spec)
            .field("work", &self.work.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Validate every task and reject duplicate names.
pub fn validate_task_set(tasks: &[TaskConfig]) -> RtResult<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        task.validate()?;
        if !seen.insert(task.name()) {
            return Err(config_err(format!(
                "duplicate task name '{}'",
                task.name()
            )));
        }
    }
    Ok(())
}
