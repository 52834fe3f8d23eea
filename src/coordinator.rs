//! Stage hand-off fabric.
//!
//! - `Mailbox<T>`: single-slot, last-write-wins buffer behind one lock. The
//!   lock is held only to swap or copy an `Arc`, never across stage work.
//! - `ReadySignal`: broadcast readiness as a monotonically increasing version.
//!   Consumers remember the last version they handled and wait for a newer
//!   one, so every waiter wakes and each decides on its own whether there is
//!   fresh data. Signals are never queued.
//! - `HandOff<T>`: a mailbox plus its signal. `publish` writes before it
//!   signals, so a consumer woken by version `v` always reads a value at
//!   least as recent as the one written before `v`.
//!
//! `PipelineCoordinator` owns exactly the three hand-offs of the stereo
//! pipeline and is passed by `Arc` into each stage's work item.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::detect::DetectionSnapshot;
use crate::frame::{StereoFrame, TensorFrame};

struct Slot<T> {
    value: Option<Arc<T>>,
    version: u64,
}

pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                version: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the contents. Returns the mailbox version after the write.
    pub fn write(&self, value: T) -> u64 {
        self.write_arc(Arc::new(value))
    }

    pub fn write_arc(&self, value: Arc<T>) -> u64 {
        let mut slot = self.lock();
        slot.value = Some(value);
        slot.version += 1;
        slot.version
    }

    pub fn read_latest(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    pub fn read_versioned(&self) -> Option<(u64, Arc<T>)> {
        let slot = self.lock();
        slot.value.clone().map(|value| (slot.version, value))
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }
}

impl<T: Clone> Mailbox<T> {
    /// Update the contents in place under the lock.
    ///
    /// `init` seeds an empty mailbox. The current value is copied only when
    /// a reader still holds the previous snapshot.
    pub fn modify<R>(&self, init: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> (u64, R) {
        let mut slot = self.lock();
        let value = slot.value.get_or_insert_with(|| Arc::new(init()));
        let out = f(Arc::make_mut(value));
        slot.version += 1;
        (slot.version, out)
    }

    /// `modify` for a mailbox that was seeded up front. `None` when empty.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<(u64, R)> {
        let mut slot = self.lock();
        let value = slot.value.as_mut()?;
        let out = f(Arc::make_mut(value));
        slot.version += 1;
        Some((slot.version, out))
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ReadySignal {
    version: Mutex<u64>,
    cvar: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.version.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bump the version and wake every waiter.
    pub fn signal(&self) -> u64 {
        let mut version = self.lock();
        *version += 1;
        self.cvar.notify_all();
        *version
    }

    pub fn version(&self) -> u64 {
        *self.lock()
    }

    /// Wait until the version exceeds `last_seen`, for at most `timeout`.
    pub fn wait_newer(&self, last_seen: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut version = self.lock();
        loop {
            if *version > last_seen {
                return Some(*version);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(version, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            version = guard;
        }
    }
}

/// Consumer-side memory of the last signal version handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadCursor {
    seen: u64,
}

impl ReadCursor {
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

pub struct HandOff<T> {
    name: &'static str,
    mailbox: Mailbox<T>,
    ready: ReadySignal,
}

impl<T> HandOff<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mailbox: Mailbox::new(),
            ready: ReadySignal::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Write then signal.
    pub fn publish(&self, value: T) -> u64 {
        self.mailbox.write(value);
        self.ready.signal()
    }

    /// Signal readiness of whatever the mailbox currently holds.
    pub fn signal(&self) -> u64 {
        self.ready.signal()
    }

    /// Wait for a signal newer than the cursor and return the latest value.
    ///
    /// `None` means nothing new arrived within `timeout`; the caller may
    /// still use `read_latest`.
    pub fn wait_ready(&self, cursor: &mut ReadCursor, timeout: Duration) -> Option<Arc<T>> {
        let version = self.ready.wait_newer(cursor.seen, timeout)?;
        cursor.seen = version;
        self.mailbox.read_latest()
    }

    pub fn read_latest(&self) -> Option<Arc<T>> {
        self.mailbox.read_latest()
    }

    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mailbox
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }
}

/// The three shared hand-off points of the stereo pipeline.
pub struct PipelineCoordinator {
    pub merged: HandOff<StereoFrame>,
    pub preprocessed: HandOff<TensorFrame>,
    pub detections: HandOff<DetectionSnapshot>,
}

impl PipelineCoordinator {
    pub fn new() -> Self {
        Self {
            merged: HandOff::new("merged"),
            preprocessed: HandOff::new("preprocessed"),
            detections: HandOff::new("detections"),
        }
    }
}

impl Default for PipelineCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
