//! Event sources and timer handles (spec §3 "Event source").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatch::queue::Queue;
use crate::task::Task;

/// Which direction of fd readiness a [`Source`] is interested in, or
/// whether it represents a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// A repeatable action: unlike [`Task`], a source's action may fire more
/// than once, so it's stored as a plain `Fn` and wrapped in a fresh
/// one-shot `Task` each time it's dispatched to a queue.
pub(crate) type Action = Arc<dyn Fn() + Send + Sync>;

/// A registered interest in an OS-level event: fd readability/writability
/// or a signal. Shared between the OS-facing registry and the in-flight
/// firing path, so removal can race safely with a firing already under
/// way (spec §4.F "Cancellation").
pub struct Source {
    pub(crate) enabled: AtomicBool,
    pub(crate) queue: Option<Arc<dyn Queue>>,
    pub(crate) action: Action,
}

impl Source {
    pub(crate) fn new(queue: Option<Arc<dyn Queue>>, action: Action) -> Arc<Source> {
        Arc::new(Source { enabled: AtomicBool::new(true), queue, action })
    }

    /// Runs the action directly, or enqueues it on the bound queue, iff
    /// still enabled.
    pub(crate) fn fire_if_enabled(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let action = self.action.clone();
        match &self.queue {
            Some(queue) => queue.async_(Task::from_closure(move || action())),
            None => (self.action)(),
        }
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// An opaque handle identifying a registered fd or signal source, enough
/// to remove it later.
#[derive(Clone)]
pub struct SourceHandle {
    pub(crate) source: Arc<Source>,
    pub(crate) key: super::RegistrationKey,
}

impl SourceHandle {
    pub fn disable(&self) {
        self.source.disable();
    }
}

/// An opaque handle to a scheduled timer; used only to identify it for
/// removal (timers otherwise self-manage their rescheduling).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(pub(crate) u64);
