//! OS-readiness integration: fd read/write, signals, and timers driven by
//! a single worker thread (spec §3/§4.F, component F).
//!
//! One public [`EventManager`] is backed by one of two platform
//! implementations selected at build time: `kqueue` on the BSD family,
//! `epoll` + `signalfd` + `timerfd` + `eventfd` on Linux. Both backends
//! implement the same [`platform::Backend`] trait so `EventManager`
//! itself is platform-agnostic.

mod platform;
mod source;

use platform::Backend as _;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::dispatch::queue::Queue;
use crate::error::{Error, Result};
pub use source::{Direction, Source, SourceHandle, TimerHandle};
use source::Action;

/// Internal event codes posted to the backend's control channel (spec §6
/// "Internal event codes").
const EVENT_STOP: u64 = 0;
const EVENT_WAKE_UP: u64 = 1;

/// Identifies a registered fd/signal interest for removal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum RegistrationKey {
    Fd(RawFd, Direction),
    Signal(i32),
}

struct TimerEntry {
    id: u64,
    next_fire: Instant,
    interval: Duration,
    repeats: bool,
    queue: Option<Arc<dyn Queue>>,
    action: Action,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_fire == other.next_fire
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_fire.cmp(&other.next_fire)
    }
}

/// A sentinel wait duration used when no timer is pending (spec §4.F
/// "check_timers... returns a large sentinel if none").
const NO_TIMER_SENTINEL: Duration = Duration::from_secs(3600);

/// Drives OS event readiness and timers on a single worker thread.
pub struct EventManager {
    backend: platform::PlatformBackend,
    sources: Mutex<std::collections::HashMap<RegistrationKey, Arc<Source>>>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    next_timer_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventManager {
    /// Allocates the OS event handle. Resource exhaustion (failure to
    /// create the kqueue/epoll fd) propagates to the caller (spec §7).
    pub fn setup() -> Result<Arc<EventManager>> {
        let backend = platform::PlatformBackend::new()
            .map_err(|e| Error::ResourceExhausted(format!("event manager setup: {e}")))?;
        Ok(Arc::new(EventManager {
            backend,
            sources: Mutex::new(std::collections::HashMap::new()),
            timers: Mutex::new(BinaryHeap::new()),
            next_timer_id: AtomicU64::new(0),
            thread: Mutex::new(None),
        }))
    }

    /// Runs the event loop on the calling thread until `stop` is called.
    pub fn run(&self) {
        loop {
            let wait_for = self.check_timers();
            match self.backend.wait(Some(wait_for)) {
                Ok(ready) => {
                    for event in ready {
                        match event {
                            platform::ReadyEvent::Control(EVENT_STOP) => return,
                            platform::ReadyEvent::Control(EVENT_WAKE_UP) => {}
                            platform::ReadyEvent::Control(_) => {}
                            platform::ReadyEvent::Source(key) => {
                                let source = self.sources.lock().unwrap().get(&key).cloned();
                                if let Some(source) = source {
                                    source.fire_if_enabled();
                                }
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("biodispatch: event manager wait failed: {e}");
                    return;
                }
            }
        }
    }

    /// Spawns a dedicated thread running [`EventManager::run`].
    pub fn start_thread_and_run(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::spawn(move || this.run());
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Causes a `run` loop (on any thread) to exit before processing any
    /// further currently-ready events (spec §5 Open Question #3).
    pub fn stop(&self) {
        self.backend.post_control(EVENT_STOP);
    }

    /// `stop` followed by joining the thread started by
    /// `start_thread_and_run`, if any.
    pub fn stop_and_wait(&self) {
        self.stop();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn next_timer_id(&self) -> u64 {
        self.next_timer_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Schedules a timer; `repeats` selects one-shot vs. interval firing.
    pub fn schedule_timer<F>(
        &self,
        interval: Duration,
        repeats: bool,
        queue: Option<Arc<dyn Queue>>,
        action: F,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_timer_id();
        let entry = TimerEntry {
            id,
            next_fire: Instant::now() + interval,
            interval,
            repeats,
            queue,
            action: Arc::new(action),
        };
        self.timers.lock().unwrap().push(Reverse(entry));
        self.backend.post_control(EVENT_WAKE_UP);
        TimerHandle(id)
    }

    /// Removes a pending timer before it fires. A no-op if it already
    /// fired (and wasn't repeating) or was already removed.
    pub fn remove_timer(&self, handle: TimerHandle) {
        let mut timers = self.timers.lock().unwrap();
        let kept: Vec<Reverse<TimerEntry>> =
            timers.drain().filter(|Reverse(t)| t.id != handle.0).collect();
        *timers = kept.into_iter().collect();
    }

    /// Pops expired timers, runs their actions, reschedules repeaters,
    /// and returns the duration until the next firing (or a sentinel if
    /// none are pending).
    fn check_timers(&self) -> Duration {
        let now = Instant::now();
        loop {
            let mut timers = self.timers.lock().unwrap();
            match timers.peek() {
                Some(Reverse(entry)) if entry.next_fire <= now => {
                    let Reverse(mut entry) = timers.pop().unwrap();
                    drop(timers);
                    let action = entry.action.clone();
                    match &entry.queue {
                        Some(queue) => queue.async_(crate::task::Task::from_closure(move || action())),
                        None => action(),
                    }
                    if entry.repeats {
                        entry.next_fire += entry.interval;
                        self.timers.lock().unwrap().push(Reverse(entry));
                    }
                }
                Some(Reverse(entry)) => {
                    return entry.next_fire.saturating_duration_since(now).max(Duration::from_millis(1));
                }
                None => return NO_TIMER_SENTINEL,
            }
        }
    }

    pub fn add_file_descriptor_read_event_source<F>(
        &self,
        fd: RawFd,
        queue: Option<Arc<dyn Queue>>,
        action: F,
    ) -> Result<SourceHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_fd_source(fd, Direction::Read, queue, Arc::new(action))
    }

    pub fn add_file_descriptor_write_event_source<F>(
        &self,
        fd: RawFd,
        queue: Option<Arc<dyn Queue>>,
        action: F,
    ) -> Result<SourceHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_fd_source(fd, Direction::Write, queue, Arc::new(action))
    }

    fn add_fd_source(
        &self,
        fd: RawFd,
        direction: Direction,
        queue: Option<Arc<dyn Queue>>,
        action: Action,
    ) -> Result<SourceHandle> {
        let key = RegistrationKey::Fd(fd, direction);
        let source = Source::new(queue, action);
        self.backend
            .register_fd(fd, direction, key)
            .map_err(|e| Error::ResourceExhausted(format!("registering fd source: {e}")))?;
        self.sources.lock().unwrap().insert(key, source.clone());
        Ok(SourceHandle { source, key })
    }

    pub fn add_signal_event_source<F>(
        &self,
        signal: i32,
        queue: Option<Arc<dyn Queue>>,
        action: F,
    ) -> Result<SourceHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let key = RegistrationKey::Signal(signal);
        let source = Source::new(queue, Arc::new(action));
        self.backend
            .register_signal(signal, key)
            .map_err(|e| Error::ResourceExhausted(format!("registering signal source: {e}")))?;
        self.sources.lock().unwrap().insert(key, source.clone());
        Ok(SourceHandle { source, key })
    }

    pub fn remove_file_descriptor_event_source(&self, handle: SourceHandle) -> Result<()> {
        handle.source.disable();
        if let RegistrationKey::Fd(fd, direction) = handle.key {
            self.sources.lock().unwrap().remove(&handle.key);
            self.backend
                .unregister_fd(fd, direction)
                .map_err(|e| Error::Contract(format!("removing fd source: {e}")))?;
        } else {
            warn!("biodispatch: remove_file_descriptor_event_source called with a signal handle");
        }
        Ok(())
    }

    pub fn remove_signal_event_source(&self, handle: SourceHandle) -> Result<()> {
        handle.source.disable();
        if let RegistrationKey::Signal(signal) = handle.key {
            self.sources.lock().unwrap().remove(&handle.key);
            self.backend
                .unregister_signal(signal)
                .map_err(|e| Error::Contract(format!("removing signal source: {e}")))?;
        } else {
            warn!("biodispatch: remove_signal_event_source called with an fd handle");
        }
        Ok(())
    }

    /// Forces re-evaluation of the wait loop, e.g. after scheduling a
    /// timer with a sooner deadline than the current wait.
    pub fn trigger_event(&self, code: u64) {
        self.backend.post_control(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::MainQueue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn timer_fires_after_interval_and_reports_to_queue() {
        let manager = EventManager::setup().expect("event manager setup");
        let queue = Arc::new(MainQueue::new());
        let fired_at = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let fired_at2 = fired_at.clone();
        let start = Instant::now();

        manager.schedule_timer(Duration::from_millis(50), false, Some(queue.clone() as Arc<dyn Queue>), move || {
            fired_at2.lock().unwrap().push(Instant::now());
        });

        let deadline = Instant::now() + Duration::from_millis(500);
        while fired_at.lock().unwrap().is_empty() && Instant::now() < deadline {
            manager.run_once_for_test();
            queue.run_until_empty_once();
            std::thread::sleep(Duration::from_millis(1));
        }

        let times = fired_at.lock().unwrap();
        assert_eq!(times.len(), 1);
        assert!(times[0] >= start + Duration::from_millis(50));
    }

    #[test]
    fn stop_causes_run_to_return() {
        let manager = EventManager::setup().expect("event manager setup");
        manager.start_thread_and_run();
        std::thread::sleep(Duration::from_millis(5));
        manager.stop_and_wait();
    }

    #[test]
    fn signal_source_registers_and_removes_cleanly() {
        let manager = EventManager::setup().expect("event manager setup");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let handle = manager
            .add_signal_event_source(libc::SIGUSR1, None, move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .expect("register SIGUSR1");
        manager.remove_signal_event_source(handle).expect("remove SIGUSR1");
    }
}

#[cfg(test)]
impl EventManager {
    /// Test-only: runs exactly one non-blocking wait/timer-check pass
    /// instead of the infinite `run` loop, so tests can poll without a
    /// background thread.
    fn run_once_for_test(&self) {
        let wait_for = self.check_timers();
        if let Ok(ready) = self.backend.wait(Some(wait_for.min(Duration::from_millis(5)))) {
            for event in ready {
                if let platform::ReadyEvent::Source(key) = event {
                    if let Some(source) = self.sources.lock().unwrap().get(&key).cloned() {
                        source.fire_if_enabled();
                    }
                }
            }
        }
    }
}
