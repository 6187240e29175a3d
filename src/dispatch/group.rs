//! A counting synchronizer for async task completion (spec §3/§4.E,
//! component E).

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::dispatch::queue::Queue;
use crate::task::Task;

/// Tracks a dynamic set of in-flight tasks. `enter`/`exit` must be
/// balanced; `wait` blocks until the count returns to zero.
pub struct Group {
    count: AtomicIsize,
    failed: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    pub fn new() -> Self {
        Group {
            count: AtomicIsize::new(0),
            failed: AtomicBool::new(false),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Registers one unit of pending work.
    pub fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Completes one unit of work registered by a prior `enter`. Wakes any
    /// `wait`ers once the count returns to zero.
    ///
    /// # Panics
    /// Panics (a contract violation per spec §7) if called more times than
    /// `enter`, mirroring the source's assertion that the two are balanced.
    pub fn exit(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "Group::exit called without a matching Group::enter");
        if previous == 1 {
            let _guard = self.lock.lock().unwrap();
            self.condvar.notify_all();
        }
    }

    /// Marks the group as having observed a fatal error (spec §7: BGZF
    /// driver / in-order reader failures "propagate via the group's
    /// failure state"). Does not itself drive the count to zero; callers
    /// still balance `enter`/`exit`, but [`Group::failed`] lets a `wait`er
    /// distinguish a clean completion from an aborted one.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Whether [`Group::mark_failed`] has been called.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until the count reaches zero.
    pub fn wait(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::SeqCst) > 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Returns `true` immediately if the count is already zero.
    pub fn is_done(&self) -> bool {
        self.count.load(Ordering::SeqCst) <= 0
    }
}

/// Schedules `task` on `queue` once `group`'s count reaches zero, without
/// blocking the calling thread (spec §6 "Group::notify(queue, task)").
pub fn notify(group: std::sync::Arc<Group>, queue: std::sync::Arc<dyn Queue>, task: Task) {
    std::thread::spawn(move || {
        group.wait();
        queue.async_(task);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::MainQueue;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_only_after_balanced_exits() {
        let group = Arc::new(Group::new());
        group.enter();
        group.enter();
        assert!(!group.is_done());
        group.exit();
        assert!(!group.is_done());
        group.exit();
        assert!(group.is_done());
        group.wait(); // must return immediately
    }

    #[test]
    #[should_panic(expected = "without a matching")]
    fn exit_without_enter_panics() {
        let group = Group::new();
        group.exit();
    }

    #[test]
    fn ten_tasks_then_notify() {
        let group = Arc::new(Group::new());
        let done = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            group.enter();
            let group = group.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(1));
                hits.fetch_add(1, Ordering::SeqCst);
                group.exit();
            });
        }

        let main_queue = Arc::new(MainQueue::new());
        let done_flag = done.clone();
        notify(group, main_queue.clone(), Task::from_closure(move || {
            done_flag.store(true, Ordering::SeqCst);
        }));

        // Run the main queue long enough for the background waiter thread
        // to observe completion and enqueue the completion task.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            main_queue.run_until_empty_once();
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
