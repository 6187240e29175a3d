//! Queues: the submission-side half of the dispatch system (spec
//! §3/§4.D, component D).
//!
//! Three flavors share one trait:
//!
//! - [`ParallelQueue`] hands every submitted task straight to a
//!   [`ThreadPool`]; any number of its tasks may run concurrently.
//! - [`SerialQueue`] runs its tasks one at a time, in submission order,
//!   but still borrows its worker threads from a `ThreadPool` rather than
//!   owning a dedicated one: submitting a task schedules a single "drain
//!   one item, then reschedule if more remain" step, so a serial queue
//!   never occupies a worker thread between tasks.
//! - [`MainQueue`] also runs one task at a time in submission order, but
//!   only when its owner calls [`MainQueue::run_until_empty_once`] or
//!   [`MainQueue::run`] — it never borrows a pool thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

#[cfg(feature = "barrier")]
use crate::dispatch::barrier::{Barrier, BarrierSlot};
use crate::dispatch::group::Group;
use crate::dispatch::mpmc_ring::BoundedMpmcRing;
use crate::dispatch::thread_pool::ThreadPool;
use crate::task::Task;

/// Default capacity for a `ParallelQueue`'s backing ring. Submission
/// blocks the caller once this many tasks are in flight and unclaimed.
const DEFAULT_RING_CAPACITY: usize = 1024;

/// Common submission surface for all three queue flavors.
pub trait Queue: Send + Sync {
    /// Submits `task` to run asynchronously; does not block the caller.
    fn async_(&self, task: Task);

    /// Submits `task`, registering it with `group` so that
    /// `group.wait()` observes its completion (spec §6
    /// "Group::enter/exit around a queued task").
    fn group_async(&self, group: Arc<Group>, task: Task) {
        group.enter();
        self.async_(Task::from_closure(move || {
            task.run();
            group.exit();
        }));
    }

    /// Discards every not-yet-started task currently queued. Tasks
    /// already claimed by a worker are unaffected.
    fn clear(&self);

    /// Submits a barrier task: every task submitted before it must finish
    /// before it runs, and every task submitted after it waits for it to
    /// finish first (spec §4.D, optional `barrier` feature).
    #[cfg(feature = "barrier")]
    fn barrier(&self, task: Task);
}

/// One queued unit of work plus the barrier (if any) it must wait behind.
struct QueueItem {
    task: Task,
    #[cfg(feature = "barrier")]
    gate: Option<Arc<Barrier>>,
}

impl QueueItem {
    fn run(self) {
        #[cfg(feature = "barrier")]
        let gate = self.gate;
        #[cfg(feature = "barrier")]
        if let Some(g) = &gate {
            g.run_and_wait_until_done();
        }
        // `gate` (this item's `Arc<Barrier>` reference to its predecessor)
        // must outlive `self.task.run()`: it's dropping the *last* such
        // reference, not finishing the wait above, that releases the
        // barrier's successor (spec §4.D, `Barrier` doc comment). Dropping
        // it before the task body runs would let the successor's task
        // start concurrently with this item's own task.
        self.task.run();
        #[cfg(feature = "barrier")]
        drop(gate);
    }

    fn plain(task: Task) -> QueueItem {
        QueueItem {
            task,
            #[cfg(feature = "barrier")]
            gate: None,
        }
    }
}

/// A queue whose tasks may run concurrently across any number of a
/// [`ThreadPool`]'s workers.
pub struct ParallelQueue {
    pool: Arc<ThreadPool>,
    ring: BoundedMpmcRing<QueueItem>,
    #[cfg(feature = "barrier")]
    barrier_slot: BarrierSlot,
}

impl ParallelQueue {
    pub fn new(pool: Arc<ThreadPool>) -> Arc<ParallelQueue> {
        Self::with_capacity(pool, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(pool: Arc<ThreadPool>, capacity: usize) -> Arc<ParallelQueue> {
        let queue = Arc::new(ParallelQueue {
            pool: pool.clone(),
            ring: BoundedMpmcRing::with_capacity(capacity),
            #[cfg(feature = "barrier")]
            barrier_slot: BarrierSlot::new(),
        });
        pool.add_queue(&queue);
        queue
    }

    /// Whether at least one task is currently queued and unclaimed.
    /// Polled opportunistically by `ThreadPool`'s workers.
    pub(crate) fn has_ready_item(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Pops and runs a single ready item, if one is still there by the
    /// time this worker claims it.
    pub(crate) fn run_one_ready_item(&self) {
        if let Some(item) = self.ring.try_pop() {
            item.run();
        }
    }

    #[cfg(feature = "barrier")]
    fn current_gate(&self) -> Option<Arc<Barrier>> {
        self.barrier_slot.current()
    }
}

impl Queue for ParallelQueue {
    fn async_(&self, task: Task) {
        #[cfg(feature = "barrier")]
        let item = QueueItem { task, gate: self.current_gate() };
        #[cfg(not(feature = "barrier"))]
        let item = QueueItem::plain(task);
        self.ring.push(item);
        self.pool.notify();
    }

    fn clear(&self) {
        while self.ring.try_pop().is_some() {}
    }

    #[cfg(feature = "barrier")]
    fn barrier(&self, task: Task) {
        let barrier = self.barrier_slot.publish(task);
        self.ring.push(QueueItem {
            task: Task::from_closure(move || barrier.run_and_wait_until_done()),
            gate: None,
        });
        self.pool.notify();
    }
}

impl Drop for ParallelQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A queue that runs one task at a time, in submission order, borrowing
/// worker threads from a [`ParallelQueue`]/[`ThreadPool`] rather than
/// owning one of its own.
pub struct SerialQueue {
    parallel: Arc<ParallelQueue>,
    items: Mutex<VecDeque<QueueItem>>,
    draining: AtomicBool,
    self_ref: OnceLock<Weak<SerialQueue>>,
}

impl SerialQueue {
    pub fn new(pool: Arc<ThreadPool>) -> Arc<SerialQueue> {
        let queue = Arc::new(SerialQueue {
            parallel: ParallelQueue::new(pool),
            items: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = queue.self_ref.set(Arc::downgrade(&queue));
        queue
    }

    /// Schedules a drain step if one isn't already pending or running.
    fn schedule_drain(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(this) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        self.parallel.async_(Task::from_closure(move || drain_step(this)));
    }
}

fn drain_step(queue: Arc<SerialQueue>) {
    let next = queue.items.lock().unwrap().pop_front();
    match next {
        Some(item) => {
            item.run();
            let more = !queue.items.lock().unwrap().is_empty();
            if more {
                let queue = queue.clone();
                queue.parallel.clone().async_(Task::from_closure(move || drain_step(queue)));
            } else {
                queue.draining.store(false, Ordering::Release);
                // Re-check: a task may have been submitted between the
                // emptiness check above and clearing `draining`.
                if !queue.items.lock().unwrap().is_empty() {
                    queue.schedule_drain();
                }
            }
        }
        None => {
            queue.draining.store(false, Ordering::Release);
        }
    }
}

impl Queue for SerialQueue {
    fn async_(&self, task: Task) {
        self.items.lock().unwrap().push_back(QueueItem::plain(task));
        self.schedule_drain();
    }

    fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    #[cfg(feature = "barrier")]
    fn barrier(&self, task: Task) {
        // Tasks already run strictly one at a time in order, so a barrier
        // on a serial queue is equivalent to an ordinary task.
        self.async_(task);
    }
}

/// A queue drained explicitly by its owner, never by a pool thread.
/// Analogous to a UI event loop's main queue.
pub struct MainQueue {
    items: Mutex<VecDeque<QueueItem>>,
    stop: AtomicBool,
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainQueue {
    pub fn new() -> MainQueue {
        MainQueue {
            items: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
        }
    }

    /// Runs every task currently queued, in order, then returns. Tasks
    /// submitted by those tasks are not run by this call.
    pub fn run_until_empty_once(&self) {
        let pending: Vec<QueueItem> = self.items.lock().unwrap().drain(..).collect();
        for item in pending {
            item.run();
        }
    }

    /// Runs [`MainQueue::run_until_empty_once`] in a loop until
    /// [`MainQueue::stop`] is called. Intended to be the body of a
    /// program's main loop.
    pub fn run(&self) {
        self.stop.store(false, Ordering::SeqCst);
        while !self.stop.load(Ordering::SeqCst) {
            self.run_until_empty_once();
            std::thread::yield_now();
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Queue for MainQueue {
    fn async_(&self, task: Task) {
        self.items.lock().unwrap().push_back(QueueItem::plain(task));
    }

    fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    #[cfg(feature = "barrier")]
    fn barrier(&self, task: Task) {
        self.items.lock().unwrap().push_back(QueueItem::plain(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn parallel_queue_runs_every_task() {
        let pool = ThreadPool::with_max_workers(4);
        let queue = ParallelQueue::new(pool.clone());
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            queue.async_(Task::from_closure(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 50 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        pool.stop(true);
    }

    #[test]
    fn serial_queue_runs_tasks_in_order() {
        let pool = ThreadPool::with_max_workers(4);
        let queue = SerialQueue::new(pool.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            queue.async_(Task::from_closure(move || {
                order.lock().unwrap().push(i);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if order.lock().unwrap().len() == 20 {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("serial queue did not finish in time");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let expected: Vec<i32> = (0..20).collect();
        assert_eq!(*order.lock().unwrap(), expected);
        pool.stop(true);
    }

    #[test]
    fn main_queue_only_runs_when_polled() {
        let queue = MainQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        queue.async_(Task::from_closure(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        queue.run_until_empty_once();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn main_queue_clear_discards_pending_tasks() {
        let queue = MainQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        queue.async_(Task::from_closure(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        queue.clear();
        queue.run_until_empty_once();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "barrier")]
    #[test]
    fn barrier_task_never_observes_fewer_than_all_predecessor_increments() {
        // End-to-end scenario: 100 increments, a barrier asserting the
        // counter has reached 100, then 100 more increments (spec.md
        // "Parallel barrier" scenario). A predecessor item's barrier
        // reference must stay live until that item's own task has run, or
        // the barrier's task can observe a partial count.
        let pool = ThreadPool::with_max_workers(8);
        let queue = ParallelQueue::new(pool.clone());
        let counter = Arc::new(AtomicU32::new(0));
        let saw_full_count = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let after = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            queue.async_(Task::from_closure(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let counter = counter.clone();
            let saw_full_count = saw_full_count.clone();
            queue.barrier(Task::from_closure(move || {
                saw_full_count.store(counter.load(Ordering::SeqCst) == 100, Ordering::SeqCst);
            }));
        }
        for _ in 0..100 {
            let after = after.clone();
            queue.async_(Task::from_closure(move || {
                after.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while after.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(after.load(Ordering::SeqCst), 100);
        assert!(saw_full_count.load(Ordering::SeqCst));
        pool.stop(true);
    }
}
