//! An elastic worker pool that owns threads but not queues (spec §3/§4.C,
//! component C).
//!
//! The pool does not hold queue items itself; it holds a list of
//! non-owning references to [`ParallelQueue`](crate::dispatch::queue::ParallelQueue)s
//! and wakes a worker whenever [`ThreadPool::notify`] is called, matching
//! the separation of concerns in spec §3 ("owns workers, not queues").

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::dispatch::queue::ParallelQueue;

const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(15);

struct Shared {
    queues: Mutex<Vec<Weak<ParallelQueue>>>,
    waiting_tasks: AtomicUsize,
    current_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    max_workers: AtomicUsize,
    max_idle_time: Mutex<Duration>,
    running: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

/// An elastic set of worker threads shared by any number of
/// [`ParallelQueue`]s registered with it.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Creates a pool whose worker ceiling defaults to
    /// `num_cpus::get()` and whose idle timeout defaults to 15 seconds,
    /// matching spec §6's documented defaults.
    pub fn new() -> Arc<ThreadPool> {
        Self::with_max_workers(num_cpus::get())
    }

    pub fn with_max_workers(max_workers: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPool {
            shared: Arc::new(Shared {
                queues: Mutex::new(Vec::new()),
                waiting_tasks: AtomicUsize::new(0),
                current_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                max_workers: AtomicUsize::new(max_workers.max(1)),
                max_idle_time: Mutex::new(DEFAULT_MAX_IDLE),
                running: AtomicBool::new(true),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
            }),
        })
    }

    /// A process-wide default pool, analogous to `ThreadPool::shared()` in
    /// spec §6.
    pub fn shared() -> Arc<ThreadPool> {
        use std::sync::OnceLock;
        static SHARED: OnceLock<Arc<ThreadPool>> = OnceLock::new();
        SHARED.get_or_init(ThreadPool::new).clone()
    }

    pub fn set_max_workers(&self, n: usize) {
        self.shared.max_workers.store(n.max(1), Ordering::SeqCst);
    }

    pub fn set_max_idle_time(&self, d: Duration) {
        *self.shared.max_idle_time.lock().unwrap() = d;
    }

    pub fn current_workers(&self) -> usize {
        self.shared.current_workers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_queue(&self, queue: &Arc<ParallelQueue>) {
        self.shared.queues.lock().unwrap().push(Arc::downgrade(queue));
    }

    pub(crate) fn remove_queue(&self, queue: &Arc<ParallelQueue>) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.retain(|q| !Weak::ptr_eq(q, &Arc::downgrade(queue)));
    }

    /// Increments the waiting-task counter and wakes an idle worker or
    /// spawns a new one, up to `max_workers`.
    pub(crate) fn notify(self: &Arc<Self>) {
        self.shared.waiting_tasks.fetch_add(1, Ordering::SeqCst);

        if self.shared.idle_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.shared.wake_lock.lock().unwrap();
            self.shared.wake.notify_one();
            return;
        }

        let current = self.shared.current_workers.load(Ordering::SeqCst);
        if current < self.shared.max_workers.load(Ordering::SeqCst) {
            self.start_worker();
        } else {
            // No idle worker and at the cap: an existing worker will pick
            // this up on its next loop iteration.
            let _guard = self.shared.wake_lock.lock().unwrap();
            self.shared.wake.notify_one();
        }
    }

    /// Spawns one additional worker thread, bypassing the idle-or-spawn
    /// heuristic in [`ThreadPool::notify`].
    pub fn start_worker(self: &Arc<Self>) {
        self.shared.current_workers.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        std::thread::spawn(move || pool.worker_loop());
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            let had_task = self.shared.waiting_tasks.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| if n > 0 { Some(n - 1) } else { None },
            );

            if had_task.is_err() {
                // No known pending notification; wait up to the idle
                // timeout, woken early by `notify` or `stop`.
                self.shared.idle_workers.fetch_add(1, Ordering::SeqCst);
                let max_idle = *self.shared.max_idle_time.lock().unwrap();
                let guard = self.shared.wake_lock.lock().unwrap();
                let (_guard, timeout) = self.shared.wake.wait_timeout(guard, max_idle).unwrap();
                self.shared.idle_workers.fetch_sub(1, Ordering::SeqCst);

                if timeout.timed_out() && self.shared.waiting_tasks.load(Ordering::SeqCst) == 0 {
                    break;
                }
                continue;
            }

            if let Some(queue) = self.pick_ready_queue() {
                queue.run_one_ready_item();
            }
        }

        self.shared.current_workers.fetch_sub(1, Ordering::SeqCst);
        debug!("biodispatch: worker exiting, {} workers remain", self.current_workers());
    }

    /// Picks any registered queue that currently has a ready item.
    /// Fairness across queues isn't guaranteed (spec §4.C).
    fn pick_ready_queue(&self) -> Option<Arc<ParallelQueue>> {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.retain(|q| q.upgrade().is_some());
        for q in queues.iter() {
            if let Some(queue) = q.upgrade() {
                if queue.has_ready_item() {
                    return Some(queue);
                }
            }
        }
        None
    }

    /// Stops accepting new idle periods; if `wait` is true, blocks until
    /// every worker has exited.
    pub fn stop(&self, wait: bool) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let _guard = self.shared.wake_lock.lock().unwrap();
            self.shared.wake.notify_all();
        }
        if wait {
            while self.shared.current_workers.load(Ordering::SeqCst) > 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            warn!("biodispatch: ThreadPool dropped without calling stop()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::{ParallelQueue, Queue};
    use crate::task::Task;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn notify_spawns_and_reclaims_workers() {
        let pool = ThreadPool::with_max_workers(4);
        let queue = ParallelQueue::new(pool.clone());
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            queue.async_(Task::from_closure(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.stop(true);
        assert_eq!(pool.current_workers(), 0);
    }
}
