//! A write-barrier node for [`ParallelQueue`](crate::dispatch::queue::ParallelQueue)
//! (spec §3/§4.D, optional `barrier` feature).
//!
//! Barriers form a singly linked list discovered by atomic exchange: adding
//! a barrier swaps it into the queue's `current_barrier` slot and links the
//! *previous* occupant's `next` pointer to it. The previous barrier's
//! *release* (not its execution) is what allows the new one to run its
//! task — see DESIGN.md for how this sidesteps the original's
//! destructor-driven shared-pointer design (spec §9 "Shared linked list of
//! barriers").

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::task::Task;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotExecuted = 0,
    Executing = 1,
    Done = 2,
}

/// A single barrier: earlier queue items must finish before its task runs,
/// and its task must finish before later items start.
pub struct Barrier {
    task: Mutex<Option<Task>>,
    state: AtomicU8,
    state_lock: Mutex<()>,
    state_condvar: Condvar,
    previous_has_finished: AtomicU8,
    finished_condvar: Condvar,
    finished_lock: Mutex<()>,
    next: Mutex<Option<Arc<Barrier>>>,
}

impl Barrier {
    pub(crate) fn new(task: Task) -> Arc<Barrier> {
        Arc::new(Barrier {
            task: Mutex::new(Some(task)),
            state: AtomicU8::new(State::NotExecuted as u8),
            state_lock: Mutex::new(()),
            state_condvar: Condvar::new(),
            previous_has_finished: AtomicU8::new(0),
            finished_condvar: Condvar::new(),
            finished_lock: Mutex::new(()),
            next: Mutex::new(None),
        })
    }

    /// A barrier with no predecessor: `previous_has_finished` starts true.
    pub(crate) fn new_root(task: Task) -> Arc<Barrier> {
        let barrier = Self::new(task);
        barrier.previous_has_finished.store(1, Ordering::SeqCst);
        barrier
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::NotExecuted,
            1 => State::Executing,
            _ => State::Done,
        }
    }

    /// Runs the barrier protocol described in spec §4.D: at most one
    /// thread transitions `NotExecuted -> Executing` and actually runs the
    /// task; every other thread that reaches this barrier waits for
    /// `Done`.
    pub(crate) fn run_and_wait_until_done(self: &Arc<Self>) {
        loop {
            match self.state() {
                State::Done => return,
                State::Executing => {
                    let guard = self.state_lock.lock().unwrap();
                    if self.state() == State::Executing {
                        let _ = self.state_condvar.wait(guard).unwrap();
                    }
                    continue;
                }
                State::NotExecuted => {
                    if self
                        .state
                        .compare_exchange(
                            State::NotExecuted as u8,
                            State::Executing as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.wait_for_predecessor();
                        if let Some(task) = self.task.lock().unwrap().take() {
                            task.run();
                        }
                        self.state.store(State::Done as u8, Ordering::Release);
                        let _guard = self.state_lock.lock().unwrap();
                        self.state_condvar.notify_all();
                        return;
                    }
                    // Lost the race; loop and observe `Executing`.
                }
            }
        }
    }

    fn wait_for_predecessor(&self) {
        loop {
            if self.previous_has_finished.load(Ordering::Acquire) != 0 {
                return;
            }
            let guard = self.finished_lock.lock().unwrap();
            if self.previous_has_finished.load(Ordering::Acquire) == 0 {
                let _ = self.finished_condvar.wait(guard).unwrap();
            }
        }
    }

    /// Links `self` as this barrier's successor, so that when `self` is
    /// released it marks `next`'s predecessor as finished.
    fn set_next(&self, next: Arc<Barrier>) {
        *self.next.lock().unwrap() = Some(next);
    }

    fn mark_finished(&self) {
        self.previous_has_finished.store(1, Ordering::Release);
        let _guard = self.finished_lock.lock().unwrap();
        self.finished_condvar.notify_all();
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        // The predecessor's *release*, not its execution, advances the
        // successor (spec §3 Barrier invariants, §9 design note).
        if let Some(next) = self.next.lock().unwrap().take() {
            next.mark_finished();
        }
    }
}

/// The slot a [`ParallelQueue`](crate::dispatch::queue::ParallelQueue) uses
/// to publish barriers by atomic exchange and link predecessor -> successor.
pub(crate) struct BarrierSlot {
    current: Mutex<Option<Arc<Barrier>>>,
}

impl BarrierSlot {
    pub(crate) fn new() -> Self {
        BarrierSlot { current: Mutex::new(None) }
    }

    /// Publishes a new barrier, linking the previous occupant (if any) to
    /// it, and returns the new barrier for the caller to attach to
    /// subsequently submitted queue items.
    pub(crate) fn publish(&self, task: Task) -> Arc<Barrier> {
        let mut slot = self.current.lock().unwrap();
        let new_barrier = match slot.take() {
            Some(previous) => {
                let new_barrier = Barrier::new(task);
                previous.set_next(new_barrier.clone());
                new_barrier
            }
            None => Barrier::new_root(task),
        };
        *slot = Some(new_barrier.clone());
        new_barrier
    }

    pub(crate) fn current(&self) -> Option<Arc<Barrier>> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn only_one_thread_runs_the_barrier_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let barrier = Barrier::new_root(Task::from_closure(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || barrier.run_and_wait_until_done())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successor_waits_for_predecessor_release() {
        let slot = BarrierSlot::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order1 = order.clone();
        let first = slot.publish(Task::from_closure(move || {
            order1.lock().unwrap().push(1);
        }));
        let order2 = order.clone();
        let second = slot.publish(Task::from_closure(move || {
            order2.lock().unwrap().push(2);
        }));

        let second_thread = {
            let second = second.clone();
            thread::spawn(move || second.run_and_wait_until_done())
        };
        // Give the second barrier a moment to reach `wait_for_predecessor`.
        thread::sleep(std::time::Duration::from_millis(20));
        first.run_and_wait_until_done();
        drop(first); // releases predecessor, unblocking `second`.
        second_thread.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
