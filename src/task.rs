//! A move-only, single-shot unit of work (spec §3/§4.A, component A).
//!
//! `Task` is polymorphic over a small, closed set of callable shapes rather
//! than storing an arbitrary closure inline: a free function pointer, a
//! single `Copy` captured value paired with a function pointer (the common
//! "value-captured closure" case — no heap allocation), a method bound to a
//! target the task keeps alive (`Arc`) or merely observes (`Weak`), and a
//! boxed fallback for anything else. See DESIGN.md for why this shape was
//! chosen over an inline byte buffer with a custom move protocol.

use std::any::Any;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

/// A one-shot, move-only callable submitted to a [`Queue`](crate::dispatch::queue::Queue).
///
/// Invocation is consuming: [`Task::run`] takes `self` by value, so a task
/// can be run at most once. A default-constructed task is inert (`Empty`)
/// and safe to drop without running.
pub enum Task {
    /// Inert task. Dropping or running it is a no-op.
    Empty,
    /// A free function: zero captured state, zero allocation.
    Fn(fn()),
    /// A closure-equivalent carrying exactly one `Copy` value, stored
    /// inline. Covers the common case of capturing a small index or handle
    /// without heap allocation.
    Value {
        data: InlineWord,
        call_addr: usize,
        trampoline: fn(InlineWord, usize),
    },
    /// A method bound to a target whose lifetime the task extends.
    BoundOwning(Arc<dyn Fn() + Send + Sync>),
    /// A method bound to a target the task does *not* keep alive. The call
    /// is a no-op if the target has already been dropped.
    BoundWeak(
        Weak<dyn Any + Send + Sync>,
        Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>,
    ),
    /// Any other `FnOnce`, heap-allocated.
    Boxed(Box<dyn FnOnce() + Send>),
}

/// Inline storage for a single `Copy` value no larger than a machine word.
/// Trivially copyable, so it needs none of the custom move/drop plumbing a
/// general inline closure buffer would require.
#[derive(Clone, Copy)]
pub struct InlineWord(usize);

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Task::Empty => "Empty",
            Task::Fn(_) => "Fn",
            Task::Value { .. } => "Value",
            Task::BoundOwning(_) => "BoundOwning",
            Task::BoundWeak(..) => "BoundWeak",
            Task::Boxed(_) => "Boxed",
        };
        f.debug_tuple("Task").field(&shape).finish()
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::Empty
    }
}

/// Reconstructs `T` from `data` and `call_addr` and invokes it. Generated
/// fresh for every distinct `T` via monomorphization, so it never needs to
/// close over anything — the function pointer itself carries no state.
fn value_trampoline<T: Copy + 'static>(data: InlineWord, call_addr: usize) {
    // SAFETY: `call_addr` was produced from a `fn(T)` for this exact `T` by
    // `Task::from_value` below, and function-pointer-to-usize-and-back is
    // valid as long as the pointee type matches, which monomorphization
    // guarantees here.
    let call: fn(T) = unsafe { mem::transmute_copy(&call_addr) };
    // SAFETY: `data` was produced by writing a `T` into the low
    // `size_of::<T>()` bytes of the word in `Task::from_value`, and `T` is
    // `Copy` so reading it back out does not double-drop anything.
    let value: T = unsafe { std::ptr::read(&data.0 as *const usize as *const T) };
    call(value);
}

impl Task {
    /// Wraps a plain free function. Zero allocation, zero captured state.
    pub fn from_fn(f: fn()) -> Task {
        Task::Fn(f)
    }

    /// Wraps a single `Copy` value of up to a machine word together with a
    /// function that consumes it. This is the no-allocation path for the
    /// common "capture one small value" closure shape.
    ///
    /// # Compile errors
    /// Fails to compile, not to run, if `size_of::<T>()` is larger than a
    /// `usize` — oversized values must go through [`Task::from_closure`]
    /// instead. The check is an inline `const` block, so it's evaluated
    /// (and can fail) at the point `T` is monomorphized, before any code
    /// built from this instantiation ever runs.
    pub fn from_value<T: Copy + Send + 'static>(value: T, call: fn(T)) -> Task {
        const {
            assert!(
                mem::size_of::<T>() <= mem::size_of::<usize>(),
                "Task::from_value: T is larger than a machine word; use Task::from_closure instead"
            );
        }
        let mut word: usize = 0;
        // SAFETY: `T` is `Copy` (no drop glue) and fits within the `usize`
        // we're writing into, per the assertion above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                &mut word as *mut usize as *mut u8,
                mem::size_of::<T>(),
            );
        }
        Task::Value {
            data: InlineWord(word),
            call_addr: call as usize,
            trampoline: value_trampoline::<T>,
        }
    }

    /// Wraps a method bound to a target whose lifetime the task extends.
    pub fn bound_owning<F>(call: F) -> Task
    where
        F: Fn() + Send + Sync + 'static,
    {
        Task::BoundOwning(Arc::new(call))
    }

    /// Wraps a method bound to `target` via a weak reference: the call is
    /// skipped if `target` has already been dropped by the time the task
    /// runs.
    pub fn bound_weak<T, F>(target: &Arc<T>, call: F) -> Task
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        let weak_any: Weak<dyn Any + Send + Sync> = weak;
        let trampoline: Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync> =
            Arc::new(move |any: &(dyn Any + Send + Sync)| {
                if let Some(target) = any.downcast_ref::<T>() {
                    call(target);
                }
            });
        Task::BoundWeak(weak_any, trampoline)
    }

    /// Wraps an arbitrary `FnOnce`, heap-allocated. This is the fallback
    /// for anything that doesn't fit the lighter-weight shapes above.
    pub fn from_closure<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Boxed(Box::new(f))
    }

    /// Runs the task, consuming it. A no-op for `Empty` or a `BoundWeak`
    /// whose target has been dropped.
    pub fn run(self) {
        match self {
            Task::Empty => {}
            Task::Fn(f) => f(),
            Task::Value { data, call_addr, trampoline } => trampoline(data, call_addr),
            Task::BoundOwning(f) => f(),
            Task::BoundWeak(target, call) => {
                if let Some(strong) = target.upgrade() {
                    call(&*strong);
                }
            }
            Task::Boxed(f) => f(),
        }
    }
}

// SAFETY: every variant's payload is `Send` (the `Value` variant stores a
// `Copy` value inlined as plain bytes plus two function pointers, none of
// which are thread-affine).
unsafe impl Send for Task {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_task_is_a_noop() {
        Task::Empty.run();
    }

    #[test]
    fn free_function_runs() {
        static HIT: AtomicUsize = AtomicUsize::new(0);
        fn bump() {
            HIT.fetch_add(1, Ordering::SeqCst);
        }
        Task::from_fn(bump).run();
        assert_eq!(HIT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn value_task_roundtrips_small_capture() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn record(v: u32) {
            SEEN.store(v as usize, Ordering::SeqCst);
        }
        Task::from_value(77u32, record).run();
        assert_eq!(SEEN.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn boxed_closure_runs_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let task = Task::from_closure(move || tx.send(42).unwrap());
        task.run();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn bound_owning_keeps_target_alive() {
        let state = Arc::new(AtomicUsize::new(0));
        let captured = state.clone();
        let task = Task::bound_owning(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        drop(state.clone());
        task.run();
        assert_eq!(state.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bound_weak_noop_after_target_dropped() {
        let state = Arc::new(AtomicUsize::new(0));
        let task = Task::bound_weak(&state, |s: &AtomicUsize| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        drop(state);
        // Should not panic or touch freed memory.
        task.run();
    }

    #[test]
    fn bound_weak_runs_while_target_alive() {
        let state = Arc::new(AtomicUsize::new(0));
        let task = Task::bound_weak(&state, |s: &AtomicUsize| {
            s.fetch_add(5, Ordering::SeqCst);
        });
        task.run();
        assert_eq!(state.load(Ordering::SeqCst), 5);
    }
}
