//! A bounded, lock-free multi-producer multi-consumer ring (spec §3/§4.B,
//! component B).
//!
//! This is a ticket-based (Dekker-style) ring: every `push` and `pop`
//! contends for the next ticket from a monotonically increasing counter
//! via compare-and-swap, but only succeeds in claiming it once the cell at
//! `ticket mod capacity` is confirmed ready (its turn counter matches).
//! Blocking variants loop; `try_*` variants make one attempt and return
//! immediately, which is what lets a single thread pool worker poll
//! several queues without blocking on any one of them.
//!
//! Waiting parks the thread via a futex-style atomic wait (the
//! `atomic-wait` crate) rather than spinning. Spec §3 describes 64-bit
//! turn counters; this implementation uses 32-bit ones so the
//! `atomic-wait` primitive (like Linux's `futex(2)`, built on 32-bit
//! words) applies directly — see DESIGN.md for why the wraparound is
//! still exact.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use atomic_wait::{wait, wake_one};
use crossbeam_utils::CachePadded;

struct Cell<T> {
    turn: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: access to `value` is serialized by the turn protocol: only one
// thread may write a given cell's value while its turn is "empty", and
// only one thread may read it while the turn is "full".
unsafe impl<T: Send> Sync for Cell<T> {}

/// A bounded multi-producer multi-consumer queue with strict FIFO ordering
/// by ticket.
pub struct BoundedMpmcRing<T> {
    mask: usize,
    cells: Box<[Cell<T>]>,
    reader: CachePadded<AtomicU64>,
    writer: CachePadded<AtomicU64>,
    len: CachePadded<std::sync::atomic::AtomicIsize>,
}

// SAFETY: `T: Send` is required to move values between threads; the ring
// itself contains no non-atomic shared state outside of `Cell`.
unsafe impl<T: Send> Send for BoundedMpmcRing<T> {}
unsafe impl<T: Send> Sync for BoundedMpmcRing<T> {}

impl<T> BoundedMpmcRing<T> {
    /// Creates an empty ring. `capacity` is rounded up to the next power of
    /// two if it isn't one already.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new_with_initial_turn(capacity, 0, 0, 0)
    }

    /// Creates a ring whose first `capacity` operations must be pops: the
    /// backing cells are pre-populated by `init` as though `capacity`
    /// pushes had already happened, without requiring a real `push` call.
    /// Used for queues that start out "full" of reusable resources, e.g. a
    /// pool of output buffers (spec §4.B "start_from_reading").
    pub fn start_from_reading_with<F>(capacity: usize, mut init: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let ring = Self::new_with_initial_turn(capacity, 1, capacity as u64, 0);
        ring.len.store(capacity as isize, Ordering::Relaxed);
        for (i, cell) in ring.cells.iter().enumerate() {
            // SAFETY: no pop can observe a cell before this function
            // returns (the ring isn't shared yet), and every cell's turn
            // was set to `1` ("full") by construction, matching the value
            // we are about to write.
            unsafe {
                (*cell.value.get()).write(init(i));
            }
        }
        ring
    }

    fn new_with_initial_turn(
        capacity: usize,
        initial_turn: u32,
        writer_start: u64,
        reader_start: u64,
    ) -> Self {
        let capacity = capacity.next_power_of_two();
        let cells = (0..capacity)
            .map(|_| Cell {
                turn: AtomicU32::new(initial_turn),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BoundedMpmcRing {
            mask: capacity - 1,
            cells,
            reader: CachePadded::new(AtomicU64::new(reader_start)),
            writer: CachePadded::new(AtomicU64::new(writer_start)),
            len: CachePadded::new(std::sync::atomic::AtomicIsize::new(0)),
        }
    }

    /// Number of slots. Always a power of two.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of values currently queued. Exact at the instant it's read,
    /// but may be stale by the time the caller acts on it.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lap_turn(ticket: u64, capacity: u64, offset: u64) -> u32 {
        let lap = ticket / capacity;
        (2 * lap + offset) as u32
    }

    /// Attempts to claim the next write ticket. Returns `None` without
    /// side effects if the ring is currently full.
    fn try_claim_push(&self) -> Option<(usize, u32)> {
        loop {
            let ticket = self.writer.load(Ordering::Relaxed);
            let pos = ticket as usize & self.mask;
            let target_turn = Self::lap_turn(ticket, self.mask as u64 + 1, 0);
            let cell = &self.cells[pos];
            if cell.turn.load(Ordering::Acquire) != target_turn {
                return None;
            }
            if self
                .writer
                .compare_exchange_weak(ticket, ticket.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some((pos, target_turn));
            }
        }
    }

    /// Attempts to claim the next read ticket. Returns `None` without side
    /// effects if the ring is currently empty.
    fn try_claim_pop(&self) -> Option<(usize, u32)> {
        loop {
            let ticket = self.reader.load(Ordering::Relaxed);
            let pos = ticket as usize & self.mask;
            let target_turn = Self::lap_turn(ticket, self.mask as u64 + 1, 1);
            let cell = &self.cells[pos];
            if cell.turn.load(Ordering::Acquire) != target_turn {
                return None;
            }
            if self
                .reader
                .compare_exchange_weak(ticket, ticket.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some((pos, target_turn));
            }
        }
    }

    /// Pushes a value if the ring has room; otherwise returns `value`
    /// back to the caller without blocking.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        match self.try_claim_push() {
            Some((pos, turn)) => {
                let cell = &self.cells[pos];
                // SAFETY: the CAS above is the unique claim on this turn
                // of this cell; no other thread may write it concurrently.
                unsafe {
                    (*cell.value.get()).write(value);
                }
                cell.turn.store(turn.wrapping_add(1), Ordering::Release);
                self.len.fetch_add(1, Ordering::SeqCst);
                wake_one(&cell.turn);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Pops a value if one is available; otherwise returns `None` without
    /// blocking.
    pub fn try_pop(&self) -> Option<T> {
        let (pos, turn) = self.try_claim_pop()?;
        let cell = &self.cells[pos];
        // SAFETY: the CAS above is the unique claim on this turn of this
        // cell; no other thread may read or retire it concurrently.
        let value = unsafe { (*cell.value.get()).assume_init_read() };
        cell.turn.store(turn.wrapping_add(1), Ordering::Release);
        self.len.fetch_sub(1, Ordering::SeqCst);
        wake_one(&cell.turn);
        Some(value)
    }

    /// Pushes a value, blocking while the ring is full.
    pub fn push(&self, mut value: T) {
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(v) => value = v,
            }
            let ticket = self.writer.load(Ordering::Relaxed);
            let pos = ticket as usize & self.mask;
            let target_turn = Self::lap_turn(ticket, self.mask as u64 + 1, 0);
            let cell = &self.cells[pos];
            let observed = cell.turn.load(Ordering::Acquire);
            if observed != target_turn {
                wait(&cell.turn, observed);
            }
        }
    }

    /// Pops a value, blocking while the ring is empty.
    pub fn pop(&self) -> T {
        loop {
            if let Some(v) = self.try_pop() {
                return v;
            }
            let ticket = self.reader.load(Ordering::Relaxed);
            let pos = ticket as usize & self.mask;
            let target_turn = Self::lap_turn(ticket, self.mask as u64 + 1, 1);
            let cell = &self.cells[pos];
            let observed = cell.turn.load(Ordering::Acquire);
            if observed != target_turn {
                wait(&cell.turn, observed);
            }
        }
    }
}

impl<T> Drop for BoundedMpmcRing<T> {
    fn drop(&mut self) {
        // Any cell whose turn is "full" (odd relative to its lap's base)
        // still holds a live, undropped value; every other cell is empty.
        for cell in self.cells.iter() {
            let turn = cell.turn.load(Ordering::Relaxed);
            if turn % 2 == 1 {
                // SAFETY: an odd turn means the last operation on this
                // cell was a `push` that was never matched by a `pop`, so
                // the slot holds a valid, not-yet-read `T`.
                unsafe {
                    (*cell.value.get()).assume_init_drop();
                }
            }
        }
    }
}
