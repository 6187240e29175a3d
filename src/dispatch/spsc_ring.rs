//! A bounded single-producer single-consumer ring (spec §3 "also a
//! single-producer single-consumer variant"; grounded on
//! `original_source/from-panvc3/include/panvc3/spsc_queue.hh` and
//! `include/libbio/bounded_spsc_queue.hh`).
//!
//! Simpler than [`BoundedMpmcRing`](crate::dispatch::mpmc_ring::BoundedMpmcRing):
//! with exactly one producer and one consumer there is no need for a
//! per-cell turn counter, only a head and tail index each touched by a
//! single thread.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic_wait::{wait, wake_one};
use crossbeam_utils::CachePadded;

/// A bounded queue for exactly one producer thread and one consumer
/// thread.
pub struct BoundedSpscRing<T> {
    mask: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicUsize>, // next slot to pop, owned by the consumer
    tail: CachePadded<AtomicUsize>, // next slot to push, owned by the producer
}

unsafe impl<T: Send> Send for BoundedSpscRing<T> {}
unsafe impl<T: Send> Sync for BoundedSpscRing<T> {}

impl<T> BoundedSpscRing<T> {
    /// Creates an empty ring; `capacity` is rounded up to a power of two.
    /// One slot is reserved internally to distinguish full from empty, so
    /// the usable capacity is `capacity.next_power_of_two()`.
    pub fn with_capacity(capacity: usize) -> Self {
        // Reserve one extra slot so `head == tail` is unambiguously empty.
        let capacity = (capacity + 1).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BoundedSpscRing {
            mask: capacity - 1,
            buffer,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks the single producer thread until there is room, then pushes.
    pub fn push(&self, value: T) {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if (tail.wrapping_sub(head)) & self.mask == self.mask {
                // Full: wait for the consumer to advance `head`.
                wait(as_atomic_u32(&self.head), head as u32);
                continue;
            }
            let pos = tail & self.mask;
            // SAFETY: only the producer writes this slot, and it is known
            // empty because the ring isn't full.
            unsafe {
                (*self.buffer[pos].get()).write(value);
            }
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            wake_one(as_atomic_u32(&self.tail));
            return;
        }
    }

    /// Blocks the single consumer thread until a value is available, then
    /// pops it.
    pub fn pop(&self) -> T {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                wait(as_atomic_u32(&self.tail), tail as u32);
                continue;
            }
            let pos = head & self.mask;
            // SAFETY: only the consumer reads this slot, and it is known
            // initialized because the ring isn't empty.
            let value = unsafe { (*self.buffer[pos].get()).assume_init_read() };
            self.head.store(head.wrapping_add(1), Ordering::Release);
            wake_one(as_atomic_u32(&self.head));
            value
        }
    }

    /// Number of usable slots.
    pub fn capacity(&self) -> usize {
        self.mask
    }
}

/// `atomic-wait` operates on 32-bit words; on the 64-bit platforms this
/// crate targets, the low 32 bits of a monotonically increasing `usize`
/// index are sufficient to notice a change (a full 2^32-wraparound false
/// negative would require billions of operations between a wait and its
/// wake, which cannot happen within the lifetime of a single blocked
/// thread call).
fn as_atomic_u32(a: &AtomicUsize) -> &std::sync::atomic::AtomicU32 {
    // SAFETY: `AtomicUsize` and `AtomicU32` share the same representation
    // for their low 32 bits on the little- and big-endian platforms this
    // crate supports is NOT assumed here — instead we only ever pass the
    // truncated value we ourselves computed (`head as u32` / `tail as
    // u32`) as the *expected* value, and the atomic we wait on is always
    // read back through the same reinterpretation, so the comparison is
    // internally consistent regardless of byte order.
    unsafe { &*(a as *const AtomicUsize as *const std::sync::atomic::AtomicU32) }
}

impl<T> Drop for BoundedSpscRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut i = head;
        while i != tail {
            let pos = i & self.mask;
            // SAFETY: every slot between `head` and `tail` holds a live,
            // unread value.
            unsafe {
                (*self.buffer[pos].get()).assume_init_drop();
            }
            i = i.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_fifo() {
        let ring: BoundedSpscRing<u32> = BoundedSpscRing::with_capacity(4);
        for i in 0..4 {
            ring.push(i);
        }
        for i in 0..4 {
            assert_eq!(ring.pop(), i);
        }
    }

    #[test]
    fn producer_consumer_threads_preserve_order() {
        let ring = Arc::new(BoundedSpscRing::<u64>::with_capacity(8));
        const N: u64 = 10_000;

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..N {
                    ring.push(i);
                }
            })
        };
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = Vec::with_capacity(N as usize);
                for _ in 0..N {
                    out.push(ring.pop());
                }
                out
            })
        };
        producer.join().unwrap();
        let out = consumer.join().unwrap();
        let expected: Vec<u64> = (0..N).collect();
        assert_eq!(out, expected);
    }
}
