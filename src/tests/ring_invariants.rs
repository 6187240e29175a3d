//! Property-based tests of spec §8's "MPMC ring FIFO" and "Ring bounded"
//! invariants. The original source uses `rapidcheck`
//! (`include/libbio/rapidcheck/markov_chain.hh`) to property-test
//! concurrency structures the same shape as this one; `proptest` is its
//! Rust-ecosystem counterpart (SPEC_FULL §2.4).

use std::collections::VecDeque;

use proptest::prelude::*;

use crate::dispatch::mpmc_ring::BoundedMpmcRing;

#[derive(Debug, Clone, Copy)]
enum Op {
    Push(u32),
    Pop,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u32>().prop_map(Op::Push), Just(Op::Pop)]
}

proptest! {
    /// Drives a single-threaded `Push`/`Pop` script against both the ring
    /// and a `VecDeque` model; at every step the ring's visible state
    /// (what `try_pop` yields, its length) must agree with the model, and
    /// the ring must never report more items queued than its capacity.
    #[test]
    fn fifo_and_bounded_under_arbitrary_interleaving(ops in prop::collection::vec(op_strategy(), 0..500)) {
        let ring: BoundedMpmcRing<u32> = BoundedMpmcRing::with_capacity(8);
        let mut model: VecDeque<u32> = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(v) => {
                    if model.len() < ring.capacity() {
                        prop_assert!(ring.try_push(v).is_ok());
                        model.push_back(v);
                    } else {
                        prop_assert_eq!(ring.try_push(v), Err(v));
                    }
                }
                Op::Pop => {
                    prop_assert_eq!(ring.try_pop(), model.pop_front());
                }
            }
            prop_assert!(ring.len() <= ring.capacity());
            prop_assert_eq!(ring.len(), model.len());
        }
    }
}
