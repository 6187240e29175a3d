//! Cooperative task dispatch: queues, a thread pool, and the
//! synchronization primitives that hold them together (spec §3/§4).

pub mod mpmc_ring;
pub mod spsc_ring;

#[cfg(feature = "barrier")]
pub mod barrier;

pub mod group;
pub mod queue;
pub mod thread_pool;

pub mod events;

pub use group::Group;
pub use queue::{MainQueue, ParallelQueue, Queue, SerialQueue};
pub use thread_pool::ThreadPool;
