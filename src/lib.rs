//! A cooperative task-dispatch runtime — thread pool, queues, a group
//! synchronizer, and an OS event manager — plus a streaming BGZF/BAM
//! reader pipeline built on top of it.

pub mod bam;
pub mod bgzf;
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod semaphore;
pub mod task;

pub use bam::{BamDelegate, BamFlags, BamHeader, InOrderReader, Record, ReferenceSequence};
pub use bgzf::{BgzfDelegate, BgzfReader};
pub use buffer::CircularBuffer;
pub use dispatch::events::{EventManager, Source, SourceHandle, TimerHandle};
pub use dispatch::{Group, MainQueue, ParallelQueue, Queue, SerialQueue, ThreadPool};
pub use error::{Error, Result};
pub use semaphore::Semaphore;
pub use task::Task;

#[cfg(feature = "barrier")]
pub use dispatch::barrier::Barrier;

#[cfg(test)]
mod tests;
