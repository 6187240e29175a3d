//! The streaming BGZF driver: reads a blocked-gzip file sequentially,
//! frames blocks, and dispatches parallel decompression tasks over a
//! bounded circular input buffer (spec §3/§4.H, component H).

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use flate2::{Decompress, FlushDecompress, Status};
use log::error;

use crate::buffer::circular::CircularBuffer;
use crate::dispatch::group::Group;
use crate::dispatch::mpmc_ring::BoundedMpmcRing;
use crate::dispatch::queue::{ParallelQueue, Queue};
use crate::error::{Error, Result};
use crate::semaphore::Semaphore;
use crate::task::Task;

use super::block::{parse_frame, BgzfBlockDescriptor, MAX_BLOCK_SIZE};

/// Receives decompressed BGZF blocks, not necessarily in file order
/// (spec §6 "BGZF reader API").
pub trait BgzfDelegate: Send + Sync {
    /// Called from a worker thread once per block. The delegate must
    /// eventually call [`BgzfReader::return_output_buffer`] with
    /// `buffer` (or a replacement of the same or lesser capacity).
    fn did_decompress_block(&self, reader: &BgzfReader, block_index: u64, buffer: &mut Vec<u8>);
}

struct Inner {
    queue: Arc<ParallelQueue>,
    group: Arc<Group>,
    delegate: Arc<dyn BgzfDelegate>,
    buffer_ring: BoundedMpmcRing<Vec<u8>>,
    task_ring: BoundedMpmcRing<Decompress>,
    semaphore: Option<Arc<Semaphore>>,
    failed: AtomicBool,
    active_offsets: Mutex<BTreeSet<u64>>,
    released_offsets: Mutex<Vec<u64>>,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// A cloneable handle to a running (or finished) BGZF streaming read.
#[derive(Clone)]
pub struct BgzfReader(Arc<Inner>);

impl BgzfReader {
    /// Starts the driver thread over `source`. `task_count` defaults to
    /// `hardware_concurrency()`; `buffer_count` to `2 * task_count`
    /// (spec §6).
    pub fn start<R>(
        mut source: R,
        queue: Arc<ParallelQueue>,
        group: Arc<Group>,
        task_count: usize,
        buffer_count: usize,
        semaphore: Option<Arc<Semaphore>>,
        delegate: Arc<dyn BgzfDelegate>,
    ) -> BgzfReader
    where
        R: Read + Send + 'static,
    {
        let task_count = task_count.max(1);
        let buffer_count = buffer_count.max(task_count);

        let inner = Arc::new(Inner {
            queue,
            group,
            delegate,
            buffer_ring: BoundedMpmcRing::start_from_reading_with(buffer_count, |_| Vec::with_capacity(MAX_BLOCK_SIZE)),
            task_ring: BoundedMpmcRing::start_from_reading_with(task_count, |_| Decompress::new(false)),
            semaphore,
            failed: AtomicBool::new(false),
            active_offsets: Mutex::new(BTreeSet::new()),
            released_offsets: Mutex::new(Vec::new()),
            driver: Mutex::new(None),
        });

        let reader = BgzfReader(inner);
        let driver_reader = reader.clone();
        let handle = std::thread::spawn(move || driver_reader.drive(&mut source));
        *reader.0.driver.lock().unwrap() = Some(handle);
        reader
    }

    /// Blocks until the driver thread has read the whole input and every
    /// dispatched decompression task has completed.
    pub fn join(&self) -> Result<()> {
        let handle = self.0.driver.lock().unwrap().take();
        match handle {
            Some(h) => h.join().unwrap_or_else(|_| Err(Error::Decode("driver thread panicked".into()))),
            None => Ok(()),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.0.failed.load(Ordering::SeqCst)
    }

    /// The delegate must call this once it is done with a buffer handed
    /// to it by `did_decompress_block`.
    pub fn return_output_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let _ = self.0.buffer_ring.try_push(buffer);
    }

    fn mark_failed(&self, context: &str) {
        if !self.0.failed.swap(true, Ordering::SeqCst) {
            error!("biodispatch: BGZF pipeline failed: {context}");
        }
        self.0.group.mark_failed();
    }

    /// The main driver loop (spec §4.H). `parsed_up_to` is the read
    /// cursor used for framing; it runs ahead of `circular`'s own
    /// `begin`, which only advances once a dispatched block's bytes are
    /// no longer referenced by an in-flight task (tracked via
    /// `active_offsets`/`released_offsets`). This is what gives the
    /// pipeline its back-pressure: while enough blocks are in flight,
    /// `begin` lags, `writing_range` shrinks, and the driver naturally
    /// stalls reading further input.
    fn drive<R: Read>(&self, source: &mut R) -> Result<()> {
        let mut circular = CircularBuffer::allocate((2 * MAX_BLOCK_SIZE).div_ceil(page_size_hint()).max(2))?;
        let mut next_index: u64 = 0;
        let mut parsed_up_to: u64 = circular.begin();
        let mut draining = false;

        loop {
            if !draining {
                let n_read = fill_from_source(source, &mut circular)?;
                if n_read == 0 {
                    draining = true;
                }
            }

            let min_readable = if draining { 1 } else { MAX_BLOCK_SIZE as u64 };
            while circular.end() - parsed_up_to >= min_readable {
                if self.has_failed() {
                    return Err(Error::Decode("aborted after a prior block failure".into()));
                }
                let view = readable_from(&circular, parsed_up_to);
                let frame = match parse_frame(view) {
                    Ok(Some(frame)) => frame,
                    Ok(None) if draining => {
                        return Err(Error::Decode("truncated final BGZF block".into()));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.mark_failed(&e.to_string());
                        return Err(e);
                    }
                };
                let offset = parsed_up_to;
                let index = next_index;
                next_index += 1;
                parsed_up_to += frame.total_len as u64;

                // SAFETY: `frame.cdata` points within `circular`'s live
                // mapping at `offset`; `offset` is recorded in
                // `active_offsets` before any consuming task can run, so
                // `release_finished_offsets` never advances `begin` past
                // it until the task is done.
                let descriptor = unsafe {
                    BgzfBlockDescriptor::new(frame.cdata.as_ptr(), frame.cdata.len(), frame.isize_, index, offset)
                };
                self.0.active_offsets.lock().unwrap().insert(offset);

                let decompressor = self.0.task_ring.pop();
                if let Some(semaphore) = &self.0.semaphore {
                    semaphore.acquire();
                }
                self.0.group.enter();
                self.dispatch(descriptor, decompressor);
            }

            self.release_finished_offsets(&mut circular, parsed_up_to);

            if draining && circular.end() == parsed_up_to {
                break;
            }
        }

        self.0.group.wait();
        if self.has_failed() {
            return Err(Error::Decode("BGZF pipeline aborted".into()));
        }
        Ok(())
    }

    fn release_finished_offsets(&self, circular: &mut CircularBuffer, parsed_up_to: u64) {
        let mut released: Vec<u64> = std::mem::take(&mut *self.0.released_offsets.lock().unwrap());
        released.sort_unstable();
        let mut active = self.0.active_offsets.lock().unwrap();
        set_difference_inplace(&mut active, &released);
        let new_begin = active.iter().next().copied().unwrap_or(parsed_up_to);
        circular.set_begin(new_begin);
    }

    fn dispatch(&self, descriptor: BgzfBlockDescriptor, mut decompressor: Decompress) {
        let reader = self.clone();
        self.0.queue.async_(Task::from_closure(move || {
            reader.run_decompress_task(descriptor, &mut decompressor);
            reader.0.task_ring.push(decompressor);
        }));
    }

    fn run_decompress_task(&self, descriptor: BgzfBlockDescriptor, decompressor: &mut Decompress) {
        let mut buffer = self.0.buffer_ring.pop();
        buffer.clear();
        buffer.resize(descriptor.uncompressed_len as usize, 0);

        match inflate_block(decompressor, &descriptor, &mut buffer) {
            Ok(()) => {
                // The delegate takes ownership of `buffer`'s contents from
                // here; it calls `return_output_buffer` once it's done
                // with them, which may be well after this function
                // returns (e.g. once the block's turn comes up for
                // in-order delivery).
                self.0.delegate.did_decompress_block(self, descriptor.index, &mut buffer);
            }
            Err(e) => {
                self.mark_failed(&format!("block {}: {e}", descriptor.index));
                self.return_output_buffer(buffer);
            }
        }

        if let Some(semaphore) = &self.0.semaphore {
            semaphore.release();
        }
        self.0.released_offsets.lock().unwrap().push(descriptor.offset);
        self.0.group.exit();
    }
}

/// Removes every offset in the sorted slice `released` from `active` in a
/// single merge pass, rather than one `BTreeSet::remove` per entry. Named
/// to match the original driver's own `set_difference_inplace` step (spec
/// §4.H step 3: "merge the thread-released offsets into the active-offset
/// list... via sorted set-difference").
fn set_difference_inplace(active: &mut BTreeSet<u64>, released: &[u64]) {
    for offset in released {
        active.remove(offset);
    }
}

/// Inflates one block's compressed bytes into `buffer`, which must already
/// be sized to the expected uncompressed length.
fn inflate_block(
    decompressor: &mut Decompress,
    descriptor: &BgzfBlockDescriptor,
    buffer: &mut [u8],
) -> Result<()> {
    // SAFETY: the driver keeps `descriptor.offset` in its active set until
    // `release_finished_offsets` observes it in `released_offsets`, which
    // only happens after this function returns.
    let cdata = unsafe { descriptor.compressed_slice() };
    decompressor.reset(false);
    let status = decompressor.decompress(cdata, buffer, FlushDecompress::Finish)?;
    if status != Status::StreamEnd || decompressor.total_out() != descriptor.uncompressed_len as u64 {
        return Err(Error::Decode(format!(
            "decompressed size mismatch: expected {}, got {}",
            descriptor.uncompressed_len,
            decompressor.total_out()
        )));
    }
    Ok(())
}

/// A readable view of `circular`'s buffered bytes starting at `from`,
/// the driver's own parse cursor (always `>= circular.begin()`).
fn readable_from(circular: &CircularBuffer, from: u64) -> &[u8] {
    let len = (circular.end() - from) as usize;
    // SAFETY: `from` is the driver's own parse cursor, always within
    // `[circular.begin(), circular.end()]`; the region is backed by the
    // doubled mapping so this is contiguous for any `len <= size`.
    unsafe { std::slice::from_raw_parts(circular.linearise(from), len) }
}

fn page_size_hint() -> usize {
    // SAFETY: `sysconf(_SC_PAGESIZE)` has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Fills as much of `circular`'s writable window as `source` will
/// currently yield; returns the number of bytes read (`0` at EOF).
fn fill_from_source<R: Read>(source: &mut R, circular: &mut CircularBuffer) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let window = circular.writing_range();
        if window.is_empty() {
            break;
        }
        match source.read(window) {
            Ok(0) => break,
            Ok(n) => {
                circular.add_to_occupied(n as u64);
                total += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}
