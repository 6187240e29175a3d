//! A double-mapped circular byte buffer (spec §3/§4.G, component G).
//!
//! The region is `2·N·page_size` bytes: the same physical pages are
//! mapped twice, back to back, so any read or write of up to
//! `N·page_size` bytes starting anywhere in `[0, N·page_size)` is
//! contiguous in virtual memory even when it wraps past the end of the
//! first mapping. This is the trick `ocl`'s buffer-mapping commands rely
//! on at the OpenCL level, replicated here with a raw POSIX `mmap`
//! double-mapping instead of a driver-provided one.

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A contiguous ring over page-granular storage, doubled in virtual
/// memory so a window never needs a wraparound split.
pub struct CircularBuffer {
    base: NonNull<u8>,
    size: usize, // N * page_size; always a power of two
    mask: usize,
    begin: u64,
    end: u64,
}

// SAFETY: the mapped region is exclusively owned by this buffer; the
// buffer is single-writer, multi-reader by contract (spec §5), and
// callers are responsible for synchronizing access to the returned
// slices across threads.
unsafe impl Send for CircularBuffer {}

impl CircularBuffer {
    /// Allocates a double-mapped region covering `page_count` pages,
    /// rounded up to a power of two.
    pub fn allocate(page_count: usize) -> Result<CircularBuffer> {
        let page_size = page_size();
        let page_count = page_count.max(1).next_power_of_two();
        let size = page_count * page_size;

        let name = std::ffi::CString::new("biodispatch-circular-buffer").unwrap();
        // SAFETY: `memfd_create` with no flags creates an anonymous,
        // unlinked file descriptor usable only by this process.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if fd < 0 {
            return Err(Error::ResourceExhausted(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: `fd` is a valid, freshly created fd; `ftruncate` sizes
        // the backing storage before it is mapped.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::ResourceExhausted(format!("ftruncate failed: {err}")));
        }

        // Reserve `2 * size` bytes of address space, then map the same
        // fd twice into the first and second half.
        // SAFETY: `mmap` with `PROT_NONE`/`MAP_ANONYMOUS` reserves a
        // placeholder region without touching the fd; the two
        // subsequent `MAP_FIXED` mappings replace sub-ranges of it with
        // the real backing storage.
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                2 * size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::ResourceExhausted(format!("mmap reservation failed: {err}")));
        }

        let map_half = |offset: usize| -> Result<()> {
            // SAFETY: `reservation + offset` lies within the just-reserved
            // `2 * size` region; `MAP_FIXED` replaces that sub-range with
            // a mapping of `fd`, which is valid for `size` bytes.
            let ptr = unsafe {
                libc::mmap(
                    (reservation as usize + offset) as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::ResourceExhausted(format!(
                    "mmap double-mapping failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        };
        map_half(0)?;
        map_half(size)?;

        // SAFETY: the fd's contents are fully captured by the two
        // mappings; closing it does not unmap them.
        unsafe {
            libc::close(fd);
        }

        Ok(CircularBuffer {
            // SAFETY: `reservation` is non-null on success (checked
            // above via `MAP_FAILED`, which is never the null pointer).
            base: unsafe { NonNull::new_unchecked(reservation as *mut u8) },
            size,
            mask: size - 1,
            begin: 0,
            end: 0,
        })
    }

    /// Translates a logical (possibly `> size`) offset into a pointer
    /// into the doubled region. `linearise(p)` and `linearise(p + size)`
    /// refer to the same bytes (spec §8 "Circular buffer doubling").
    pub fn linearise(&self, pos: u64) -> *mut u8 {
        // SAFETY: the result stays within the `2 * size` reservation
        // because `pos & mask` is in `[0, size)`.
        unsafe { self.base.as_ptr().add((pos & self.mask as u64) as usize) }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently available to read.
    pub fn occupied(&self) -> u64 {
        self.end - self.begin
    }

    /// Bytes currently available to write before the buffer is full.
    pub fn available(&self) -> u64 {
        self.size as u64 - self.occupied()
    }

    /// A contiguous, readable slice covering `[begin, end)`.
    pub fn reading_range(&self) -> &[u8] {
        let len = self.occupied() as usize;
        // SAFETY: `[begin, begin+len)` is within one `size`-length
        // window of the doubled mapping, hence contiguous; this range
        // was previously written by `writing_range` callers honoring
        // `add_to_occupied`.
        unsafe { std::slice::from_raw_parts(self.linearise(self.begin), len) }
    }

    /// A contiguous, writable slice covering `[end, begin + size)`.
    pub fn writing_range(&mut self) -> &mut [u8] {
        let len = self.available() as usize;
        // SAFETY: see `reading_range`; the writable window never
        // exceeds `size` bytes starting at `end`.
        unsafe { std::slice::from_raw_parts_mut(self.linearise(self.end), len) }
    }

    /// Call after writing `n` bytes into `writing_range()`.
    pub fn add_to_occupied(&mut self, n: u64) {
        debug_assert!(n <= self.available(), "add_to_occupied exceeds available space");
        self.end += n;
    }

    /// Call after consuming `n` bytes from `reading_range()`. Included
    /// for symmetry with `add_to_occupied`; most callers instead use
    /// `set_begin` once a driver's offset-lifetime bookkeeping decides
    /// how far `begin` may advance.
    pub fn add_to_available(&mut self, n: u64) {
        self.set_begin(self.begin + n);
    }

    /// Advances `begin` to `new_begin`, releasing the bytes before it.
    pub fn set_begin(&mut self, new_begin: u64) {
        debug_assert!(new_begin >= self.begin, "begin must not decrease");
        debug_assert!(new_begin <= self.end, "begin must not pass end");
        self.begin = new_begin;
    }

    /// Resets to empty without releasing the mapping.
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

impl Drop for CircularBuffer {
    fn drop(&mut self) {
        // SAFETY: `base` points to the `2 * size` region this buffer
        // exclusively owns.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, 2 * self.size);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf(_SC_PAGESIZE)` has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_page_count_up_to_power_of_two() {
        let buf = CircularBuffer::allocate(3).expect("allocate");
        assert_eq!(buf.size(), 4 * page_size());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = CircularBuffer::allocate(1).expect("allocate");
        let payload = b"hello circular buffer";
        buf.writing_range()[..payload.len()].copy_from_slice(payload);
        buf.add_to_occupied(payload.len() as u64);
        assert_eq!(&buf.reading_range()[..payload.len()], payload);
        buf.add_to_available(payload.len() as u64);
        assert_eq!(buf.occupied(), 0);
    }

    #[test]
    fn doubling_makes_a_wrapping_window_contiguous() {
        let mut buf = CircularBuffer::allocate(1).expect("allocate");
        let size = buf.size() as u64;
        // Advance begin/end to straddle the wraparound point without
        // ever exceeding capacity.
        let near_end = size - 8;
        buf.add_to_occupied(near_end);
        buf.add_to_available(near_end);
        assert_eq!(buf.begin(), near_end);
        assert_eq!(buf.end(), near_end);

        let payload: Vec<u8> = (0..16u8).collect();
        buf.writing_range()[..16].copy_from_slice(&payload);
        buf.add_to_occupied(16);
        // This read starts 8 bytes before the end of the first mapping
        // and runs 8 bytes into the second; it must come back contiguous.
        assert_eq!(&buf.reading_range()[..16], &payload[..]);
    }

    #[test]
    fn linearise_of_pos_and_pos_plus_size_agree() {
        let buf = CircularBuffer::allocate(1).expect("allocate");
        let size = buf.size() as u64;
        for p in [0u64, 1, size / 2, size - 1] {
            // SAFETY: reading one byte at each pointer purely for
            // pointer-identity comparison, not dereferencing memory
            // whose contents matter here.
            unsafe {
                assert_eq!(
                    buf.linearise(p).offset_from(buf.linearise(p + size)),
                    0,
                    "linearise(p) and linearise(p+size) must be the same address"
                );
            }
        }
    }
}
