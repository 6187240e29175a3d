//! Platform backend selection (spec §4.F "Platform contract") plus a
//! shared self-pipe control channel used by both backends to carry
//! `stop`/`wake_up` codes (spec §6 "Internal event codes") through the
//! same OS wait primitive as fd/signal readiness.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{Direction, RegistrationKey};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(not(target_os = "linux"))]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::EpollBackend as PlatformBackend;
#[cfg(not(target_os = "linux"))]
pub(crate) use kqueue::KqueueBackend as PlatformBackend;

/// What `Backend::wait` found ready.
pub(crate) enum ReadyEvent {
    /// A code posted via `Backend::post_control` (spec's `stop`/`wake_up`).
    Control(u64),
    /// A previously registered fd or signal source fired.
    Source(RegistrationKey),
}

pub(crate) trait Backend: Sized + Send + Sync {
    fn new() -> io::Result<Self>;
    fn register_fd(&self, fd: RawFd, direction: Direction, key: RegistrationKey) -> io::Result<()>;
    fn unregister_fd(&self, fd: RawFd, direction: Direction) -> io::Result<()>;
    fn register_signal(&self, signal: i32, key: RegistrationKey) -> io::Result<()>;
    fn unregister_signal(&self, signal: i32) -> io::Result<()>;
    fn post_control(&self, code: u64);
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>>;
}

/// A `pipe(2)`-based channel for posting small control codes to a
/// backend's wait primitive, readable like any other fd source.
pub(super) struct ControlPipe {
    pub(super) read_fd: RawFd,
    write_fd: RawFd,
    pending: Mutex<VecDeque<u64>>,
}

impl ControlPipe {
    pub(super) fn new() -> io::Result<ControlPipe> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `fds` is a valid pointer to two `RawFd`-sized slots.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fds[0]`/`fds[1]` are freshly created, valid fds.
        unsafe {
            let read_flags = libc::fcntl(fds[0], libc::F_GETFL);
            libc::fcntl(fds[0], libc::F_SETFL, read_flags | libc::O_NONBLOCK);
        }
        Ok(ControlPipe { read_fd: fds[0], write_fd: fds[1], pending: Mutex::new(VecDeque::new()) })
    }

    pub(super) fn post(&self, code: u64) {
        self.pending.lock().unwrap().push_back(code);
        let byte: [u8; 1] = [0];
        // SAFETY: `write_fd` is a valid, open pipe write end; a short
        // write of one byte cannot fail partially.
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Drains every byte currently available on the pipe and returns the
    /// queued codes posted since the last drain (one code need not map
    /// 1:1 to one byte; we only use the pipe to wake the wait primitive).
    pub(super) fn drain_codes(&self) -> Vec<u64> {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: `buf` is a valid buffer of the given length.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
        self.pending.lock().unwrap().drain(..).collect()
    }
}

impl Drop for ControlPipe {
    fn drop(&mut self) {
        // SAFETY: both fds were created by this struct and not shared.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
