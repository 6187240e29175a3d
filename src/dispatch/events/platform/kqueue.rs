//! BSD-family backend: a single `kqueue` fd multiplexes fd readiness,
//! signals, and the control pipe natively (spec §9 "the kqueue backend
//! multiplexes everything through a single kqueue fd").

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, ControlPipe, ReadyEvent};
use crate::dispatch::events::{Direction, RegistrationKey};

pub(crate) struct KqueueBackend {
    kq: RawFd,
    control: ControlPipe,
}

unsafe impl Send for KqueueBackend {}
unsafe impl Sync for KqueueBackend {}

fn kevent_change(kq: RawFd, ident: usize, filter: i16, flags: u16) -> io::Result<()> {
    let mut change = libc::kevent {
        ident,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    };
    // SAFETY: `change` is a single, fully initialized `kevent`.
    let rc = unsafe { libc::kevent(kq, &mut change, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Backend for KqueueBackend {
    fn new() -> io::Result<Self> {
        // SAFETY: no preconditions; returns a valid fd or -1.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let control = ControlPipe::new()?;
        kevent_change(kq, control.read_fd as usize, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)?;
        Ok(KqueueBackend { kq, control })
    }

    fn register_fd(&self, fd: RawFd, direction: Direction, _key: RegistrationKey) -> io::Result<()> {
        let filter = match direction {
            Direction::Read => libc::EVFILT_READ,
            Direction::Write => libc::EVFILT_WRITE,
        };
        kevent_change(self.kq, fd as usize, filter, libc::EV_ADD | libc::EV_ENABLE)
    }

    fn unregister_fd(&self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let filter = match direction {
            Direction::Read => libc::EVFILT_READ,
            Direction::Write => libc::EVFILT_WRITE,
        };
        kevent_change(self.kq, fd as usize, filter, libc::EV_DELETE)
    }

    fn register_signal(&self, signal: i32, _key: RegistrationKey) -> io::Result<()> {
        // SAFETY: blocking normal delivery so the process isn't
        // terminated by the signal's default disposition; `kqueue`
        // still observes it via `EVFILT_SIGNAL` regardless.
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);
            libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        }
        kevent_change(self.kq, signal as usize, libc::EVFILT_SIGNAL, libc::EV_ADD | libc::EV_ENABLE)
    }

    fn unregister_signal(&self, signal: i32) -> io::Result<()> {
        kevent_change(self.kq, signal as usize, libc::EVFILT_SIGNAL, libc::EV_DELETE)?;
        // SAFETY: restoring delivery for a signal we no longer watch.
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
        }
        Ok(())
    }

    fn post_control(&self, code: u64) {
        self.control.post(code);
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const libc::timespec).unwrap_or(std::ptr::null());
        let mut events: [libc::kevent; 64] = unsafe { MaybeUninit::zeroed().assume_init() };
        // SAFETY: `events` has capacity 64, matching `nevents`.
        let n = unsafe { libc::kevent(self.kq, std::ptr::null(), 0, events.as_mut_ptr(), events.len() as i32, ts_ptr) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut ready = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            if ev.ident as RawFd == self.control.read_fd && ev.filter == libc::EVFILT_READ {
                for code in self.control.drain_codes() {
                    ready.push(ReadyEvent::Control(code));
                }
            } else if ev.filter == libc::EVFILT_SIGNAL {
                ready.push(ReadyEvent::Source(RegistrationKey::Signal(ev.ident as i32)));
            } else if ev.filter == libc::EVFILT_READ {
                ready.push(ReadyEvent::Source(RegistrationKey::Fd(ev.ident as RawFd, Direction::Read)));
            } else if ev.filter == libc::EVFILT_WRITE {
                ready.push(ReadyEvent::Source(RegistrationKey::Fd(ev.ident as RawFd, Direction::Write)));
            }
        }
        Ok(ready)
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // SAFETY: `kq` was created by this struct.
        unsafe {
            libc::close(self.kq);
        }
    }
}
