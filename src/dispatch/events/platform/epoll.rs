//! Linux backend: `epoll` for fd readiness, `signalfd` for signals,
//! multiplexed together with the control pipe (spec §9 "the Linux
//! backend must synthesize a unified wait over all descriptor kinds").
//!
//! `timerfd` is not used: timers are driven by [`EventManager::check_timers`]
//! computing the next `epoll_wait` timeout directly, which is simpler and
//! avoids one fd per timer.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{Backend, ControlPipe, ReadyEvent};
use crate::dispatch::events::{Direction, RegistrationKey};

const TOKEN_CONTROL: u64 = 0;
const TOKEN_SIGNALFD: u64 = 1;
const TOKEN_FD_BASE: u64 = 2;

pub(crate) struct EpollBackend {
    epoll_fd: RawFd,
    control: ControlPipe,
    signal_fd: Mutex<Option<RawFd>>,
    watched_signals: Mutex<std::collections::HashSet<i32>>,
    fd_interest: Mutex<HashMap<RawFd, u32>>,
}

unsafe impl Send for EpollBackend {}
unsafe impl Sync for EpollBackend {}

impl EpollBackend {
    fn epoll_add_or_mod(&self, fd: RawFd, events: u32, token: u64, is_new: bool) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let op = if is_new { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        // SAFETY: `ev` is a valid, initialized `epoll_event`.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev as *mut _) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn rebuild_signalfd(&self) -> io::Result<()> {
        let signals = self.watched_signals.lock().unwrap();
        // SAFETY: `mask` is zero-initialized before use by libc calls.
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            for &signal in signals.iter() {
                libc::sigaddset(&mut mask, signal);
            }
            libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        }
        let mut guard = self.signal_fd.lock().unwrap();
        let new_fd = match *guard {
            // SAFETY: `mask` is a valid, initialized sigset.
            Some(existing) => unsafe { libc::signalfd(existing, &mask, libc::SFD_NONBLOCK) },
            None => unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK) },
        };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let is_new = guard.is_none();
        *guard = Some(new_fd);
        drop(guard);
        if is_new {
            self.epoll_add_or_mod(new_fd, libc::EPOLLIN as u32, TOKEN_SIGNALFD, true)?;
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn new() -> io::Result<Self> {
        // SAFETY: no preconditions; `epoll_create1` either returns a
        // valid fd or -1.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let control = ControlPipe::new()?;
        let backend = EpollBackend {
            epoll_fd,
            control,
            signal_fd: Mutex::new(None),
            watched_signals: Mutex::new(std::collections::HashSet::new()),
            fd_interest: Mutex::new(HashMap::new()),
        };
        backend.epoll_add_or_mod(backend.control.read_fd, libc::EPOLLIN as u32, TOKEN_CONTROL, true)?;
        Ok(backend)
    }

    fn register_fd(&self, fd: RawFd, direction: Direction, _key: RegistrationKey) -> io::Result<()> {
        let mut interest = self.fd_interest.lock().unwrap();
        let is_new = !interest.contains_key(&fd);
        let bit = match direction {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        };
        let combined = interest.get(&fd).copied().unwrap_or(0) | bit;
        interest.insert(fd, combined);
        drop(interest);
        self.epoll_add_or_mod(fd, combined, TOKEN_FD_BASE + fd as u64, is_new)
    }

    fn unregister_fd(&self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let mut interest = self.fd_interest.lock().unwrap();
        let bit = match direction {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        };
        let remaining = interest.get(&fd).copied().unwrap_or(0) & !bit;
        if remaining == 0 {
            interest.remove(&fd);
            drop(interest);
            // SAFETY: `fd` was previously registered; `epoll_ctl` with
            // `EPOLL_CTL_DEL` ignores the `event` argument.
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        } else {
            interest.insert(fd, remaining);
            drop(interest);
            self.epoll_add_or_mod(fd, remaining, TOKEN_FD_BASE + fd as u64, false)
        }
    }

    fn register_signal(&self, signal: i32, _key: RegistrationKey) -> io::Result<()> {
        self.watched_signals.lock().unwrap().insert(signal);
        self.rebuild_signalfd()
    }

    fn unregister_signal(&self, signal: i32) -> io::Result<()> {
        self.watched_signals.lock().unwrap().remove(&signal);
        // SAFETY: restoring default disposition for a signal we no
        // longer watch; harmless if it was never blocked by us alone.
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
        }
        self.rebuild_signalfd()
    }

    fn post_control(&self, code: u64) {
        self.control.post(code);
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
        let mut events: [libc::epoll_event; 64] = unsafe { MaybeUninit::zeroed().assume_init() };
        // SAFETY: `events` has capacity 64, matching the `maxevents` arg.
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut ready = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            match ev.u64 {
                TOKEN_CONTROL => {
                    for code in self.control.drain_codes() {
                        ready.push(ReadyEvent::Control(code));
                    }
                }
                TOKEN_SIGNALFD => {
                    if let Some(fd) = *self.signal_fd.lock().unwrap() {
                        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
                        loop {
                            // SAFETY: `info` is sized exactly for one
                            // `signalfd_siginfo` record.
                            let n = unsafe {
                                libc::read(
                                    fd,
                                    &mut info as *mut _ as *mut libc::c_void,
                                    std::mem::size_of::<libc::signalfd_siginfo>(),
                                )
                            };
                            if n <= 0 {
                                break;
                            }
                            ready.push(ReadyEvent::Source(RegistrationKey::Signal(info.ssi_signo as i32)));
                        }
                    }
                }
                token => {
                    let fd = (token - TOKEN_FD_BASE) as RawFd;
                    if ev.events & libc::EPOLLIN as u32 != 0 {
                        ready.push(ReadyEvent::Source(RegistrationKey::Fd(fd, Direction::Read)));
                    }
                    if ev.events & libc::EPOLLOUT as u32 != 0 {
                        ready.push(ReadyEvent::Source(RegistrationKey::Fd(fd, Direction::Write)));
                    }
                }
            }
        }
        Ok(ready)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: `epoll_fd` was created by this struct.
        unsafe {
            libc::close(self.epoll_fd);
        }
        if let Some(fd) = *self.signal_fd.lock().unwrap() {
            // SAFETY: `fd` was created by `signalfd` in this struct.
            unsafe {
                libc::close(fd);
            }
        }
    }
}
