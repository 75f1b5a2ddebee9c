// Linux readiness backend: edge-triggered epoll plus an eventfd wake
// channel.

use super::{Event, Interest, OsHandle, Token, WAKE_TOKEN};
use crate::error::{Result, WsError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct EpollReactor {
    epfd: OsHandle,
    wake_fd: OsHandle,
    closed: AtomicBool,
}

// The fds are used through &self with kernel-side synchronisation.
unsafe impl Send for EpollReactor {}
unsafe impl Sync for EpollReactor {}

fn interest_flags(interest: Interest) -> u32 {
    let mut flags = (libc::EPOLLET | libc::EPOLLRDHUP) as u32;
    if interest.readable() {
        flags |= libc::EPOLLIN as u32;
    }
    if interest.writable() {
        flags |= libc::EPOLLOUT as u32;
    }
    flags
}

fn last_os_error() -> WsError {
    WsError::TransportIo(io::Error::last_os_error())
}

impl EpollReactor {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let reactor = Self {
            epfd,
            wake_fd,
            closed: AtomicBool::new(false),
        };
        reactor.register(wake_fd, Interest::Readable, WAKE_TOKEN)?;
        Ok(reactor)
    }

    fn ctl(&self, op: i32, fd: OsHandle, interest: Interest, token: Token) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_flags(interest),
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn register(&self, fd: OsHandle, interest: Interest, token: Token) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    pub fn modify(&self, fd: OsHandle, interest: Interest, token: Token) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    pub fn unregister(&self, fd: OsHandle) -> Result<()> {
        let rc =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub fn poll(&self, max_events: usize, timeout_ms: i32, out: &mut Vec<Event>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WsError::Closed);
        }

        let max = max_events.max(1).min(1024);
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(max);

        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), max as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A signal arriving mid-wait is not an error.
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(WsError::TransportIo(err));
        }
        unsafe { raw.set_len(n as usize) };

        for ev in &raw {
            let token = ev.u64;
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            out.push(Event {
                token,
                readable: ev.events & libc::EPOLLIN as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                is_error: ev.events
                    & (libc::EPOLLERR as u32
                        | libc::EPOLLHUP as u32
                        | libc::EPOLLRDHUP as u32)
                    != 0,
                bytes: 0,
            });
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut counter = 0u64;
        unsafe {
            libc::read(
                self.wake_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    pub fn wake(&self) -> Result<()> {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // A saturated eventfd counter still wakes the poller.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(WsError::TransportIo(err));
            }
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.epfd);
                libc::close(self.wake_fd);
            }
        }
        Ok(())
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
