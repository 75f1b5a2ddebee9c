// Cross-platform event reactor.
//
// One public surface over two notification models: readiness (epoll,
// edge-triggered) on Linux and completion (IOCP) on Windows. Registration
// hands the kernel a caller-chosen token; `poll` surfaces events carrying
// that token and dispatches them through a callback. A panicking callback
// is caught here, at the dispatch boundary, and the loop continues with
// the registration intact.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(windows)]
pub mod iocp;

pub mod event_loop;

pub use event_loop::{EventLoop, EventLoopConfig};

use crate::error::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Caller-chosen registration identity surfaced with every event.
pub type Token = u64;

/// Token reserved for the reactor's internal wake channel. Never
/// dispatched.
pub const WAKE_TOKEN: Token = u64::MAX;

/// OS-level socket identity.
#[cfg(unix)]
pub type OsHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type OsHandle = usize;

/// Readiness interest for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl Interest {
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::Both)
    }

    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::Both)
    }
}

/// A single readiness or completion observation.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup on the registration.
    pub is_error: bool,
    /// Bytes transferred, for completion-model backends; zero under
    /// readiness notification.
    pub bytes: usize,
}

#[cfg(target_os = "linux")]
type Backend = epoll::EpollReactor;
#[cfg(windows)]
type Backend = iocp::IocpReactor;

/// The engine's event source. One instance per reactor shard.
pub struct Reactor {
    backend: Backend,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            backend: Backend::new()?,
        })
    }

    /// Register a socket under `token`. On Linux the registration is
    /// edge-triggered: one event per readiness transition, so consumers
    /// must drain until `WouldBlock`. On Windows this associates the
    /// handle with the completion port; callers post their own operations.
    pub fn register(&self, handle: OsHandle, interest: Interest, token: Token) -> Result<()> {
        self.backend.register(handle, interest, token)
    }

    /// Change the interest set of an existing registration.
    pub fn modify(&self, handle: OsHandle, interest: Interest, token: Token) -> Result<()> {
        self.backend.modify(handle, interest, token)
    }

    /// Remove a registration.
    pub fn unregister(&self, handle: OsHandle) -> Result<()> {
        self.backend.unregister(handle)
    }

    /// Wait up to `timeout_ms` (negative = indefinitely) for at most
    /// `max_events` events and dispatch each through `callback`.
    ///
    /// Returns the number of events dispatched. Interrupted waits return
    /// zero. Callback panics are logged and swallowed.
    pub fn poll(
        &self,
        max_events: usize,
        timeout_ms: i32,
        callback: &mut dyn FnMut(Event),
    ) -> Result<usize> {
        let mut events = Vec::with_capacity(max_events);
        self.backend.poll(max_events, timeout_ms, &mut events)?;
        let count = events.len();
        for event in events {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(
                    token = event.token,
                    "event callback panicked; reactor loop continues"
                );
            }
        }
        Ok(count)
    }

    /// Force a concurrent `poll` to return.
    pub fn wake(&self) -> Result<()> {
        self.backend.wake()
    }

    /// Release the backing kernel object. Subsequent operations fail.
    pub fn close(&self) -> Result<()> {
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[cfg(target_os = "linux")]
    fn pipe_pair() -> (OsHandle, OsHandle) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[cfg(target_os = "linux")]
    fn close_fd(fd: OsHandle) {
        unsafe { libc::close(fd) };
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_readable_event_dispatch() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe_pair();
        reactor.register(read_fd, Interest::Readable, 7).unwrap();

        // Nothing readable yet.
        let n = reactor.poll(16, 0, &mut |_| {}).unwrap();
        assert_eq!(n, 0);

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };

        let seen = AtomicUsize::new(0);
        let n = reactor
            .poll(16, 1000, &mut |ev| {
                assert_eq!(ev.token, 7);
                assert!(ev.readable);
                seen.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        reactor.unregister(read_fd).unwrap();
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_edge_trigger_fires_once_per_transition() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe_pair();
        reactor.register(read_fd, Interest::Readable, 1).unwrap();

        unsafe { libc::write(write_fd, b"abc".as_ptr() as *const _, 3) };
        assert_eq!(reactor.poll(16, 1000, &mut |_| {}).unwrap(), 1);
        // Without draining the fd there is no new transition to report.
        assert_eq!(reactor.poll(16, 0, &mut |_| {}).unwrap(), 0);

        reactor.unregister(read_fd).unwrap();
        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_callback_panic_does_not_stop_loop() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe_pair();
        reactor.register(read_fd, Interest::Readable, 3).unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };
        let n = reactor
            .poll(16, 1000, &mut |_| panic!("handler exploded"))
            .unwrap();
        assert_eq!(n, 1);

        // The registration survives: drain, rewrite, observe again.
        let mut drain = [0u8; 8];
        unsafe { libc::read(read_fd, drain.as_mut_ptr() as *mut _, drain.len()) };
        unsafe { libc::write(write_fd, b"y".as_ptr() as *const _, 1) };
        let n = reactor.poll(16, 1000, &mut |_| {}).unwrap();
        assert_eq!(n, 1);

        close_fd(read_fd);
        close_fd(write_fd);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_wake_interrupts_indefinite_poll() {
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        let reactor = Arc::new(Reactor::new().unwrap());
        let r = reactor.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            r.wake().unwrap();
        });

        let start = Instant::now();
        let n = reactor.poll(16, -1, &mut |_| {}).unwrap();
        // The wake token is consumed internally, not dispatched.
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn test_interest_predicates() {
        assert!(Interest::Readable.readable());
        assert!(!Interest::Readable.writable());
        assert!(Interest::Both.readable() && Interest::Both.writable());
    }
}
