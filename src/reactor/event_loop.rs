// Batched event dispatch with adaptive backoff.
//
// While traffic flows the loop polls with a zero timeout and dispatches
// full batches; when the reactor goes quiet the poll timeout doubles up to
// a ceiling so an idle shard costs a handful of wakeups per second instead
// of a busy spin.

use super::{Event, Reactor};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event loop configuration
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Events dispatched per poll.
    pub batch_size: usize,

    /// Idle poll timeout ceiling in milliseconds.
    pub max_idle_timeout_ms: i32,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_idle_timeout_ms: 10,
        }
    }
}

/// Drives a `Reactor` until stopped.
pub struct EventLoop {
    reactor: Arc<Reactor>,
    config: EventLoopConfig,
    stop: AtomicBool,
}

impl EventLoop {
    pub fn new(reactor: Arc<Reactor>, config: EventLoopConfig) -> Self {
        Self {
            reactor,
            config,
            stop: AtomicBool::new(false),
        }
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Poll-and-dispatch until `stop` is raised. Returns the total number
    /// of events dispatched over the loop's lifetime.
    pub fn run(&self, mut callback: impl FnMut(Event)) -> Result<u64> {
        let mut dispatched = 0u64;
        let mut timeout_ms = 0i32;

        while !self.stop.load(Ordering::Acquire) {
            let n = self
                .reactor
                .poll(self.config.batch_size, timeout_ms, &mut callback)?;
            dispatched += n as u64;

            if n > 0 {
                timeout_ms = 0;
            } else if timeout_ms < self.config.max_idle_timeout_ms {
                timeout_ms = (timeout_ms * 2).max(1).min(self.config.max_idle_timeout_ms);
            }
        }
        Ok(dispatched)
    }

    /// Signal the loop to exit and kick the reactor out of its wait.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.reactor.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use crate::reactor::Interest;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_stop_terminates_run() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let event_loop = Arc::new(EventLoop::new(reactor, EventLoopConfig::default()));

        let el = event_loop.clone();
        let handle = std::thread::spawn(move || el.run(|_| {}));

        std::thread::sleep(Duration::from_millis(30));
        event_loop.stop();
        let dispatched = handle.join().unwrap().unwrap();
        assert_eq!(dispatched, 0);
        assert!(event_loop.is_stopped());
    }

    #[test]
    fn test_events_flow_through_loop() {
        let reactor = Arc::new(Reactor::new().unwrap());

        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        reactor.register(fds[0], Interest::Readable, 42).unwrap();

        let event_loop = Arc::new(EventLoop::new(reactor, EventLoopConfig::default()));
        let seen = Arc::new(AtomicUsize::new(0));

        let el = event_loop.clone();
        let counter = seen.clone();
        let handle = std::thread::spawn(move || {
            el.run(move |ev| {
                assert_eq!(ev.token, 42);
                counter.fetch_add(1, Ordering::Relaxed);
            })
        });

        unsafe { libc::write(fds[1], b"x".as_ptr() as *const _, 1) };
        for _ in 0..100 {
            if seen.load(Ordering::Relaxed) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        event_loop.stop();
        handle.join().unwrap().unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
