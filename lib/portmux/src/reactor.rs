//! The event-dispatch abstraction the engine runs on: fd readiness
//! callbacks, one-shot timers, and base-context deferral. The daemon
//! provides an epoll-backed implementation; the test harness provides a
//! scripted one.
//!
//! The contract the engine relies on:
//!
//! - Callbacks are dispatched one at a time (cooperative, single-threaded).
//! - [`clear_fd_handlers`](Reactor::clear_fd_handlers) never invokes
//!   anything synchronously; the handler's [`cleared`](FdHandler::cleared)
//!   runs later from base context, and once it has run no further callback
//!   for that fd fires.
//! - [`stop_timer_with_done`](Reactor::stop_timer_with_done) runs `done`
//!   from base context once the timer is guaranteed not to fire again.
//! - [`defer`](Reactor::defer) is the run-once "base context" primitive:
//!   the closure runs outside any handler's dynamic extent.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Callbacks for one registered file descriptor.
pub trait FdHandler: Send + Sync {
    fn read_ready(&self, fd: RawFd);
    fn write_ready(&self, fd: RawFd);
    fn except_ready(&self, _fd: RawFd) {}
    /// Runs exactly once after `clear_fd_handlers`; no further callbacks
    /// for this fd will fire.
    fn cleared(&self, _fd: RawFd) {}
}

pub trait TimerHandler: Send + Sync {
    fn timeout(&self);
}

/// Opaque handle for a timer allocated with [`Reactor::new_timer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey(pub u64);

pub trait Reactor: Send + Sync {
    fn set_fd_handlers(&self, fd: RawFd, handler: Arc<dyn FdHandler>);
    fn set_read_enabled(&self, fd: RawFd, enable: bool);
    fn set_write_enabled(&self, fd: RawFd, enable: bool);
    fn set_except_enabled(&self, fd: RawFd, enable: bool);
    fn clear_fd_handlers(&self, fd: RawFd);

    fn new_timer(&self, handler: Arc<dyn TimerHandler>) -> TimerKey;
    fn start_timer(&self, key: TimerKey, deadline: Instant);
    /// Returns false if the timer was not running.
    fn stop_timer(&self, key: TimerKey) -> bool;
    fn stop_timer_with_done(&self, key: TimerKey, done: Box<dyn FnOnce() + Send>);
    fn free_timer(&self, key: TimerKey);

    /// Run `f` once at base context.
    fn defer(&self, f: Box<dyn FnOnce() + Send>);

    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Service pending reactor work: dispatch due timers, deferred
    /// closures, and (for real implementations) fd readiness, waiting at
    /// most `timeout` for something to do. Used by the daemon's main loop
    /// and by [`Waiter::wait`].
    fn turn(&self, timeout: Option<Duration>);
}

/// A counted wakeable latch. Completion callbacks call [`wake`](Self::wake);
/// top-level joins call [`wait`](Self::wait), which services the reactor
/// while waiting so that the completions can actually be delivered (waits
/// happen on the reactor thread, at base context).
#[derive(Debug, Default)]
pub struct Waiter {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Waiter> {
        Arc::new(Waiter::default())
    }

    pub fn wake(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Consume `n` wakes, pumping the reactor until they arrive.
    pub fn wait(&self, n: u64, reactor: &dyn Reactor) {
        loop {
            {
                let mut count = self.count.lock().unwrap();
                if *count >= n {
                    *count -= n;
                    return;
                }
            }
            reactor.turn(Some(Duration::from_millis(100)));
        }
    }
}
