//! The production reactor: level-triggered epoll, a timer heap, and a
//! deferred-work queue, all driven from one thread by repeated
//! [`turn`](Reactor::turn) calls in the daemon's main loop.

use std::collections::{HashMap, VecDeque};
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use portmux::reactor::{FdHandler, Reactor, TimerHandler, TimerKey};

struct FdReg {
    handler: Arc<dyn FdHandler>,
    read: bool,
    write: bool,
    except: bool,
}

impl FdReg {
    fn flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.except {
            flags |= EpollFlags::EPOLLPRI;
        }
        flags
    }
}

struct TimerReg {
    handler: Arc<dyn TimerHandler>,
    deadline: Option<Instant>,
}

struct Inner {
    fds: HashMap<RawFd, FdReg>,
    timers: HashMap<u64, TimerReg>,
    next_timer: u64,
    deferred: VecDeque<Box<dyn FnOnce() + Send>>,
}

pub struct EpollReactor {
    epoll: Epoll,
    inner: Mutex<Inner>,
}

/// The registration tables only ever hold fds their owners keep open until
/// the reactor confirms the clear, so borrowing them back for epoll_ctl is
/// sound.
fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EpollReactor {
    pub fn new() -> std::io::Result<Arc<EpollReactor>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        Ok(Arc::new(EpollReactor {
            epoll,
            inner: Mutex::new(Inner {
                fds: HashMap::new(),
                timers: HashMap::new(),
                next_timer: 1,
                deferred: VecDeque::new(),
            }),
        }))
    }

    fn update_interest(&self, fd: RawFd, reg: &FdReg) {
        let mut event = EpollEvent::new(reg.flags(), fd as u64);
        if let Err(e) = self.epoll.modify(borrow_fd(fd), &mut event) {
            log::error!("epoll modify failed for fd {fd}: {e}");
        }
    }

    fn set_enabled(&self, fd: RawFd, which: fn(&mut FdReg) -> &mut bool, enable: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(reg) = inner.fds.get_mut(&fd) else {
            return;
        };
        *which(reg) = enable;
        let snapshot = FdReg {
            handler: reg.handler.clone(),
            read: reg.read,
            write: reg.write,
            except: reg.except,
        };
        drop(inner);
        self.update_interest(fd, &snapshot);
    }

    fn run_deferred(&self) {
        loop {
            let task = self.inner.lock().unwrap().deferred.pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    fn fire_due_timers(&self) {
        loop {
            let now = Instant::now();
            let due = {
                let mut inner = self.inner.lock().unwrap();
                let key = inner
                    .timers
                    .iter()
                    .find(|(_, t)| t.deadline.map_or(false, |dl| dl <= now))
                    .map(|(k, _)| *k);
                key.map(|k| {
                    let t = inner.timers.get_mut(&k).unwrap();
                    t.deadline = None;
                    t.handler.clone()
                })
            };
            match due {
                Some(handler) => handler.timeout(),
                None => return,
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.timers.values().filter_map(|t| t.deadline).min()
    }
}

impl Reactor for EpollReactor {
    fn set_fd_handlers(&self, fd: RawFd, handler: Arc<dyn FdHandler>) {
        let reg = FdReg {
            handler,
            read: false,
            write: false,
            except: false,
        };
        let event = EpollEvent::new(reg.flags(), fd as u64);
        if let Err(e) = self.epoll.add(borrow_fd(fd), event) {
            log::error!("epoll add failed for fd {fd}: {e}");
            return;
        }
        self.inner.lock().unwrap().fds.insert(fd, reg);
    }

    fn set_read_enabled(&self, fd: RawFd, enable: bool) {
        self.set_enabled(fd, |r| &mut r.read, enable);
    }

    fn set_write_enabled(&self, fd: RawFd, enable: bool) {
        self.set_enabled(fd, |r| &mut r.write, enable);
    }

    fn set_except_enabled(&self, fd: RawFd, enable: bool) {
        self.set_enabled(fd, |r| &mut r.except, enable);
    }

    fn clear_fd_handlers(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        let Some(reg) = inner.fds.remove(&fd) else {
            return;
        };
        let handler = reg.handler;
        inner.deferred.push_back(Box::new(move || handler.cleared(fd)));
        drop(inner);
        if let Err(e) = self.epoll.delete(borrow_fd(fd)) {
            // The owner may have raced the close; EBADF/ENOENT are fine.
            log::debug!("epoll delete for fd {fd}: {e}");
        }
    }

    fn new_timer(&self, handler: Arc<dyn TimerHandler>) -> TimerKey {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.next_timer;
        inner.next_timer += 1;
        inner.timers.insert(
            key,
            TimerReg {
                handler,
                deadline: None,
            },
        );
        TimerKey(key)
    }

    fn start_timer(&self, key: TimerKey, deadline: Instant) {
        if let Some(t) = self.inner.lock().unwrap().timers.get_mut(&key.0) {
            t.deadline = Some(deadline);
        }
    }

    fn stop_timer(&self, key: TimerKey) -> bool {
        match self.inner.lock().unwrap().timers.get_mut(&key.0) {
            Some(t) => t.deadline.take().is_some(),
            None => false,
        }
    }

    fn stop_timer_with_done(&self, key: TimerKey, done: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.timers.get_mut(&key.0) {
            t.deadline = None;
        }
        // Dispatch is single-threaded: once we're here the timer callback
        // is not running, so `done` can be delivered from base context.
        inner.deferred.push_back(done);
    }

    fn free_timer(&self, key: TimerKey) {
        self.inner.lock().unwrap().timers.remove(&key.0);
    }

    fn defer(&self, f: Box<dyn FnOnce() + Send>) {
        self.inner.lock().unwrap().deferred.push_back(f);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn turn(&self, timeout: Option<Duration>) {
        self.run_deferred();
        self.fire_due_timers();

        // Deferred work queued by the handlers above wants another pass
        // soon; otherwise sleep until the next timer or the caller's cap.
        let have_deferred = !self.inner.lock().unwrap().deferred.is_empty();
        let wait = if have_deferred {
            Duration::ZERO
        } else {
            let now = Instant::now();
            let until_timer = self
                .next_deadline()
                .map(|dl| dl.saturating_duration_since(now));
            match (until_timer, timeout) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => Duration::from_secs(1),
            }
        };
        let ms = wait.as_millis().min(u128::from(u16::MAX - 1)) as u16;

        let mut events = [EpollEvent::empty(); 16];
        let n = match self.epoll.wait(&mut events, ms as isize) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => {
                log::error!("epoll wait failed: {e}");
                0
            }
        };

        for event in &events[..n] {
            let fd = event.data() as RawFd;
            let ready = event.events();
            // Re-check registration before every dispatch; an earlier
            // handler in this batch may have cleared this fd.
            let reg = {
                let inner = self.inner.lock().unwrap();
                inner
                    .fds
                    .get(&fd)
                    .map(|r| (r.handler.clone(), r.read, r.write, r.except))
            };
            let Some((handler, read, write, except)) = reg else {
                continue;
            };
            if except && ready.contains(EpollFlags::EPOLLPRI) {
                handler.except_ready(fd);
            }
            if read
                && ready
                    .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
            {
                handler.read_ready(fd);
            }
            let still_write = {
                let inner = self.inner.lock().unwrap();
                inner.fds.get(&fd).map_or(false, |r| r.write)
            };
            if write && still_write && ready.contains(EpollFlags::EPOLLOUT) {
                handler.write_ready(fd);
            }
        }

        self.run_deferred();
        self.fire_due_timers();
    }
}
