//! Tests for the port engine. Everything here drives the real state
//! machine through the [`Reactor`] and [`DeviceIo`] seams: a scripted
//! reactor with a fabricated clock, and a scriptable device whose queues
//! the tests poke directly. Sessions run over real (nonblocking) sockets,
//! but all dispatch is explicit, so every test is deterministic.

mod admin;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use telnet::rfc2217::{BaudRequest, ModemState, Purge};

use crate::config::{PortConfig, PortDefaults};
use crate::device::{
    DeviceError, DeviceEvents, DeviceFactory, DeviceIo, SerialParams,
};
use crate::reactor::{FdHandler, Reactor, TimerHandler, TimerKey};
use crate::Mode;

// ---------------------------------------------------------------- reactor

struct FdReg {
    handler: Arc<dyn FdHandler>,
    read: bool,
    write: bool,
    except: bool,
}

struct TimerReg {
    handler: Arc<dyn TimerHandler>,
    deadline: Option<Instant>,
}

struct TrInner {
    offset: Duration,
    fds: HashMap<RawFd, FdReg>,
    timers: HashMap<u64, TimerReg>,
    next_timer: u64,
    deferred: VecDeque<Box<dyn FnOnce() + Send>>,
}

/// A reactor the test drives by hand. Readiness dispatch is unconditional
/// (handlers treat a spurious wakeup as would-block), the clock only moves
/// through [`advance`](TestReactor::advance), and deferred work runs when
/// the test says so.
pub struct TestReactor {
    base: Instant,
    inner: Mutex<TrInner>,
}

impl TestReactor {
    pub fn new() -> Arc<TestReactor> {
        Arc::new(TestReactor {
            base: Instant::now(),
            inner: Mutex::new(TrInner {
                offset: Duration::ZERO,
                fds: HashMap::new(),
                timers: HashMap::new(),
                next_timer: 1,
                deferred: VecDeque::new(),
            }),
        })
    }

    /// Run queued base-context work to completion.
    pub fn run_deferred(&self) {
        loop {
            let task = self.inner.lock().unwrap().deferred.pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Move the fabricated clock and fire every timer that came due.
    pub fn advance(&self, d: Duration) {
        self.inner.lock().unwrap().offset += d;
        loop {
            let due = {
                let now = self.now();
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

    /// Offer every enabled fd a read then a write. Handlers that find
    /// nothing simply see would-block.
    pub fn pump_io(&self) {
        let regs: Vec<(RawFd, bool, bool, Arc<dyn FdHandler>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .fds
                .iter()
                .map(|(fd, r)| (*fd, r.read, r.write, r.handler.clone()))
                .collect()
        };
        for (fd, read, _, handler) in &regs {
            if *read {
                handler.read_ready(*fd);
            }
        }
        for (fd, _, write, handler) in &regs {
            // Re-check: the read dispatch may have disarmed or cleared it.
            let still = {
                let inner = self.inner.lock().unwrap();
                inner.fds.get(fd).map_or(false, |r| r.write) && *write
            };
            if still {
                handler.write_ready(*fd);
            }
        }
    }

    /// A settle loop: deferred work, timer-free I/O, repeated.
    pub fn settle(&self) {
        for _ in 0..20 {
            self.run_deferred();
            self.pump_io();
        }
        self.run_deferred();
    }

    pub fn dispatch_except(&self, fd: RawFd) {
        let handler = {
            let inner = self.inner.lock().unwrap();
            inner
                .fds
                .get(&fd)
                .filter(|r| r.except)
                .map(|r| r.handler.clone())
        };
        if let Some(h) = handler {
            h.except_ready(fd);
        }
    }

    /// Registered fds, for tests that need to poke a specific one.
    pub fn fds(&self) -> Vec<RawFd> {
        self.inner.lock().unwrap().fds.keys().copied().collect()
    }
}

impl Reactor for TestReactor {
    fn set_fd_handlers(&self, fd: RawFd, handler: Arc<dyn FdHandler>) {
        self.inner.lock().unwrap().fds.insert(
            fd,
            FdReg {
                handler,
                read: false,
                write: false,
                except: false,
            },
        );
    }

    fn set_read_enabled(&self, fd: RawFd, enable: bool) {
        if let Some(r) = self.inner.lock().unwrap().fds.get_mut(&fd) {
            r.read = enable;
        }
    }

    fn set_write_enabled(&self, fd: RawFd, enable: bool) {
        if let Some(r) = self.inner.lock().unwrap().fds.get_mut(&fd) {
            r.write = enable;
        }
    }

    fn set_except_enabled(&self, fd: RawFd, enable: bool) {
        if let Some(r) = self.inner.lock().unwrap().fds.get_mut(&fd) {
            r.except = enable;
        }
    }

    fn clear_fd_handlers(&self, fd: RawFd) {
        let reg = self.inner.lock().unwrap().fds.remove(&fd);
        if let Some(reg) = reg {
            self.inner
                .lock()
                .unwrap()
                .deferred
                .push_back(Box::new(move || reg.handler.cleared(fd)));
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
        let mut inner = self.inner.lock().unwrap();
        match inner.timers.get_mut(&key.0) {
            Some(t) => t.deadline.take().is_some(),
            None => false,
        }
    }

    fn stop_timer_with_done(&self, key: TimerKey, done: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.timers.get_mut(&key.0) {
            t.deadline = None;
        }
        inner.deferred.push_back(done);
    }

    fn free_timer(&self, key: TimerKey) {
        self.inner.lock().unwrap().timers.remove(&key.0);
    }

    fn defer(&self, f: Box<dyn FnOnce() + Send>) {
        self.inner.lock().unwrap().deferred.push_back(f);
    }

    fn now(&self) -> Instant {
        self.base + self.inner.lock().unwrap().offset
    }

    fn turn(&self, _timeout: Option<Duration>) {
        self.run_deferred();
        self.pump_io();
    }
}

// ----------------------------------------------------------------- device

/// Shared, test-visible state of one scripted device.
pub struct DevState {
    pub open: bool,
    /// Bytes the device "receives" from the wire (client → device).
    pub written: Vec<u8>,
    /// Bytes the device wants to emit (device → client).
    pub from_dev: VecDeque<u8>,
    /// Simulate the device disappearing: reads return EOF.
    pub eof: bool,
    /// Cap each accepted write, to exercise the backpressure flip.
    pub write_limit: Option<usize>,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub except_enabled: bool,
    pub events: Option<Arc<dyn DeviceEvents>>,
    pub params: SerialParams,
    pub baud_set: Vec<u32>,
    pub flushes: Vec<Purge>,
    pub breaks: u32,
    pub modemstate: ModemState,
}

impl DevState {
    fn new() -> Arc<Mutex<DevState>> {
        Arc::new(Mutex::new(DevState {
            open: false,
            written: Vec::new(),
            from_dev: VecDeque::new(),
            eof: false,
            write_limit: None,
            read_enabled: false,
            write_enabled: false,
            except_enabled: false,
            events: None,
            params: SerialParams::default(),
            baud_set: Vec::new(),
            flushes: Vec::new(),
            breaks: 0,
            modemstate: ModemState::empty(),
        }))
    }
}

/// Deliver a device read event if reads are armed and data (or EOF) is
/// pending. Called from test code, never from inside a device operation,
/// so the port lock is free.
pub fn dev_kick(state: &Arc<Mutex<DevState>>) {
    let events = {
        let st = state.lock().unwrap();
        if !st.read_enabled || (!st.eof && st.from_dev.is_empty()) {
            return;
        }
        st.events.clone()
    };
    if let Some(events) = events {
        events.dev_read_ready();
    }
}

/// Deliver a device write-ready event if writes are armed.
pub fn dev_kick_write(state: &Arc<Mutex<DevState>>) {
    let events = {
        let st = state.lock().unwrap();
        if !st.write_enabled {
            return;
        }
        st.events.clone()
    };
    if let Some(events) = events {
        events.dev_write_ready();
    }
}

struct TestDevice {
    name: String,
    state: Arc<Mutex<DevState>>,
}

impl DeviceIo for TestDevice {
    fn devname(&self) -> &str {
        &self.name
    }

    fn setup(
        &mut self,
        _mode: Mode,
        events: Arc<dyn DeviceEvents>,
    ) -> Result<SerialParams, DeviceError> {
        let mut st = self.state.lock().unwrap();
        st.open = true;
        st.events = Some(events);
        Ok(st.params)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.from_dev.is_empty() {
            if st.eof {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let mut n = 0;
        while n < buf.len() {
            match st.from_dev.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let n = match st.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        st.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self, dir: Purge) {
        self.state.lock().unwrap().flushes.push(dir);
    }

    fn send_break(&mut self) {
        self.state.lock().unwrap().breaks += 1;
    }

    fn get_modem_state(&mut self) -> Option<ModemState> {
        Some(self.state.lock().unwrap().modemstate)
    }

    fn baud_rate(&mut self, req: BaudRequest) -> (u32, u32) {
        let mut st = self.state.lock().unwrap();
        let bps = match req {
            BaudRequest::Rfc(v) => v,
            BaudRequest::Cisco(ix) => 300 << ix,
        };
        st.params.bps = bps;
        st.baud_set.push(bps);
        let reply = match req {
            BaudRequest::Rfc(_) => bps,
            BaudRequest::Cisco(ix) => u32::from(ix),
        };
        (reply, bps)
    }

    fn data_size(&mut self, req: u8) -> (u8, u32) {
        let st = self.state.lock().unwrap();
        (req, st.params.bpc)
    }

    fn parity(&mut self, req: u8) -> (u8, u32) {
        let st = self.state.lock().unwrap();
        (req, st.params.bpc)
    }

    fn stop_size(&mut self, req: u8) -> (u8, u32) {
        let st = self.state.lock().unwrap();
        (req, st.params.bpc)
    }

    fn control(&mut self, req: u8) -> u8 {
        req
    }

    fn flow_control(&mut self, _suspend: bool) {}

    fn serparm_to_str(&self) -> String {
        let st = self.state.lock().unwrap();
        format!("{}N81", st.params.bps)
    }

    fn show_devcfg(&self) -> String {
        self.serparm_to_str()
    }

    fn show_devcontrol(&self) -> String {
        "RTSHI DTRHI".to_string()
    }

    fn set_devcontrol(&mut self, controls: &str) -> Result<(), DeviceError> {
        for tok in controls.split_whitespace() {
            if !matches!(tok, "DTRHI" | "DTRLO" | "RTSHI" | "RTSLO") {
                return Err(DeviceError::new("invalid control"));
            }
        }
        Ok(())
    }

    fn reconfig(&mut self, devcfg: &str) -> Result<(), DeviceError> {
        for tok in devcfg.split_whitespace() {
            if tok.parse::<u32>().is_err() {
                return Err(DeviceError::new(format!("unknown option: {tok}")));
            }
        }
        Ok(())
    }

    fn read_handler_enable(&self, enable: bool) {
        self.state.lock().unwrap().read_enabled = enable;
    }

    fn write_handler_enable(&self, enable: bool) {
        self.state.lock().unwrap().write_enabled = enable;
    }

    fn except_handler_enable(&self, enable: bool) {
        self.state.lock().unwrap().except_enabled = enable;
    }

    fn shutdown(&mut self, done: Box<dyn FnOnce() + Send>) {
        self.state.lock().unwrap().open = false;
        done();
    }
}

/// A device factory whose created devices stay visible to the test
/// through the returned table, keyed by devname.
pub type DevTable = Arc<Mutex<HashMap<String, Arc<Mutex<DevState>>>>>;

pub fn test_factory() -> (DeviceFactory, DevTable) {
    let table: DevTable = Arc::new(Mutex::new(HashMap::new()));
    let table2 = table.clone();
    let factory: DeviceFactory = Arc::new(move |cfg: &PortConfig| {
        let mut table = table2.lock().unwrap();
        let state = table
            .entry(cfg.devname.clone())
            .or_insert_with(DevState::new)
            .clone();
        Ok(Box::new(TestDevice {
            name: cfg.devname.clone(),
            state,
        }) as Box<dyn DeviceIo>)
    });
    (factory, table)
}

// ------------------------------------------------------------ conveniences

pub fn basic_config(name: &str, devname: &str, mode: Mode) -> PortConfig {
    let mut cfg = PortConfig::new(name, devname, &PortDefaults::default());
    cfg.mode = mode;
    // Pacing off unless a test turns it on.
    cfg.enable_chardelay = false;
    cfg
}

use std::io::Read;
use std::net::TcpStream;

use crate::port::{Port, XferState};

pub fn connect(port: &Arc<Port>) -> TcpStream {
    let addr = port.listen_addrs()[0];
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

/// Read whatever the client socket has, giving the kernel a moment to
/// deliver loopback data.
pub fn drain(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    for _ in 0..50 {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !out.is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(_) => break,
        }
    }
    out
}

pub fn at_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    for _ in 0..100 {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1))
            }
            Err(_) => return true,
        }
    }
    false
}

pub fn tcp_to_dev_state(port: &Arc<Port>) -> XferState {
    port.inner.lock().unwrap().tcp_to_dev_state
}

pub fn dev_to_tcp_state(port: &Arc<Port>) -> XferState {
    port.inner.lock().unwrap().dev_to_tcp_state
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Connect and settle until the device reports open.
pub fn connect_session(
    reactor: &Arc<TestReactor>,
    port: &Arc<Port>,
    devices: &DevTable,
    devname: &str,
) -> TcpStream {
    let stream = connect(port);
    for _ in 0..50 {
        reactor.settle();
        if devices.lock().unwrap()[devname].lock().unwrap().open {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(devices.lock().unwrap()[devname].lock().unwrap().open);
    stream
}
