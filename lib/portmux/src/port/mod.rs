//! One configured port: a TCP listen spec paired with a character device,
//! and the state machine that carries a single session through
//! listen → accept → negotiate → relay → drain → shutdown.
//!
//! Each transfer direction tracks its own state, but the two halves close
//! together through `Closing`. Shutdown is a chain of completions (clear
//! the socket handlers, stop the activity timer, drain the close string,
//! shut the device down, stop the pacing timer), each step continuing
//! from base context so a callback never waits on its own teardown.

mod pipeline;
mod rfc2217;

use std::fmt;
use std::io::Write;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Local;

use telnet::rfc2217::ModemState;
use telnet::{OptionEntry, TelnetCodec, TelnetOut};

use crate::buffer::Buffer;
use crate::config::{ConfigError, PortConfig};
use crate::control::ControlSession;
use crate::device::{DeviceError, DeviceEvents, DeviceIo, SerialParams};
use crate::expand::{expand, ExpandCtx};
use crate::net::{self, SessionIo};
use crate::reactor::{FdHandler, Reactor, TimerKey};
use crate::registry::Registry;
use crate::trace::TraceSet;
use crate::Mode;

/// State of one transfer direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferState {
    Unconnected,
    WaitingInput,
    WaitingOutputClear,
    Closing,
}

impl fmt::Display for XferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            XferState::Unconnected => "unconnected",
            XferState::WaitingInput => "waiting input",
            XferState::WaitingOutputClear => "waiting output",
            XferState::Closing => "closing",
        })
    }
}

/// What the next TCP write-ready event should push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TcpWriteKind {
    Banner,
    Data,
}

/// What the next device write-ready event should push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DevWriteKind {
    OpenStr,
    Data,
    CloseStr,
}

/// Telnet state for one session.
struct TelnetConn {
    codec: TelnetCodec,
    out: TelnetOut,
    /// Telnet command bytes are being drained ahead of user data.
    sending_tn_data: bool,
}

impl TelnetConn {
    fn new() -> Self {
        use telnet::{option, DO, DONT, IAC, WILL};
        let init = [
            IAC, WILL, option::SUPPRESS_GO_AHEAD,
            IAC, WILL, option::ECHO,
            IAC, DONT, option::ECHO,
            IAC, DO, option::BINARY_TRANSMISSION,
        ];
        let table = vec![
            OptionEntry::new(option::SUPPRESS_GO_AHEAD).i_do().sent_will(),
            OptionEntry::new(option::ECHO).i_do().sent_will().sent_do(),
            OptionEntry::new(option::BINARY_TRANSMISSION)
                .i_will()
                .i_do()
                .sent_do(),
            OptionEntry::new(option::COM_PORT)
                .i_will()
                .i_do()
                .notify_will()
                .has_suboption(),
        ];
        TelnetConn {
            codec: TelnetCodec::new(table),
            out: TelnetOut::new(&init),
            sending_tn_data: false,
        }
    }
}

/// A bound listening socket and its accept handler. The handler holds the
/// port weakly and can be retargeted in place when a reconfigured port
/// inherits its predecessor's sockets.
pub(crate) struct Listener {
    pub(crate) listener: TcpListener,
    pub(crate) handler: Arc<AcceptHandler>,
}

impl Listener {
    pub(crate) fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

pub(crate) struct AcceptHandler {
    pub(crate) port: Mutex<Weak<Port>>,
}

impl FdHandler for AcceptHandler {
    fn read_ready(&self, fd: RawFd) {
        let Some(port) = self.port.lock().unwrap().upgrade() else {
            return;
        };
        let Some(registry) = port.registry.upgrade() else {
            return;
        };
        registry.port_accept_ready(&port, fd);
    }

    fn write_ready(&self, _fd: RawFd) {}

    fn cleared(&self, fd: RawFd) {
        if let Some(port) = self.port.lock().unwrap().upgrade() {
            port.listener_cleared(fd);
        }
    }
}

/// A replacement configuration (with its validated device) parked on a
/// port until the current session ends.
pub(crate) struct PendingPort {
    pub(crate) cfg: PortConfig,
    pub(crate) dev: Box<dyn DeviceIo>,
}

struct ActivityTick {
    port: Weak<Port>,
}

impl crate::reactor::TimerHandler for ActivityTick {
    fn timeout(&self) {
        if let Some(port) = self.port.upgrade() {
            port.activity_tick();
        }
    }
}

struct SendTick {
    port: Weak<Port>,
}

impl crate::reactor::TimerHandler for SendTick {
    fn timeout(&self) {
        if let Some(port) = self.port.upgrade() {
            port.send_tick();
        }
    }
}

pub struct Port {
    pub(crate) name: String,
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) registry: Weak<Registry>,
    self_ref: Weak<Port>,
    /// 1-Hz activity/modem-state timer.
    timer: TimerKey,
    /// Character-delay pacing timer.
    send_timer: TimerKey,
    pub(crate) inner: Mutex<PortInner>,
}

pub(crate) struct PortInner {
    pub(crate) cfg: PortConfig,
    pub(crate) config_num: i32,
    pub(crate) new_config: Option<PendingPort>,

    pub(crate) tcp_to_dev_state: XferState,
    pub(crate) dev_to_tcp_state: XferState,
    pub(crate) tcp_to_dev: Buffer,
    pub(crate) dev_to_tcp: Buffer,

    pub(crate) timeout: u32,
    timeout_left: i64,

    pub(crate) listeners: Vec<Listener>,
    closing_listeners: Vec<Listener>,

    pub(crate) io: Option<SessionIo>,
    pub(crate) peer: Option<std::net::SocketAddr>,
    clears_pending: u32,

    pub(crate) dev: Box<dyn DeviceIo>,
    pub(crate) params: SerialParams,
    pub(crate) chardelay: u32,
    send_timer_running: bool,
    send_time: Option<std::time::Instant>,

    tcp_write_kind: TcpWriteKind,
    dev_write_kind: DevWriteKind,
    banner: Option<Buffer>,
    devstr: Option<Buffer>,
    tn: Option<TelnetConn>,

    pub(crate) is_2217: bool,
    pub(crate) linestate_mask: u8,
    pub(crate) modemstate_mask: ModemState,
    pub(crate) last_modemstate: ModemState,

    closeon_pos: usize,
    close_on_output_done: bool,

    trace: TraceSet,

    pub(crate) tcp_monitor: Weak<ControlSession>,
    pub(crate) dev_monitor: Weak<ControlSession>,

    pub(crate) tcp_bytes_received: u64,
    pub(crate) tcp_bytes_sent: u64,
    pub(crate) dev_bytes_received: u64,
    pub(crate) dev_bytes_sent: u64,
}

impl Port {
    pub(crate) fn new(
        reactor: Arc<dyn Reactor>,
        registry: Weak<Registry>,
        cfg: PortConfig,
        dev: Box<dyn DeviceIo>,
    ) -> Arc<Port> {
        Arc::new_cyclic(|weak: &Weak<Port>| {
            let timer = reactor.new_timer(Arc::new(ActivityTick { port: weak.clone() }));
            let send_timer = reactor.new_timer(Arc::new(SendTick { port: weak.clone() }));
            let name = cfg.name.clone();
            let config_num = cfg.config_num;
            let timeout = cfg.timeout;
            let inner = PortInner {
                tcp_to_dev: Buffer::new(cfg.tcp_to_dev_bufsize),
                dev_to_tcp: Buffer::new(cfg.dev_to_tcp_bufsize),
                config_num,
                new_config: None,
                tcp_to_dev_state: XferState::Unconnected,
                dev_to_tcp_state: XferState::Unconnected,
                timeout,
                timeout_left: 0,
                listeners: Vec::new(),
                closing_listeners: Vec::new(),
                io: None,
                peer: None,
                clears_pending: 0,
                dev,
                params: SerialParams::default(),
                chardelay: 0,
                send_timer_running: false,
                send_time: None,
                tcp_write_kind: TcpWriteKind::Data,
                dev_write_kind: DevWriteKind::Data,
                banner: None,
                devstr: None,
                tn: None,
                is_2217: false,
                linestate_mask: 0,
                modemstate_mask: ModemState::all(),
                last_modemstate: ModemState::empty(),
                closeon_pos: 0,
                close_on_output_done: false,
                trace: TraceSet::default(),
                tcp_monitor: Weak::new(),
                dev_monitor: Weak::new(),
                tcp_bytes_received: 0,
                tcp_bytes_sent: 0,
                dev_bytes_received: 0,
                dev_bytes_sent: 0,
                cfg,
            };
            Port {
                name,
                reactor,
                registry,
                self_ref: weak.clone(),
                timer,
                send_timer,
                inner: Mutex::new(inner),
            }
        })
    }

    /// The owning `Arc`, for handler entry points that only have `&self`.
    fn arc(&self) -> Arc<Port> {
        self.self_ref.upgrade().expect("port callback after drop")
    }

    /// Bind and register the listening sockets for this port's spec.
    pub(crate) fn startup(
        self: &Arc<Self>,
        inner: &mut PortInner,
    ) -> Result<(), ConfigError> {
        let listeners = net::bind_listeners(&self.name).map_err(|e| {
            ConfigError(format!(
                "Unable to create TCP socket for port {}: {e}",
                self.name
            ))
        })?;
        for listener in listeners {
            let handler = Arc::new(AcceptHandler {
                port: Mutex::new(Arc::downgrade(self)),
            });
            let fd = listener.as_raw_fd();
            self.reactor.set_fd_handlers(fd, handler.clone());
            self.reactor.set_read_enabled(fd, true);
            inner.listeners.push(Listener { listener, handler });
        }
        Ok(())
    }

    /// Stop accepting: disable and clear every listener. The sockets close
    /// once the reactor confirms their handlers are gone.
    pub(crate) fn teardown_listeners(&self, inner: &mut PortInner) {
        for l in inner.listeners.drain(..) {
            let fd = l.listener.as_raw_fd();
            self.reactor.set_read_enabled(fd, false);
            self.reactor.clear_fd_handlers(fd);
            inner.closing_listeners.push(l);
        }
    }

    fn listener_cleared(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .closing_listeners
            .retain(|l| l.listener.as_raw_fd() != fd);
    }

    /// Accept from the listener that fired and start the session. All the
    /// busy/in-use/disabled checks have already passed.
    pub(crate) fn accept_into(self: &Arc<Self>, inner: &mut PortInner, fd: RawFd) {
        let Some(l) = inner.listeners.iter().find(|l| l.listener.as_raw_fd() == fd) else {
            return;
        };
        let (stream, peer) = match net::accept_nonblocking(&l.listener) {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(e) => {
                log::error!("Could not accept on port {}: {e}", self.name);
                return;
            }
        };
        if let Err(e) = net::configure_session_socket(&stream) {
            log::error!("Could not set up socket options on port {}: {e}", self.name);
            return;
        }
        self.setup_session(inner, SessionIo::Tcp(stream), Some(peer));
    }

    /// Wire a freshly accepted (or stdio) byte stream into the relay.
    pub(crate) fn setup_session(
        self: &Arc<Self>,
        inner: &mut PortInner,
        io: SessionIo,
        peer: Option<std::net::SocketAddr>,
    ) -> bool {
        if let Some(registry) = self.registry.upgrade() {
            if !registry.access_allowed(peer) {
                let mut w = &io;
                let _ = w.write_all(b"Access denied\r\n");
                return false;
            }
        }

        let events: Arc<dyn DeviceEvents> = self.clone();
        match inner.dev.setup(inner.cfg.mode, events) {
            Ok(params) => inner.params = params,
            Err(DeviceError(msg)) => {
                let mut w = &io;
                let _ = w.write_all(msg.as_bytes());
                return false;
            }
        }
        inner.chardelay = recalc_chardelay(&inner.cfg, inner.params);
        inner.is_2217 = false;

        inner.peer = peer;
        inner.banner = self.expand_cfg_string(inner, inner.cfg.banner.clone());
        inner.tcp_write_kind = if inner.banner.is_some() {
            TcpWriteKind::Banner
        } else {
            TcpWriteKind::Data
        };
        inner.devstr = self.expand_cfg_string(inner, inner.cfg.openstr.clone());
        inner.dev_write_kind = if inner.devstr.is_some() {
            DevWriteKind::OpenStr
        } else {
            DevWriteKind::Data
        };

        inner.dev.read_handler_enable(inner.cfg.mode != Mode::RawLp);
        inner.dev.except_handler_enable(true);
        if inner.devstr.is_some() {
            inner.dev.write_handler_enable(true);
        }
        inner.dev_to_tcp_state = XferState::WaitingInput;

        let read_fd = io.read_fd();
        let write_fd = io.write_fd();
        self.reactor.set_fd_handlers(read_fd, self.clone());
        if write_fd != read_fd {
            self.reactor.set_fd_handlers(write_fd, self.clone());
        }
        self.reactor.set_read_enabled(read_fd, true);
        self.reactor.set_except_enabled(read_fd, true);
        inner.tcp_to_dev_state = XferState::WaitingInput;

        if inner.cfg.mode == Mode::Telnet {
            inner.tn = Some(TelnetConn::new());
            // The init sequence is pending, start pushing it.
            self.reactor.set_write_enabled(write_fd, true);
        } else {
            inner.tn = None;
            if inner.banner.is_some() {
                self.reactor.set_write_enabled(write_fd, true);
            }
        }

        inner.io = Some(io);

        let serparms = inner.dev.serparm_to_str();
        let mut ctx = ExpandCtx::new(&inner.cfg.devname, &self.name, &serparms);
        ctx.peer = inner.peer.map(|p| p.ip());
        inner.trace = TraceSet::setup(
            &self.name,
            &inner.cfg.trace_read,
            &inner.cfg.trace_write,
            &inner.cfg.trace_both,
            &ctx,
        );
        inner.trace.header(inner.peer);

        self.reactor
            .start_timer(self.timer, self.reactor.now() + Duration::from_secs(1));
        self.reset_timer(inner);
        true
    }

    fn expand_cfg_string(&self, inner: &PortInner, template: Option<String>) -> Option<Buffer> {
        let template = template?;
        let serparms = inner.dev.serparm_to_str();
        let mut ctx = ExpandCtx::new(&inner.cfg.devname, &self.name, &serparms);
        ctx.peer = inner.peer.map(|p| p.ip());
        ctx.when = Local::now();
        let bytes = expand(&template, &ctx);
        if bytes.is_empty() {
            None
        } else {
            Some(Buffer::from_vec(bytes))
        }
    }

    pub(crate) fn reset_timer(&self, inner: &mut PortInner) {
        inner.timeout_left = i64::from(inner.timeout);
    }

    /// Begin tearing the session down. Leaves the port in `Closing`; the
    /// rest of the sequence continues from base context.
    pub(crate) fn shutdown_port(self: &Arc<Self>, inner: &mut PortInner, reason: &str) {
        if inner.dev_to_tcp_state == XferState::Closing {
            return;
        }

        inner.trace.footer(reason);
        inner.trace.close();

        inner.dev_to_tcp_state = XferState::Closing;
        if let Some(io) = &inner.io {
            let read_fd = io.read_fd();
            let write_fd = io.write_fd();
            inner.clears_pending = if write_fd == read_fd { 1 } else { 2 };
            self.reactor.clear_fd_handlers(read_fd);
            if write_fd != read_fd {
                self.reactor.clear_fd_handlers(write_fd);
            }
        } else {
            let port = self.clone();
            self.reactor
                .defer(Box::new(move || port.shutdown_port2()));
        }
    }

    /// All socket handlers are confirmed gone; close the socket and move
    /// the rest of the shutdown to base context.
    fn session_fd_cleared(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clears_pending = inner.clears_pending.saturating_sub(1);
        if inner.clears_pending > 0 {
            return;
        }
        inner.io = None;
        drop(inner);
        let port = self.clone();
        self.reactor.defer(Box::new(move || port.shutdown_port2()));
    }

    fn shutdown_port2(self: Arc<Self>) {
        let port = self.clone();
        self.reactor
            .stop_timer_with_done(self.timer, Box::new(move || port.shutdown_port3()));
    }

    /// Activity timer is quiet. Drain the close string to the device if
    /// one is configured and the device is still up.
    fn shutdown_port3(self: Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.devstr = self.expand_cfg_string(inner, inner.cfg.closestr.clone());
        if inner.devstr.is_some() && inner.tcp_to_dev_state != XferState::Unconnected {
            inner.dev.read_handler_enable(false);
            inner.dev.except_handler_enable(false);
            inner.dev_write_kind = DevWriteKind::CloseStr;
            inner.dev.write_handler_enable(true);
            // handle_dev_fd_close_write picks it up from here.
        } else {
            drop(guard);
            self.finish_shutdown_port();
        }
    }

    pub(crate) fn finish_shutdown_port(self: Arc<Self>) {
        let port = self.clone();
        let mut inner = self.inner.lock().unwrap();
        inner
            .dev
            .shutdown(Box::new(move || port.finish_shutdown_dev_done()));
    }

    fn finish_shutdown_dev_done(self: Arc<Self>) {
        let port = self.clone();
        self.reactor
            .stop_timer_with_done(self.send_timer, Box::new(move || port.finish_shutdown2()));
    }

    /// Nothing can happen on the port any more: reset the session state,
    /// then apply any pending delete or replacement.
    fn finish_shutdown2(self: Arc<Self>) {
        let (is_stdio, deleted, replace) = {
            let mut inner = self.inner.lock().unwrap();
            inner.tcp_to_dev_state = XferState::Unconnected;
            inner.tcp_to_dev.reset();
            inner.dev_to_tcp.reset();
            inner.tcp_bytes_received = 0;
            inner.tcp_bytes_sent = 0;
            inner.dev_bytes_received = 0;
            inner.dev_bytes_sent = 0;
            inner.banner = None;
            inner.devstr = None;
            inner.tn = None;
            inner.is_2217 = false;
            inner.closeon_pos = 0;
            inner.close_on_output_done = false;
            inner.send_timer_running = false;
            inner.send_time = None;
            inner.tcp_write_kind = TcpWriteKind::Data;
            inner.dev_write_kind = DevWriteKind::Data;
            (
                inner.cfg.is_stdio(),
                inner.config_num == -1,
                inner.new_config.is_some(),
            )
        };

        if is_stdio {
            // The stdio session was the whole point of the process.
            std::process::exit(0);
        }

        let registry = self.registry.upgrade();
        if deleted {
            if let Some(registry) = registry {
                registry.unlink_port(&self);
            }
            return;
        }
        if replace {
            if let Some(registry) = registry {
                registry.apply_new_config(&self);
            }
            // The replacement starts out unconnected; this port is gone.
            return;
        }

        // Reopen for the next accept.
        self.inner.lock().unwrap().dev_to_tcp_state = XferState::Unconnected;
    }

    /// 1-Hz tick: inactivity countdown plus the RFC 2217 modem-state poll.
    fn activity_tick(self: Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.dev_to_tcp_state == XferState::Closing {
            return;
        }

        if inner.timeout > 0 {
            inner.timeout_left -= 1;
            if inner.timeout_left < 0 {
                self.shutdown_port(inner, "timeout");
                return;
            }
        }

        if inner.is_2217 {
            if let Some(state) = inner.dev.get_modem_state() {
                let masked = state & inner.modemstate_mask;
                if masked != inner.last_modemstate {
                    inner.last_modemstate = masked;
                    if let Some(tn) = inner.tn.as_mut() {
                        tn.out.send_option(&[
                            telnet::option::COM_PORT,
                            telnet::rfc2217::cmd::NOTIFY_MODEMSTATE + telnet::rfc2217::SERVER_OFFSET,
                            masked.bits(),
                        ]);
                    }
                    self.telnet_output_push(inner);
                }
            }
        }

        self.reactor
            .start_timer(self.timer, self.reactor.now() + Duration::from_secs(1));
    }

    /// Character-delay expiry: flush whatever is batched.
    fn send_tick(self: Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.dev_to_tcp_state == XferState::Closing {
            return;
        }
        inner.send_timer_running = false;
        if inner.dev_to_tcp.cursize() > 0 {
            let _ = self.handle_tcp_send(inner);
        }
    }

    // ---- control-plane operations ----

    pub fn set_timeout(&self, secs: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.timeout = secs;
        if inner.io.is_some() {
            inner.timeout_left = i64::from(secs);
        }
    }

    /// Re-apply a device configuration string (`setportconfig`). Port
    /// keywords are applied too; whatever is left goes to the device.
    pub fn reconfig(&self, devcfg: &str) -> Result<(), DeviceError> {
        let resolver: Arc<dyn crate::config::ConfigResolver> = match self.registry.upgrade() {
            Some(r) => r.resolver(),
            None => Arc::new(crate::config::EmptyResolver),
        };
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut cfg = inner.cfg.clone();
        cfg.devcfg = String::new();
        for tok in devcfg.split_whitespace() {
            cfg.apply_keyword(tok, resolver.as_ref())
                .map_err(|e| DeviceError(e.0))?;
        }
        inner.dev.reconfig(&cfg.devcfg)?;
        cfg.mode = inner.cfg.mode;
        inner.cfg = cfg;
        Ok(())
    }

    pub fn set_devcontrol(&self, controls: &str) -> Result<(), DeviceError> {
        self.inner.lock().unwrap().dev.set_devcontrol(controls)
    }

    // ---- inspection ----

    /// Multi-line `showport` dump.
    pub fn show_long(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        out.push_str(&format!("TCP Port {}\r\n", self.name));
        let w = &mut out;
        w.push_str(&format!("  enable state: {}\r\n", inner.cfg.mode));
        w.push_str(&format!("  timeout: {}\r\n", inner.timeout));
        w.push_str(&format!(
            "  connected to (or last connection): {}\r\n",
            peer_str(inner.peer)
        ));
        w.push_str(&format!("  device: {}\r\n", inner.cfg.devname));
        if inner.cfg.mode == Mode::RawLp {
            w.push_str("  device config: none\r\n");
        } else {
            w.push_str(&format!("  device config: {}\r\n", inner.dev.show_devcfg()));
        }
        if inner.tcp_to_dev_state == XferState::Unconnected {
            w.push_str("  device controls: not currently connected\r\n");
        } else {
            w.push_str(&format!(
                "  device controls: {}\r\n",
                inner.dev.show_devcontrol()
            ));
        }
        w.push_str(&format!(
            "  tcp to device state: {}\r\n",
            inner.tcp_to_dev_state
        ));
        w.push_str(&format!(
            "  device to tcp state: {}\r\n",
            inner.dev_to_tcp_state
        ));
        w.push_str(&format!(
            "  bytes read from TCP: {}\r\n",
            inner.tcp_bytes_received
        ));
        w.push_str(&format!(
            "  bytes written to TCP: {}\r\n",
            inner.tcp_bytes_sent
        ));
        w.push_str(&format!(
            "  bytes read from device: {}\r\n",
            inner.dev_bytes_received
        ));
        w.push_str(&format!(
            "  bytes written to device: {}\r\n",
            inner.dev_bytes_sent
        ));
        if inner.config_num == -1 {
            w.push_str("  Port will be deleted when current session closes.\r\n");
        } else if inner.new_config.is_some() {
            w.push_str("  Port will be reconfigured when current session closes.\r\n");
        }
        out
    }

    /// Addresses this port is currently listening on.
    pub fn listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .listeners
            .iter()
            .filter_map(|l| l.listener.local_addr().ok())
            .collect()
    }

    /// One-line `showshortport` row.
    pub fn show_short(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        out.push_str(&format!("{:<22} ", self.name));
        if inner.config_num == -1 {
            out.push_str(&format!("{:<6} ", "DEL"));
        } else {
            out.push_str(&format!("{:<6} ", inner.cfg.mode.to_string()));
        }
        out.push_str(&format!("{:>7} ", inner.timeout));
        out.push_str(&format!("{:<23}", peer_str(inner.peer)));
        out.push_str(&format!("{:<22} ", inner.cfg.devname));
        out.push_str(&format!("{:<14} ", inner.tcp_to_dev_state.to_string()));
        out.push_str(&format!("{:<14} ", inner.dev_to_tcp_state.to_string()));
        out.push_str(&format!("{:>9} ", inner.tcp_bytes_received));
        out.push_str(&format!("{:>9} ", inner.tcp_bytes_sent));
        out.push_str(&format!("{:>9} ", inner.dev_bytes_received));
        out.push_str(&format!("{:>9} ", inner.dev_bytes_sent));
        let mut need_space = false;
        if inner.cfg.mode != Mode::RawLp {
            out.push_str(&inner.dev.show_devcfg());
            need_space = true;
        }
        if inner.tcp_to_dev_state != XferState::Unconnected {
            if need_space {
                out.push(' ');
            }
            out.push_str(&inner.dev.show_devcontrol());
        }
        out.push_str("\r\n");
        out
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.reactor.free_timer(self.timer);
        self.reactor.free_timer(self.send_timer);
    }
}

/// Session-socket events.
impl FdHandler for Port {
    fn read_ready(&self, _fd: RawFd) {
        self.arc().handle_tcp_fd_read();
    }

    fn write_ready(&self, _fd: RawFd) {
        self.arc().handle_tcp_fd_write_ready();
    }

    fn except_ready(&self, _fd: RawFd) {
        self.arc().handle_tcp_fd_except();
    }

    fn cleared(&self, _fd: RawFd) {
        self.arc().session_fd_cleared();
    }
}

/// Device events.
impl DeviceEvents for Port {
    fn dev_read_ready(&self) {
        self.arc().handle_dev_fd_read();
    }

    fn dev_write_ready(&self) {
        self.arc().handle_dev_fd_write();
    }

    fn dev_except(&self) {
        let port = self.arc();
        let mut guard = port.inner.lock().unwrap();
        let inner = &mut *guard;
        log::error!("Select exception on device for port {}", port.name);
        port.shutdown_port(inner, "fd exception");
    }
}

pub(crate) fn recalc_chardelay(cfg: &PortConfig, params: SerialParams) -> u32 {
    if !cfg.enable_chardelay || params.bps == 0 {
        return 0;
    }
    // delay is (bpc / bps) * scale/10 seconds, in microseconds
    let delay = params.bpc * 100_000 * cfg.chardelay_scale / params.bps;
    delay.max(cfg.chardelay_min)
}

fn peer_str(peer: Option<std::net::SocketAddr>) -> String {
    match peer {
        Some(p) => format!("{},{}", p.ip(), p.port()),
        None => "*err*,*err*".to_string(),
    }
}
