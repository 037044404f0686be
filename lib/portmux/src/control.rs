//! The administrative endpoint: a line-oriented command interface over
//! telnet, capped at a handful of concurrent sessions. Sessions can
//! inspect and mutate ports and tee a port's traffic ("monitor"), with
//! monitor output strictly best-effort so a slow admin connection never
//! backpressures the port it is watching.

use std::net::TcpListener;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;

use telnet::{OptionEntry, TelnetCodec, TelnetEvents, TelnetOut};

use crate::net::{self, SessionIo};
use crate::port::{Port, XferState};
use crate::reactor::{FdHandler, Reactor};
use crate::registry::Registry;
use crate::Mode;

/// Longest accepted input line.
const INBUF_SIZE: usize = 255;

/// How many admin connections may be open at once.
const MAX_SESSIONS: usize = 4;

const PROMPT: &str = "-> ";

const HELP_STR: &str = "\
exit - leave the program.\r\n\
help - display this help.\r\n\
version - display the version of this program.\r\n\
monitor <type> <tcp port> - display all the input for a given port on\r\n\
       the calling control port.  Only one direction may be monitored\r\n\
       at a time.  The type field may be 'tcp' or 'term' and specifies\r\n\
       whether to monitor data from the TCP port or from the serial port\r\n\
       Note that data monitoring is best effort, if the controller port\r\n\
       cannot keep up the data will be silently dropped.  A controller\r\n\
       may only monitor one thing and a port may only be monitored by\r\n\
       one controller.\r\n\
monitor stop - stop the current monitor.\r\n\
disconnect <tcp port> - disconnect the tcp connection on the port.\r\n\
showport [<tcp port>] - Show information about a port. If no port is\r\n\
       given, all ports are displayed.\r\n\
showshortport [<tcp port>] - Show information about a port in a one-line\r\n\
       format. If no port is given, all ports are displayed.\r\n\
setporttimeout <tcp port> <timeout> - Set the amount of time in seconds\r\n\
       before the port connection will be shut down if no activity\r\n\
       has been seen on the port.\r\n\
setportconfig <tcp port> <config> - Set the port configuration as in\r\n\
       the device configuration in the configuration file.  Valid options\r\n\
       are: 300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, \r\n\
       EVEN, ODD, NONE, 1STOPBIT, 2STOPBITS, 7DATABITS, 8DATABITS, \r\n\
       LOCAL (ignore modem control), [-]RTSCTS, [-]XONXOFF.\r\n\
       Note that these will not change until the port is disconnected\r\n\
       and connected again.\r\n\
setportcontrol <tcp port> <controls>\r\n\
       Dynamically modify the characteristics of the port.  These are\r\n\
       immedaite and won't live between connections.  Valid controls are\r\n\
       DTRHI, DTRLO, RTSHI, and RTSLO.\r\n\
setportenable <tcp port> <enable state> - Sets the port operation state.\r\n\
       Valid states are:\r\n\
         off - The port is shut down\r\n\
         raw - The port is up and all I/O is transferred\r\n\
         rawlp - The port is up and the input is transferred to dev\r\n\
         telnet - The port is up and the telnet negotiation protocol\r\n\
                  runs on the port.\r\n";

slotmap::new_key_type! {
    pub(crate) struct SessionKey;
}

/// Telnet events for admin sessions; negotiation replies come from the
/// option table, everything else is ignored.
struct CtlTelnetEvents;

impl TelnetEvents for CtlTelnetEvents {}

fn ctl_telnet() -> (TelnetCodec, TelnetOut) {
    use telnet::{option, DONT, IAC, WILL};
    let init = [
        IAC, WILL, option::SUPPRESS_GO_AHEAD,
        IAC, WILL, option::ECHO,
        IAC, DONT, option::ECHO,
    ];
    let table = vec![
        OptionEntry::new(option::SUPPRESS_GO_AHEAD).i_do().sent_will(),
        OptionEntry::new(option::ECHO).i_do().sent_will().sent_do(),
        OptionEntry::new(option::BINARY_TRANSMISSION)
            .i_will()
            .i_do()
            .sent_do(),
    ];
    (TelnetCodec::new(table), TelnetOut::new(&init))
}

pub struct ControlPlane {
    reactor: Arc<dyn Reactor>,
    registry: Arc<Registry>,
    product: String,
    version: String,
    inner: Mutex<CpInner>,
}

struct CpInner {
    listeners: Vec<(TcpListener, Arc<CpAcceptHandler>)>,
    closing: Vec<TcpListener>,
    sessions: slotmap::DenseSlotMap<SessionKey, Arc<ControlSession>>,
}

struct CpAcceptHandler {
    plane: Weak<ControlPlane>,
}

impl FdHandler for CpAcceptHandler {
    fn read_ready(&self, fd: RawFd) {
        if let Some(plane) = self.plane.upgrade() {
            plane.accept_ready(fd);
        }
    }

    fn write_ready(&self, _fd: RawFd) {}

    fn cleared(&self, fd: RawFd) {
        if let Some(plane) = self.plane.upgrade() {
            plane
                .inner
                .lock()
                .unwrap()
                .closing
                .retain(|l| l.as_raw_fd() != fd);
        }
    }
}

impl ControlPlane {
    pub fn new(
        reactor: Arc<dyn Reactor>,
        registry: Arc<Registry>,
        product: &str,
        version: &str,
    ) -> Arc<ControlPlane> {
        Arc::new(ControlPlane {
            reactor,
            registry,
            product: product.to_string(),
            version: version.to_string(),
            inner: Mutex::new(CpInner {
                listeners: Vec::new(),
                closing: Vec::new(),
                sessions: slotmap::DenseSlotMap::with_key(),
            }),
        })
    }

    /// Bind the admin listen spec and start accepting sessions.
    pub fn startup(self: &Arc<Self>, spec: &str) -> io::Result<()> {
        let listeners = net::bind_listeners(spec)?;
        let mut inner = self.inner.lock().unwrap();
        for listener in listeners {
            let handler = Arc::new(CpAcceptHandler {
                plane: Arc::downgrade(self),
            });
            let fd = listener.as_raw_fd();
            self.reactor.set_fd_handlers(fd, handler.clone());
            self.reactor.set_read_enabled(fd, true);
            inner.listeners.push((listener, handler));
        }
        Ok(())
    }

    fn accept_ready(self: &Arc<Self>, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        let Some((listener, _)) = inner.listeners.iter().find(|(l, _)| l.as_raw_fd() == fd)
        else {
            return;
        };

        if inner.sessions.len() >= MAX_SESSIONS {
            net::accept_and_reject(listener, "Too many controller ports\r\n");
            return;
        }

        let (stream, _peer) = match net::accept_nonblocking(listener) {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(e) => {
                log::error!("Could not accept on the controller port: {e}");
                return;
            }
        };
        if stream.set_nonblocking(true).is_err() || stream.set_nodelay(true).is_err() {
            return;
        }

        let io = SessionIo::Tcp(stream);
        let read_fd = io.read_fd();
        let (codec, out) = ctl_telnet();
        let reactor = self.reactor.clone();
        let registry = self.registry.clone();
        let plane = Arc::downgrade(self);
        let session = inner.sessions.insert_with_key(|key| {
            Arc::new_cyclic(|weak: &Weak<ControlSession>| ControlSession {
                reactor,
                registry,
                plane,
                self_ref: weak.clone(),
                key,
                inner: Mutex::new(CsInner {
                    io: Some(io),
                    inbuf: Vec::with_capacity(INBUF_SIZE),
                    out: BytesMut::new(),
                    tn_codec: codec,
                    tn_out: out,
                    monitor: None,
                    in_shutdown: false,
                    clears_pending: 0,
                }),
            })
        });
        let session = inner.sessions[session].clone();
        drop(inner);

        self.reactor.set_fd_handlers(read_fd, session.clone());
        self.reactor.set_read_enabled(read_fd, true);
        {
            let mut cs = session.inner.lock().unwrap();
            // The telnet init sequence is already queued; the prompt rides
            // along behind it.
            session.output(&mut cs, PROMPT.as_bytes());
            session.arm_write(&cs);
        }
    }

    fn remove_session(&self, key: SessionKey) {
        self.inner.lock().unwrap().sessions.remove(key);
    }

    /// Stop accepting and close every session.
    pub fn shutdown(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let listeners = std::mem::take(&mut inner.listeners);
        for (l, _) in listeners {
            let fd = l.as_raw_fd();
            self.reactor.set_read_enabled(fd, false);
            self.reactor.clear_fd_handlers(fd);
            inner.closing.push(l);
        }
        let sessions: Vec<_> = inner.sessions.values().cloned().collect();
        drop(inner);
        for session in sessions {
            let mut cs = session.inner.lock().unwrap();
            session.shutdown_session(&mut cs);
        }
    }

    /// Addresses the admin endpoint is listening on.
    pub fn listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .listeners
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// True once every session has fully torn down.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.sessions.is_empty() && inner.closing.is_empty()
    }
}

pub struct ControlSession {
    reactor: Arc<dyn Reactor>,
    registry: Arc<Registry>,
    plane: Weak<ControlPlane>,
    self_ref: Weak<ControlSession>,
    key: SessionKey,
    inner: Mutex<CsInner>,
}

struct CsInner {
    io: Option<SessionIo>,
    inbuf: Vec<u8>,
    /// Buffered command/echo output; monitor data bypasses this.
    out: BytesMut,
    tn_codec: TelnetCodec,
    tn_out: TelnetOut,
    monitor: Option<Weak<Port>>,
    in_shutdown: bool,
    clears_pending: u32,
}

impl ControlSession {
    /// Best-effort tee of monitored port traffic: write what fits, drop
    /// the rest, never push back on the port.
    pub(crate) fn monitor_write(&self, data: &[u8]) {
        let inner = self.inner.lock().unwrap();
        if inner.in_shutdown {
            return;
        }
        if let Some(io) = &inner.io {
            let mut w: &SessionIo = io;
            let _ = w.write(data);
        }
    }

    /// Queue command output, arming the writer when the buffer starts.
    fn output(&self, inner: &mut CsInner, data: &[u8]) {
        if inner.out.is_empty() && !data.is_empty() {
            self.arm_write(inner);
        }
        inner.out.extend_from_slice(data);
    }

    fn output_str(&self, inner: &mut CsInner, s: &str) {
        self.output(inner, s.as_bytes());
    }

    fn arm_write(&self, inner: &CsInner) {
        if let Some(io) = &inner.io {
            self.reactor.set_read_enabled(io.read_fd(), false);
            self.reactor.set_write_enabled(io.write_fd(), true);
        }
    }

    fn shutdown_session(self: &Arc<Self>, inner: &mut CsInner) {
        if inner.in_shutdown {
            return;
        }
        if let Some(handle) = inner.monitor.take() {
            self.registry.monitor_stop(&handle);
        }
        inner.in_shutdown = true;
        match &inner.io {
            Some(io) => {
                let read_fd = io.read_fd();
                let write_fd = io.write_fd();
                inner.clears_pending = if write_fd == read_fd { 1 } else { 2 };
                self.reactor.clear_fd_handlers(read_fd);
                if write_fd != read_fd {
                    self.reactor.clear_fd_handlers(write_fd);
                }
            }
            None => {
                if let Some(plane) = self.plane.upgrade() {
                    plane.remove_session(self.key);
                }
            }
        }
    }

    fn handle_read(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.in_shutdown {
            return;
        }

        let mut scratch = [0u8; 128];
        let count = {
            let Some(io) = inner.io.as_ref() else { return };
            let mut r: &SessionIo = io;
            match r.read(&mut scratch) {
                Ok(0) => {
                    self.shutdown_session(inner);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("read error for controller port: {e}");
                    self.shutdown_session(inner);
                    return;
                }
            }
        };

        let cleaned = inner.tn_codec.process(
            &mut scratch,
            count,
            &mut inner.tn_out,
            &mut CtlTelnetEvents,
        );
        if inner.tn_codec.error() || inner.tn_out.overflowed() {
            self.shutdown_session(inner);
            return;
        }
        if inner.tn_out.have_pending() {
            self.arm_write(inner);
        }

        for i in 0..cleaned {
            let b = scratch[i];
            match b {
                0 | b'\n' => {}
                b'\x08' | 0x7f => {
                    // Backspace; erase on screen too.
                    if inner.inbuf.pop().is_some() {
                        self.output(inner, b"\x08 \x08");
                    }
                }
                b'\r' => {
                    self.output(inner, b"\r\n");
                    let line = String::from_utf8_lossy(&inner.inbuf).into_owned();
                    inner.inbuf.clear();
                    if self.process_input_line(inner, &line) {
                        // Session was shut down by the command.
                        return;
                    }
                    self.output_str(inner, PROMPT);
                }
                _ => {
                    if inner.inbuf.len() >= INBUF_SIZE {
                        self.output_str(inner, "Input line too long\r\n");
                        inner.inbuf.clear();
                    } else {
                        inner.inbuf.push(b);
                        self.output(inner, &[b]);
                    }
                }
            }
        }
    }

    /// Dispatch one command line. Returns true if the session went away.
    fn process_input_line(self: &Arc<Self>, inner: &mut CsInner, line: &str) -> bool {
        let mut parts = line.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or("").trim();
        let rest = parts.next().unwrap_or("").trim();

        match cmd {
            "" => {}
            "exit" | "quit" => {
                self.shutdown_session(inner);
                return true;
            }
            "help" => self.output_str(inner, HELP_STR),
            "version" => {
                let (product, version) = match self.plane.upgrade() {
                    Some(p) => (p.product.clone(), p.version.clone()),
                    None => (String::new(), String::new()),
                };
                self.output_str(inner, &format!("{product} version {version}\r\n"));
            }
            "showport" => {
                if rest.is_empty() {
                    for port in self.registry.snapshot() {
                        let text = port.show_long();
                        self.output_str(inner, &text);
                    }
                } else {
                    match self.registry.find_port(rest, true) {
                        Some(port) => {
                            let text = port.show_long();
                            self.output_str(inner, &text);
                        }
                        None => {
                            self.output_str(inner, &format!("Invalid port number: {rest}\r\n"))
                        }
                    }
                }
            }
            "showshortport" => {
                self.output_str(
                    inner,
                    &format!(
                        "{:<22} {:<6} {:>7} {:<22} {:<22} {:<14} {:<14} {:>9} {:>9} {:>9} {:>9} {}\r\n",
                        "Port name",
                        "Type",
                        "Timeout",
                        "Remote address",
                        "Device",
                        "TCP to device",
                        "Device to TCP",
                        "TCP in",
                        "TCP out",
                        "Dev in",
                        "Dev out",
                        "State"
                    ),
                );
                if rest.is_empty() {
                    for port in self.registry.snapshot() {
                        let text = port.show_short();
                        self.output_str(inner, &text);
                    }
                } else {
                    match self.registry.find_port(rest, true) {
                        Some(port) => {
                            let text = port.show_short();
                            self.output_str(inner, &text);
                        }
                        None => {
                            self.output_str(inner, &format!("Invalid port number: {rest}\r\n"))
                        }
                    }
                }
            }
            "monitor" => {
                let mut args = rest.split_whitespace();
                match args.next() {
                    None => self.output_str(inner, "No monitor type given\r\n"),
                    Some("stop") => {
                        if let Some(handle) = inner.monitor.take() {
                            self.registry.monitor_stop(&handle);
                        }
                    }
                    Some(kind) => {
                        if inner.monitor.is_some() {
                            self.output_str(inner, "Already monitoring a port\r\n");
                        } else {
                            match args.next() {
                                None => self.output_str(inner, "No tcp port given\r\n"),
                                Some(portspec) => {
                                    match self.registry.monitor_start(self, kind, portspec) {
                                        Ok(handle) => inner.monitor = Some(handle),
                                        Err(msg) => self.output_str(inner, &msg),
                                    }
                                }
                            }
                        }
                    }
                }
            }
            "disconnect" => {
                if rest.is_empty() {
                    self.output_str(inner, "No port given\r\n");
                } else if let Err(msg) = self.registry.disconnect_port(rest) {
                    self.output_str(inner, &msg);
                }
            }
            "setporttimeout" => {
                let mut args = rest.split_whitespace();
                let Some(portspec) = args.next() else {
                    self.output_str(inner, "No port given\r\n");
                    return false;
                };
                let Some(timeout) = args.next() else {
                    self.output_str(inner, "No timeout given\r\n");
                    return false;
                };
                match self.registry.find_port(portspec, true) {
                    None => self.output_str(inner, &format!("Invalid port number: {portspec}\r\n")),
                    Some(port) => match timeout.parse::<u32>() {
                        Ok(secs) => port.set_timeout(secs),
                        Err(_) => {
                            self.output_str(inner, &format!("Invalid timeout: {timeout}\r\n"))
                        }
                    },
                }
            }
            "setportenable" => {
                let mut args = rest.split_whitespace();
                let Some(portspec) = args.next() else {
                    self.output_str(inner, "No port given\r\n");
                    return false;
                };
                let Some(enable) = args.next() else {
                    self.output_str(inner, "No enable state given\r\n");
                    return false;
                };
                let Ok(mode) = enable.parse::<Mode>() else {
                    self.output_str(inner, &format!("Invalid enable: {enable}\r\n"));
                    return false;
                };
                match self.registry.find_port(portspec, false) {
                    None => self.output_str(inner, &format!("Invalid port number: {portspec}\r\n")),
                    Some(port) => {
                        if let Err(e) = self.registry.set_port_enable(&port, mode) {
                            self.output_str(inner, &format!("{e}\r\n"));
                        }
                    }
                }
            }
            "setportconfig" => {
                let mut args = rest.splitn(2, char::is_whitespace);
                let Some(portspec) = args.next().filter(|s| !s.is_empty()) else {
                    self.output_str(inner, "No port given\r\n");
                    return false;
                };
                let Some(devcfg) = args.next().filter(|s| !s.trim().is_empty()) else {
                    self.output_str(inner, "No device config\r\n");
                    return false;
                };
                match self.registry.find_port(portspec, false) {
                    None => self.output_str(inner, &format!("Invalid port number: {portspec}\r\n")),
                    Some(port) => {
                        if port.reconfig(devcfg.trim()).is_err() {
                            self.output_str(inner, "Invalid device config\r\n");
                        }
                    }
                }
            }
            "setportcontrol" => {
                let mut args = rest.splitn(2, char::is_whitespace);
                let Some(portspec) = args.next().filter(|s| !s.is_empty()) else {
                    self.output_str(inner, "No port given\r\n");
                    return false;
                };
                let Some(controls) = args.next().filter(|s| !s.trim().is_empty()) else {
                    self.output_str(inner, "No device controls\r\n");
                    return false;
                };
                match self.registry.find_port(portspec, false) {
                    None => self.output_str(inner, &format!("Invalid port number: {portspec}\r\n")),
                    Some(port) => {
                        let connected = {
                            let pi = port.inner.lock().unwrap();
                            pi.tcp_to_dev_state != XferState::Unconnected
                        };
                        if !connected {
                            self.output_str(
                                inner,
                                &format!("Port is not currently connected: {portspec}\r\n"),
                            );
                        } else if port.set_devcontrol(controls.trim()).is_err() {
                            self.output_str(inner, "Invalid device controls\r\n");
                        }
                    }
                }
            }
            other => self.output_str(inner, &format!("Unknown command: {other}\r\n")),
        }
        false
    }

    fn handle_write(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.in_shutdown {
            return;
        }
        let Some(io) = inner.io.as_ref() else { return };

        // Telnet protocol bytes drain before command output.
        if inner.tn_out.have_pending() {
            let mut w: &SessionIo = io;
            match w.write(inner.tn_out.data()) {
                Ok(n) => inner.tn_out.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        log::error!("The tcp write for controller had error: {e}");
                    }
                    self.shutdown_session(inner);
                    return;
                }
            }
            if inner.tn_out.have_pending() {
                return;
            }
        }

        let mut w: &SessionIo = io;
        match w.write(&inner.out) {
            Ok(n) => {
                let _ = inner.out.split_to(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    log::error!("The tcp write for controller had error: {e}");
                }
                self.shutdown_session(inner);
                return;
            }
        }
        if inner.out.is_empty() {
            self.reactor.set_read_enabled(io.read_fd(), true);
            self.reactor.set_write_enabled(io.write_fd(), false);
        }
    }

    fn fd_cleared(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clears_pending = inner.clears_pending.saturating_sub(1);
        if inner.clears_pending > 0 {
            return;
        }
        inner.io = None;
        drop(inner);
        if let Some(plane) = self.plane.upgrade() {
            plane.remove_session(self.key);
        }
    }
}

impl ControlSession {
    fn arc(&self) -> Arc<ControlSession> {
        self.self_ref
            .upgrade()
            .expect("controller callback after drop")
    }
}

impl FdHandler for ControlSession {
    fn read_ready(&self, _fd: RawFd) {
        self.arc().handle_read();
    }

    fn write_ready(&self, _fd: RawFd) {
        self.arc().handle_write();
    }

    fn cleared(&self, _fd: RawFd) {
        self.arc().fd_cleared();
    }
}
