//! The termios-backed serial device: opens with a UUCP lock, applies the
//! configured line discipline, registers its fd with the reactor, and
//! carries the RFC 2217 set/query operations onto ioctls.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode as FileMode;
use nix::sys::termios::{
    cfmakeraw, cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsendbreak, tcsetattr, BaudRate,
    ControlFlags, FlowArg, FlushArg, InputFlags, SetArg, Termios,
};

use telnet::rfc2217::{BaudRequest, ModemState, Purge};

use portmux::config::{PortConfig, Rs485Config};
use portmux::device::{DeviceError, DeviceEvents, DeviceIo, SerialParams};
use portmux::reactor::{FdHandler, Reactor};
use portmux::Mode;

use crate::uucp::{self, UucpLock};

/// Supported rates: integer rate, termios constant, Cisco IOS index (-1
/// when the Cisco encoding has no code for it).
const BAUD_RATES: &[(u32, BaudRate, i8)] = &[
    (50, BaudRate::B50, -1),
    (75, BaudRate::B75, -1),
    (110, BaudRate::B110, -1),
    (134, BaudRate::B134, -1),
    (150, BaudRate::B150, -1),
    (200, BaudRate::B200, -1),
    (300, BaudRate::B300, 3),
    (600, BaudRate::B600, 4),
    (1200, BaudRate::B1200, 5),
    (1800, BaudRate::B1800, -1),
    (2400, BaudRate::B2400, 6),
    (4800, BaudRate::B4800, 7),
    (9600, BaudRate::B9600, 8),
    (19200, BaudRate::B19200, 10),
    (38400, BaudRate::B38400, 12),
    (57600, BaudRate::B57600, 13),
    (115200, BaudRate::B115200, 14),
    (230400, BaudRate::B230400, 15),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }

    fn word(self) -> &'static str {
        match self {
            Parity::None => "NONE",
            Parity::Even => "EVEN",
            Parity::Odd => "ODD",
        }
    }
}

/// The parsed line discipline a port configures its device with.
#[derive(Clone, Copy, Debug)]
struct SerialSettings {
    baud: u32,
    databits: u8,
    parity: Parity,
    stopbits: u8,
    xonxoff: bool,
    rtscts: bool,
    local: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud: 9600,
            databits: 8,
            parity: Parity::None,
            stopbits: 1,
            xonxoff: false,
            rtscts: false,
            local: false,
        }
    }
}

impl SerialSettings {
    fn parse(devcfg: &str) -> Result<SerialSettings, DeviceError> {
        let mut s = SerialSettings::default();
        for tok in devcfg.split_whitespace() {
            if let Ok(rate) = tok.parse::<u32>() {
                if !BAUD_RATES.iter().any(|(r, _, _)| *r == rate) {
                    return Err(DeviceError(format!("unsupported baud rate: {rate}")));
                }
                s.baud = rate;
                continue;
            }
            match tok {
                "EVEN" => s.parity = Parity::Even,
                "ODD" => s.parity = Parity::Odd,
                "NONE" => s.parity = Parity::None,
                "1STOPBIT" => s.stopbits = 1,
                "2STOPBITS" => s.stopbits = 2,
                "5DATABITS" => s.databits = 5,
                "6DATABITS" => s.databits = 6,
                "7DATABITS" => s.databits = 7,
                "8DATABITS" => s.databits = 8,
                "XONXOFF" => s.xonxoff = true,
                "-XONXOFF" => s.xonxoff = false,
                "RTSCTS" => s.rtscts = true,
                "-RTSCTS" => s.rtscts = false,
                "LOCAL" => s.local = true,
                "-LOCAL" => s.local = false,
                _ => return Err(DeviceError(format!("unknown option: {tok}"))),
            }
        }
        Ok(s)
    }

    /// Bits per character on the wire: start + data + parity + stop.
    fn bpc(&self) -> u32 {
        1 + u32::from(self.databits)
            + u32::from(self.stopbits)
            + u32::from(self.parity != Parity::None)
    }

    fn apply(&self, t: &mut Termios) -> Result<(), DeviceError> {
        cfmakeraw(t);
        let rate = baud_const(self.baud).ok_or_else(|| {
            DeviceError(format!("unsupported baud rate: {}", self.baud))
        })?;
        cfsetispeed(t, rate).map_err(dev_err)?;
        cfsetospeed(t, rate).map_err(dev_err)?;

        t.control_flags.remove(ControlFlags::CSIZE);
        t.control_flags.insert(match self.databits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        });

        t.control_flags.set(ControlFlags::CSTOPB, self.stopbits == 2);
        t.control_flags
            .set(ControlFlags::PARENB, self.parity != Parity::None);
        t.control_flags
            .set(ControlFlags::PARODD, self.parity == Parity::Odd);
        t.control_flags.set(ControlFlags::CRTSCTS, self.rtscts);
        t.control_flags.set(ControlFlags::CLOCAL, self.local);
        t.control_flags.insert(ControlFlags::CREAD);

        t.input_flags
            .set(InputFlags::IXON | InputFlags::IXOFF, self.xonxoff);
        Ok(())
    }
}

fn baud_const(rate: u32) -> Option<BaudRate> {
    BAUD_RATES
        .iter()
        .find(|(r, _, _)| *r == rate)
        .map(|(_, c, _)| *c)
}

fn dev_err(e: nix::Error) -> DeviceError {
    DeviceError(e.to_string())
}

fn io_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

// The RS-485 ioctl payload; not exposed by libc.
#[repr(C)]
#[derive(Default)]
struct SerialRs485 {
    flags: u32,
    delay_rts_before_send: u32,
    delay_rts_after_send: u32,
    padding: [u32; 5],
}

const TIOCSRS485: libc::c_ulong = 0x542f;
const SER_RS485_ENABLED: u32 = 1 << 0;
const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
const SER_RS485_RX_DURING_TX: u32 = 1 << 4;

fn apply_rs485(fd: RawFd, conf: &Rs485Config) -> Result<(), DeviceError> {
    let mut arg = SerialRs485 {
        flags: SER_RS485_ENABLED,
        delay_rts_before_send: conf.delay_rts_before_send,
        delay_rts_after_send: conf.delay_rts_after_send,
        ..Default::default()
    };
    if conf.rts_on_send {
        arg.flags |= SER_RS485_RTS_ON_SEND;
    }
    if conf.rts_after_send {
        arg.flags |= SER_RS485_RTS_AFTER_SEND;
    }
    if conf.rx_during_tx {
        arg.flags |= SER_RS485_RX_DURING_TX;
    }
    let rv = unsafe { libc::ioctl(fd, TIOCSRS485, &arg) };
    if rv < 0 {
        return Err(DeviceError(format!(
            "could not set RS-485 mode: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn modem_lines(fd: RawFd) -> Option<libc::c_int> {
    let mut lines: libc::c_int = 0;
    let rv = unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut lines) };
    (rv == 0).then_some(lines)
}

fn modem_line_change(fd: RawFd, bits: libc::c_int, set: bool) {
    let op = if set { libc::TIOCMBIS } else { libc::TIOCMBIC };
    let rv = unsafe { libc::ioctl(fd, op, &bits) };
    if rv < 0 {
        log::warn!(
            "modem control change failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Shared between the device object (owned by the port) and the fd
/// handler registered with the reactor.
struct SerShared {
    events: Option<Arc<dyn DeviceEvents>>,
    fd: Option<OwnedFd>,
    lock: Option<UucpLock>,
    pending_done: Option<Box<dyn FnOnce() + Send>>,
}

struct SerialFdHandler {
    shared: Arc<Mutex<SerShared>>,
}

impl FdHandler for SerialFdHandler {
    fn read_ready(&self, _fd: RawFd) {
        let events = self.shared.lock().unwrap().events.clone();
        if let Some(events) = events {
            events.dev_read_ready();
        }
    }

    fn write_ready(&self, _fd: RawFd) {
        let events = self.shared.lock().unwrap().events.clone();
        if let Some(events) = events {
            events.dev_write_ready();
        }
    }

    fn except_ready(&self, _fd: RawFd) {
        let events = self.shared.lock().unwrap().events.clone();
        if let Some(events) = events {
            events.dev_except();
        }
    }

    fn cleared(&self, _fd: RawFd) {
        // Close, release the lock, then tell the port the device is gone.
        let (done, _fd, _lock) = {
            let mut shared = self.shared.lock().unwrap();
            shared.events = None;
            (
                shared.pending_done.take(),
                shared.fd.take(),
                shared.lock.take(),
            )
        };
        if let Some(done) = done {
            done();
        }
    }
}

pub struct SerialDevice {
    devname: String,
    reactor: Arc<dyn Reactor>,
    settings: SerialSettings,
    rs485: Option<Rs485Config>,
    shared: Arc<Mutex<SerShared>>,
    handler: Arc<SerialFdHandler>,
}

impl SerialDevice {
    pub fn new(
        reactor: Arc<dyn Reactor>,
        cfg: &PortConfig,
    ) -> Result<SerialDevice, DeviceError> {
        let settings = SerialSettings::parse(&cfg.devcfg)?;
        let shared = Arc::new(Mutex::new(SerShared {
            events: None,
            fd: None,
            lock: None,
            pending_done: None,
        }));
        Ok(SerialDevice {
            devname: cfg.devname.clone(),
            reactor,
            settings,
            rs485: cfg.rs485,
            shared: shared.clone(),
            handler: Arc::new(SerialFdHandler { shared }),
        })
    }

    fn fd(&self) -> Option<RawFd> {
        self.shared.lock().unwrap().fd.as_ref().map(|f| f.as_raw_fd())
    }

    fn with_termios(
        &self,
        f: impl FnOnce(&mut Termios),
    ) -> Result<(), DeviceError> {
        let shared = self.shared.lock().unwrap();
        let Some(fd) = shared.fd.as_ref() else {
            return Err(DeviceError::new("device is not open"));
        };
        let mut t = tcgetattr(fd).map_err(dev_err)?;
        f(&mut t);
        tcsetattr(fd, SetArg::TCSANOW, &t).map_err(dev_err)
    }

    fn current_baud(&self) -> u32 {
        self.settings.baud
    }
}

impl DeviceIo for SerialDevice {
    fn devname(&self) -> &str {
        &self.devname
    }

    fn setup(
        &mut self,
        mode: Mode,
        events: Arc<dyn DeviceEvents>,
    ) -> Result<SerialParams, DeviceError> {
        let lock = uucp::acquire(&self.devname).map_err(|e| DeviceError(format!("{e}\r\n")))?;

        let base = if mode == Mode::RawLp {
            OFlag::O_WRONLY
        } else {
            OFlag::O_RDWR
        };
        let oflag = base | OFlag::O_NONBLOCK | OFlag::O_NOCTTY;
        let raw = open(self.devname.as_str(), oflag, FileMode::empty())
            .map_err(|e| DeviceError(format!("Could not open device {}: {e}\r\n", self.devname)))?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if mode != Mode::RawLp {
            let mut t = tcgetattr(&fd)
                .map_err(|e| DeviceError(format!("Could not get termios: {e}\r\n")))?;
            self.settings.apply(&mut t)?;
            tcsetattr(&fd, SetArg::TCSANOW, &t)
                .map_err(|e| DeviceError(format!("Could not set termios: {e}\r\n")))?;
            let _ = tcflush(&fd, FlushArg::TCIOFLUSH);
        }

        if let Some(conf) = &self.rs485 {
            apply_rs485(fd.as_raw_fd(), conf)?;
        }

        let raw_fd = fd.as_raw_fd();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.fd = Some(fd);
            shared.lock = lock;
            shared.events = Some(events);
            shared.pending_done = None;
        }
        self.reactor.set_fd_handlers(raw_fd, self.handler.clone());

        Ok(SerialParams {
            bps: self.settings.baud,
            bpc: self.settings.bpc(),
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let shared = self.shared.lock().unwrap();
        let Some(fd) = shared.fd.as_ref() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        nix::unistd::read(fd.as_raw_fd(), buf).map_err(io_err)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let shared = self.shared.lock().unwrap();
        let Some(fd) = shared.fd.as_ref() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        nix::unistd::write(fd.as_raw_fd(), buf).map_err(io_err)
    }

    fn flush(&mut self, dir: Purge) {
        let shared = self.shared.lock().unwrap();
        if let Some(fd) = shared.fd.as_ref() {
            let arg = match dir {
                Purge::Receive => FlushArg::TCIFLUSH,
                Purge::Transmit => FlushArg::TCOFLUSH,
                Purge::Both => FlushArg::TCIOFLUSH,
            };
            let _ = tcflush(fd, arg);
        }
    }

    fn send_break(&mut self) {
        let shared = self.shared.lock().unwrap();
        if let Some(fd) = shared.fd.as_ref() {
            let _ = tcsendbreak(fd, 0);
        }
    }

    fn get_modem_state(&mut self) -> Option<ModemState> {
        let fd = self.fd()?;
        let lines = modem_lines(fd)?;
        let mut state = ModemState::empty();
        if lines & libc::TIOCM_CAR != 0 {
            state |= ModemState::CD;
        }
        if lines & libc::TIOCM_RNG != 0 {
            state |= ModemState::RI;
        }
        if lines & libc::TIOCM_DSR != 0 {
            state |= ModemState::DSR;
        }
        if lines & libc::TIOCM_CTS != 0 {
            state |= ModemState::CTS;
        }
        Some(state)
    }

    fn baud_rate(&mut self, req: BaudRequest) -> (u32, u32) {
        let entry = match req {
            BaudRequest::Rfc(rate) => BAUD_RATES.iter().find(|(r, _, _)| *r == rate),
            BaudRequest::Cisco(ix) => {
                BAUD_RATES.iter().find(|(_, _, c)| *c == ix as i8)
            }
        };
        let Some(&(rate, tconst, cisco)) = entry else {
            // Unsupported: report what the line is doing now.
            let current = self.current_baud();
            let reply = match req {
                BaudRequest::Rfc(_) => current,
                BaudRequest::Cisco(_) => BAUD_RATES
                    .iter()
                    .find(|(r, _, _)| *r == current)
                    .map_or(0, |(_, _, c)| *c.max(&0) as u32),
            };
            return (reply, current);
        };

        let applied = self.with_termios(|t| {
            let _ = cfsetispeed(t, tconst);
            let _ = cfsetospeed(t, tconst);
        });
        if applied.is_ok() {
            self.settings.baud = rate;
        }
        let reply = match req {
            BaudRequest::Rfc(_) => rate,
            BaudRequest::Cisco(_) => cisco.max(0) as u32,
        };
        (reply, self.settings.baud)
    }

    fn data_size(&mut self, req: u8) -> (u8, u32) {
        if (5..=8).contains(&req) {
            let bits = req;
            if self
                .with_termios(|t| {
                    t.control_flags.remove(ControlFlags::CSIZE);
                    t.control_flags.insert(match bits {
                        5 => ControlFlags::CS5,
                        6 => ControlFlags::CS6,
                        7 => ControlFlags::CS7,
                        _ => ControlFlags::CS8,
                    });
                })
                .is_ok()
            {
                self.settings.databits = bits;
            }
        }
        (self.settings.databits, self.settings.bpc())
    }

    fn parity(&mut self, req: u8) -> (u8, u32) {
        // RFC 2217: 1 none, 2 odd, 3 even.
        let wanted = match req {
            1 => Some(Parity::None),
            2 => Some(Parity::Odd),
            3 => Some(Parity::Even),
            _ => None,
        };
        if let Some(parity) = wanted {
            if self
                .with_termios(|t| {
                    t.control_flags
                        .set(ControlFlags::PARENB, parity != Parity::None);
                    t.control_flags.set(ControlFlags::PARODD, parity == Parity::Odd);
                })
                .is_ok()
            {
                self.settings.parity = parity;
            }
        }
        let current = match self.settings.parity {
            Parity::None => 1,
            Parity::Odd => 2,
            Parity::Even => 3,
        };
        (current, self.settings.bpc())
    }

    fn stop_size(&mut self, req: u8) -> (u8, u32) {
        if req == 1 || req == 2 {
            if self
                .with_termios(|t| t.control_flags.set(ControlFlags::CSTOPB, req == 2))
                .is_ok()
            {
                self.settings.stopbits = req;
            }
        }
        (self.settings.stopbits, self.settings.bpc())
    }

    fn control(&mut self, req: u8) -> u8 {
        let fd = self.fd();
        match req {
            // Flow control: 0 query, 1 none, 2 xonxoff, 3 rtscts.
            0 => {
                if self.settings.rtscts {
                    3
                } else if self.settings.xonxoff {
                    2
                } else {
                    1
                }
            }
            1..=3 => {
                let (xonxoff, rtscts) = match req {
                    2 => (true, false),
                    3 => (false, true),
                    _ => (false, false),
                };
                if self
                    .with_termios(|t| {
                        t.input_flags
                            .set(InputFlags::IXON | InputFlags::IXOFF, xonxoff);
                        t.control_flags.set(ControlFlags::CRTSCTS, rtscts);
                    })
                    .is_ok()
                {
                    self.settings.xonxoff = xonxoff;
                    self.settings.rtscts = rtscts;
                }
                req
            }
            // Break: 4 query, 5 on, 6 off.
            5 | 6 => {
                if let Some(fd) = fd {
                    let rv = unsafe {
                        libc::ioctl(fd, if req == 5 { libc::TIOCSBRK } else { libc::TIOCCBRK })
                    };
                    if rv < 0 {
                        log::warn!("break ioctl failed: {}", std::io::Error::last_os_error());
                    }
                }
                req
            }
            // DTR: 7 query, 8 on, 9 off.
            8 | 9 => {
                if let Some(fd) = fd {
                    modem_line_change(fd, libc::TIOCM_DTR, req == 8);
                }
                req
            }
            7 => fd
                .and_then(modem_lines)
                .map_or(req, |l| if l & libc::TIOCM_DTR != 0 { 8 } else { 9 }),
            // RTS: 10 query, 11 on, 12 off.
            11 | 12 => {
                if let Some(fd) = fd {
                    modem_line_change(fd, libc::TIOCM_RTS, req == 11);
                }
                req
            }
            10 => fd
                .and_then(modem_lines)
                .map_or(req, |l| if l & libc::TIOCM_RTS != 0 { 11 } else { 12 }),
            _ => req,
        }
    }

    fn flow_control(&mut self, suspend: bool) {
        let shared = self.shared.lock().unwrap();
        if let Some(fd) = shared.fd.as_ref() {
            let arg = if suspend {
                FlowArg::TCOOFF
            } else {
                FlowArg::TCOON
            };
            let _ = nix::sys::termios::tcflow(fd, arg);
        }
    }

    fn serparm_to_str(&self) -> String {
        format!(
            "{}{}{}{}",
            self.settings.baud,
            self.settings.parity.letter(),
            self.settings.databits,
            self.settings.stopbits
        )
    }

    fn show_devcfg(&self) -> String {
        format!(
            "{} {} {}STOPBIT {}DATABITS{}{}{}",
            self.settings.baud,
            self.settings.parity.word(),
            self.settings.stopbits,
            self.settings.databits,
            if self.settings.xonxoff { " XONXOFF" } else { "" },
            if self.settings.rtscts { " RTSCTS" } else { "" },
            if self.settings.local { " LOCAL" } else { "" },
        )
    }

    fn show_devcontrol(&self) -> String {
        match self.fd().and_then(modem_lines) {
            Some(lines) => format!(
                "{} {}",
                if lines & libc::TIOCM_DTR != 0 {
                    "DTRHI"
                } else {
                    "DTRLO"
                },
                if lines & libc::TIOCM_RTS != 0 {
                    "RTSHI"
                } else {
                    "RTSLO"
                },
            ),
            None => "DTR? RTS?".to_string(),
        }
    }

    fn set_devcontrol(&mut self, controls: &str) -> Result<(), DeviceError> {
        let Some(fd) = self.fd() else {
            return Err(DeviceError::new("device is not open"));
        };
        for tok in controls.split_whitespace() {
            match tok {
                "DTRHI" => modem_line_change(fd, libc::TIOCM_DTR, true),
                "DTRLO" => modem_line_change(fd, libc::TIOCM_DTR, false),
                "RTSHI" => modem_line_change(fd, libc::TIOCM_RTS, true),
                "RTSLO" => modem_line_change(fd, libc::TIOCM_RTS, false),
                _ => return Err(DeviceError(format!("invalid control: {tok}"))),
            }
        }
        Ok(())
    }

    fn reconfig(&mut self, devcfg: &str) -> Result<(), DeviceError> {
        // Takes effect at the next setup.
        self.settings = SerialSettings::parse(devcfg)?;
        Ok(())
    }

    fn read_handler_enable(&self, enable: bool) {
        if let Some(fd) = self.fd() {
            self.reactor.set_read_enabled(fd, enable);
        }
    }

    fn write_handler_enable(&self, enable: bool) {
        if let Some(fd) = self.fd() {
            self.reactor.set_write_enabled(fd, enable);
        }
    }

    fn except_handler_enable(&self, enable: bool) {
        if let Some(fd) = self.fd() {
            self.reactor.set_except_enabled(fd, enable);
        }
    }

    fn shutdown(&mut self, done: Box<dyn FnOnce() + Send>) {
        let fd = {
            let mut shared = self.shared.lock().unwrap();
            match shared.fd.as_ref().map(|fd| fd.as_raw_fd()) {
                Some(raw_fd) => {
                    shared.pending_done = Some(done);
                    raw_fd
                }
                None => {
                    drop(shared);
                    done();
                    return;
                }
            }
        };
        self.reactor.clear_fd_handlers(fd);
    }
}
