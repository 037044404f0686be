//! End-to-end scenarios against the production stack: the epoll reactor,
//! the termios device (over a pty), and real TCP clients. The deeper
//! state-machine coverage lives with the engine; these prove the daemon's
//! own plumbing carries bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};

use portmux::config::{EmptyResolver, PortConfig, PortDefaults};
use portmux::device::{DeviceFactory, DeviceIo};
use portmux::reactor::Reactor;
use portmux::registry::Registry;
use portmux::Mode;

use portmuxd::reactor::EpollReactor;
use portmuxd::serial::SerialDevice;

struct Harness {
    reactor: Arc<EpollReactor>,
    registry: Arc<Registry>,
    master: PtyMaster,
    pts: String,
}

fn harness() -> Harness {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK).unwrap();
    grantpt(&master).unwrap();
    unlockpt(&master).unwrap();
    let pts = ptsname_r(&master).unwrap();

    let reactor = EpollReactor::new().unwrap();
    let dyn_reactor: Arc<dyn Reactor> = reactor.clone();
    let factory: DeviceFactory = {
        let reactor = dyn_reactor.clone();
        Arc::new(move |cfg: &PortConfig| {
            SerialDevice::new(reactor.clone(), cfg).map(|d| Box::new(d) as Box<dyn DeviceIo>)
        })
    };
    let registry = Registry::new(dyn_reactor, factory, Arc::new(EmptyResolver), None);
    Harness {
        reactor,
        registry,
        master,
        pts,
    }
}

impl Harness {
    fn add_port(&self, mode: Mode, options: &str) -> std::net::SocketAddr {
        let mut cfg = PortConfig::new("127.0.0.1:0", &self.pts, &PortDefaults::default());
        cfg.mode = mode;
        cfg.enable_chardelay = false;
        cfg.devcfg = options.to_string();
        self.registry.add_port(cfg).unwrap();
        self.registry.find_port("127.0.0.1:0", true).unwrap().listen_addrs()[0]
    }

    /// Spin the reactor until `pred` holds or the deadline passes.
    fn drive_until(&self, timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.reactor.turn(Some(Duration::from_millis(10)));
            if pred() {
                return true;
            }
        }
        false
    }

    fn master_read(&self, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        self.drive_until(Duration::from_secs(2), || {
            if let Ok(n) = nix::unistd::read(self.master.as_raw_fd(), &mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
            out.len() >= want
        });
        out
    }

    fn master_write(&self, data: &[u8]) {
        nix::unistd::write(self.master.as_raw_fd(), data).unwrap();
    }
}

fn client_read(h: &Harness, stream: &mut TcpStream, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    h.drive_until(Duration::from_secs(2), || {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => {}
        }
        out.len() >= want
    });
    out
}

#[test]
fn raw_echo_round_trip() {
    let h = harness();
    let addr = h.add_port(Mode::Raw, "");

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nonblocking(true).unwrap();

    client.write_all(b"hello\n").unwrap();
    let got = h.master_read(6);
    assert_eq!(got, b"hello\n");

    h.master_write(b"hello\n");
    let got = client_read(&h, &mut client, 6);
    assert_eq!(got, b"hello\n");

    // Close and reconnect: the port comes back around to accepting.
    drop(client);
    h.drive_until(Duration::from_millis(300), || false);
    let mut again = TcpStream::connect(addr).unwrap();
    again.set_nonblocking(true).unwrap();
    again.write_all(b"second\n").unwrap();
    let got = h.master_read(7);
    assert!(got.ends_with(b"second\n"));
}

#[test]
fn telnet_negotiates_and_sets_baud() {
    use telnet::{option, DO, IAC, SB, SE, WILL};

    let h = harness();
    let mut cfg = PortConfig::new("127.0.0.1:0", &h.pts, &PortDefaults::default());
    cfg.mode = Mode::Telnet;
    cfg.allow_2217 = true;
    cfg.enable_chardelay = false;
    cfg.devcfg = "9600 8DATABITS NONE 1STOPBIT".into();
    h.registry.add_port(cfg).unwrap();
    let addr = h
        .registry
        .find_port("127.0.0.1:0", true)
        .unwrap()
        .listen_addrs()[0];

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nonblocking(true).unwrap();

    // Server speaks first.
    let greeting = client_read(&h, &mut client, 3);
    assert!(greeting
        .windows(3)
        .any(|w| w == [IAC, WILL, option::SUPPRESS_GO_AHEAD]));

    client.write_all(&[IAC, WILL, option::COM_PORT]).unwrap();
    let reply = client_read(&h, &mut client, 3);
    assert!(reply.windows(3).any(|w| w == [IAC, DO, option::COM_PORT]));

    // SET-BAUDRATE 19200; the reply echoes the accepted rate.
    client
        .write_all(&[IAC, SB, 44, 1, 0x00, 0x00, 0x4b, 0x00, IAC, SE])
        .unwrap();
    let reply = client_read(&h, &mut client, 10);
    let expect = [IAC, SB, 44, 101, 0x00, 0x00, 0x4b, 0x00, IAC, SE];
    assert!(reply.windows(expect.len()).any(|w| w == expect));
}

#[test]
fn admin_endpoint_answers_over_the_real_loop() {
    let h = harness();
    let _addr = h.add_port(Mode::Raw, "");

    let dyn_reactor: Arc<dyn Reactor> = h.reactor.clone();
    let plane = portmux::control::ControlPlane::new(
        dyn_reactor,
        h.registry.clone(),
        "portmuxd",
        "0.0.0",
    );
    plane.startup("127.0.0.1:0").unwrap();
    let addr = plane.listen_addrs()[0];

    let mut admin = TcpStream::connect(addr).unwrap();
    admin.set_nonblocking(true).unwrap();

    let greeting = client_read(&h, &mut admin, 3);
    assert!(String::from_utf8_lossy(&greeting).contains("-> "));

    admin.write_all(b"showshortport\r").unwrap();
    let out = client_read(&h, &mut admin, 80);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("Port name"));
    assert!(text.contains("127.0.0.1:0"));
}
