//! Socket plumbing shared by the port and control planes. std's types
//! cover most of it; `nix` fills in keepalive and out-of-band reads.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::socket::{recv, setsockopt, sockopt, MsgFlags};

/// The byte stream of one session: a TCP socket, or an fd pair for
/// stdio-backed ports (and for pipe-driven tests). All I/O goes through
/// shared references, the way `&TcpStream` works, so monitor tees don't
/// need exclusive access.
#[derive(Debug)]
pub enum SessionIo {
    Tcp(TcpStream),
    Pair { rx: File, tx: File },
}

impl SessionIo {
    pub fn read_fd(&self) -> RawFd {
        match self {
            SessionIo::Tcp(s) => s.as_raw_fd(),
            SessionIo::Pair { rx, .. } => rx.as_raw_fd(),
        }
    }

    pub fn write_fd(&self) -> RawFd {
        match self {
            SessionIo::Tcp(s) => s.as_raw_fd(),
            SessionIo::Pair { tx, .. } => tx.as_raw_fd(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            SessionIo::Tcp(s) => s.peer_addr().ok(),
            SessionIo::Pair { .. } => None,
        }
    }

    /// Drain pending TCP urgent data, returning how many bytes were eaten.
    /// Not meaningful for fd pairs.
    pub fn drain_oob(&self) -> usize {
        let SessionIo::Tcp(s) = self else { return 0 };
        let mut n = 0;
        let mut byte = [0u8; 1];
        while let Ok(got @ 1..) = recv(s.as_raw_fd(), &mut byte, MsgFlags::MSG_OOB) {
            n += got;
        }
        n
    }
}

impl Read for &SessionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SessionIo::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.read(buf)
            }
            SessionIo::Pair { rx, .. } => {
                let mut rx: &File = rx;
                rx.read(buf)
            }
        }
    }
}

impl Write for &SessionIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SessionIo::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.write(buf)
            }
            SessionIo::Pair { tx, .. } => {
                let mut tx: &File = tx;
                tx.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Options every accepted data socket gets: nonblocking, no Nagle
/// batching, keepalive probes.
pub fn configure_session_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    setsockopt(stream, sockopt::KeepAlive, &true)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Resolve a listen spec and bind a nonblocking listener for every address
/// it names. A bare port number listens on all IPv4 interfaces.
pub fn bind_listeners(spec: &str) -> io::Result<Vec<TcpListener>> {
    let spec_with_host;
    let spec = if spec.contains(':') {
        spec
    } else {
        spec_with_host = format!("0.0.0.0:{spec}");
        &spec_with_host
    };

    let mut listeners = Vec::new();
    let mut last_err = None;
    for addr in spec.to_socket_addrs()? {
        match TcpListener::bind(addr) {
            Ok(l) => {
                l.set_nonblocking(true)?;
                listeners.push(l);
            }
            Err(e) => last_err = Some(e),
        }
    }
    if listeners.is_empty() {
        return Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses")));
    }
    Ok(listeners)
}

/// Accept with would-block squelched to `None`.
pub fn accept_nonblocking(l: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match l.accept() {
        Ok(pair) => Ok(Some(pair)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Accept and immediately refuse with a polite message.
pub fn accept_and_reject(l: &TcpListener, msg: &str) {
    if let Ok(Some((stream, _))) = accept_nonblocking(l) {
        let mut s: &TcpStream = &stream;
        let _ = s.write_all(msg.as_bytes());
    }
}
