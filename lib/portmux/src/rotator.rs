//! A rotator: a listening endpoint that owns no device, handing each
//! accepted connection to the first free port in an ordered list.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use crate::config::ConfigError;
use crate::net;
use crate::port::Port;
use crate::reactor::{FdHandler, Reactor};
use crate::registry::Registry;

pub struct Rotator {
    pub(crate) name: String,
    reactor: Arc<dyn Reactor>,
    registry: Weak<Registry>,
    inner: Mutex<RotInner>,
}

struct RotInner {
    portv: Vec<String>,
    curr: usize,
    listeners: Vec<(TcpListener, Arc<RotAcceptHandler>)>,
    closing: Vec<TcpListener>,
}

struct RotAcceptHandler {
    rot: Weak<Rotator>,
}

impl FdHandler for RotAcceptHandler {
    fn read_ready(&self, fd: RawFd) {
        let Some(rot) = self.rot.upgrade() else {
            return;
        };
        let Some(registry) = rot.registry.upgrade() else {
            return;
        };
        registry.rotator_accept_ready(&rot, fd);
    }

    fn write_ready(&self, _fd: RawFd) {}

    fn cleared(&self, fd: RawFd) {
        if let Some(rot) = self.rot.upgrade() {
            rot.inner
                .lock()
                .unwrap()
                .closing
                .retain(|l| l.as_raw_fd() != fd);
        }
    }
}

impl Rotator {
    pub(crate) fn new(
        reactor: Arc<dyn Reactor>,
        registry: Weak<Registry>,
        name: &str,
        portv: Vec<String>,
    ) -> Result<Arc<Rotator>, ConfigError> {
        if portv.is_empty() {
            return Err(ConfigError(format!("Rotator {name} has no ports")));
        }
        let listeners = net::bind_listeners(name).map_err(|e| {
            ConfigError(format!("Unable to create TCP socket for rotator {name}: {e}"))
        })?;
        let rot = Arc::new_cyclic(|weak: &Weak<Rotator>| {
            let mut bound = Vec::new();
            for listener in listeners {
                let handler = Arc::new(RotAcceptHandler { rot: weak.clone() });
                let fd = listener.as_raw_fd();
                reactor.set_fd_handlers(fd, handler.clone());
                reactor.set_read_enabled(fd, true);
                bound.push((listener, handler));
            }
            Rotator {
                name: name.to_string(),
                reactor: reactor.clone(),
                registry,
                inner: Mutex::new(RotInner {
                    portv,
                    curr: 0,
                    listeners: bound,
                    closing: Vec::new(),
                }),
            }
        });
        Ok(rot)
    }

    /// Addresses this rotator is listening on.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .listeners
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// Walk the port list from the cursor, returning the first free port
    /// and advancing the cursor just past it.
    pub(crate) fn pick(&self, free: impl Fn(&str) -> Option<Arc<Port>>) -> Option<Arc<Port>> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.portv.len();
        let start = inner.curr;
        let mut i = start;
        loop {
            let hit = free(&inner.portv[i]);
            i = (i + 1) % len;
            if let Some(port) = hit {
                inner.curr = i;
                return Some(port);
            }
            if i == start {
                return None;
            }
        }
    }

    pub(crate) fn accept_from(&self, fd: RawFd) -> Option<(TcpStream, SocketAddr)> {
        let inner = self.inner.lock().unwrap();
        let listener = inner
            .listeners
            .iter()
            .find(|(l, _)| l.as_raw_fd() == fd)?;
        match net::accept_nonblocking(&listener.0) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Could not accept on rotator {}: {e}", self.name);
                None
            }
        }
    }

    pub(crate) fn reject(&self, fd: RawFd, msg: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some((l, _)) = inner.listeners.iter().find(|(l, _)| l.as_raw_fd() == fd) {
            net::accept_and_reject(l, msg);
        }
    }

    pub(crate) fn teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        let listeners = std::mem::take(&mut inner.listeners);
        for (l, _) in listeners {
            let fd = l.as_raw_fd();
            self.reactor.set_read_enabled(fd, false);
            self.reactor.clear_fd_handlers(fd);
            inner.closing.push(l);
        }
    }
}
