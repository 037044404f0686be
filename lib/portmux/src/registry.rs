//! The port registry: the ordered set of configured ports, protected by a
//! single mutex, plus the configuration-generation machinery. Replacing a
//! busy port parks the new configuration on the entry and applies it at
//! the next idle transition; deleting one marks it and unlinks it when the
//! session ends.

use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::config::{ConfigError, ConfigResolver, PortConfig};
use crate::control::ControlSession;
use crate::device::DeviceFactory;
use crate::net::{self, SessionIo};
use crate::port::{PendingPort, Port, XferState};
use crate::reactor::{Reactor, Waiter};
use crate::rotator::Rotator;
use crate::Mode;

/// Host-access predicate consulted on every data-port accept.
pub type AccessCheck = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

pub struct Registry {
    pub(crate) reactor: Arc<dyn Reactor>,
    factory: DeviceFactory,
    resolver: Arc<dyn ConfigResolver>,
    access: Option<AccessCheck>,
    ports: Mutex<Vec<Arc<Port>>>,
    rotators: Mutex<Vec<Arc<Rotator>>>,
    /// Woken once per port that is unlinked and freed.
    gone: Arc<Waiter>,
}

impl Registry {
    pub fn new(
        reactor: Arc<dyn Reactor>,
        factory: DeviceFactory,
        resolver: Arc<dyn ConfigResolver>,
        access: Option<AccessCheck>,
    ) -> Arc<Registry> {
        Arc::new(Registry {
            reactor,
            factory,
            resolver,
            access,
            ports: Mutex::new(Vec::new()),
            rotators: Mutex::new(Vec::new()),
            gone: Waiter::new(),
        })
    }

    pub(crate) fn resolver(&self) -> Arc<dyn ConfigResolver> {
        self.resolver.clone()
    }

    pub(crate) fn access_allowed(&self, peer: Option<SocketAddr>) -> bool {
        match (&self.access, peer) {
            (Some(check), Some(peer)) => check(peer),
            _ => true,
        }
    }

    /// Create a port from a configuration, or arrange for an existing port
    /// with the same name to be replaced (immediately if idle, at session
    /// end otherwise).
    pub fn add_port(self: &Arc<Self>, cfg: PortConfig) -> Result<(), ConfigError> {
        if cfg.devname.starts_with("sol.") {
            return Err(ConfigError::new(
                "sol. devices are not supported by this build",
            ));
        }
        let dev = (self.factory)(&cfg)
            .map_err(|e| ConfigError(format!("device configuration invalid: {e}")))?;

        let mut ports = self.ports.lock().unwrap();
        if let Some(pos) = ports.iter().position(|p| p.name == cfg.name) {
            let curr = ports[pos].clone();
            let mut ci = curr.inner.lock().unwrap();
            if ci.dev_to_tcp_state == XferState::Unconnected {
                self.switchout_locked(&mut ports, pos, &mut ci, PendingPort { cfg, dev })?;
            } else {
                // Replace once the user closes the connection.
                ci.config_num = cfg.config_num;
                ci.new_config = Some(PendingPort { cfg, dev });
            }
            return Ok(());
        }

        let mode = cfg.mode;
        let stdio = cfg.is_stdio();
        let port = Port::new(self.reactor.clone(), Arc::downgrade(self), cfg, dev);
        if mode != Mode::Disabled && !stdio {
            let mut inner = port.inner.lock().unwrap();
            port.startup(&mut inner)?;
        }
        ports.push(port);
        Ok(())
    }

    /// Swap a replacement in at `pos`, migrating the old port's listening
    /// sockets by retargeting their accept handlers in place.
    fn switchout_locked(
        self: &Arc<Self>,
        ports: &mut Vec<Arc<Port>>,
        pos: usize,
        curr_inner: &mut crate::port::PortInner,
        pending: PendingPort,
    ) -> Result<(), ConfigError> {
        let target_mode = pending.cfg.mode;
        let mut cfg = pending.cfg;
        // Start from the old port's live enable state, then apply the new
        // one below so listener setup/teardown happens exactly once.
        cfg.mode = curr_inner.cfg.mode;
        let new_port = Port::new(self.reactor.clone(), Arc::downgrade(self), cfg, pending.dev);
        {
            let mut ni = new_port.inner.lock().unwrap();
            ni.listeners = std::mem::take(&mut curr_inner.listeners);
            for l in &ni.listeners {
                *l.handler.port.lock().unwrap() = Arc::downgrade(&new_port);
            }
        }
        ports[pos] = new_port.clone();
        let mut ni = new_port.inner.lock().unwrap();
        self.change_enable_locked(&new_port, &mut ni, target_mode)
    }

    fn change_enable_locked(
        self: &Arc<Self>,
        port: &Arc<Port>,
        inner: &mut crate::port::PortInner,
        state: Mode,
    ) -> Result<(), ConfigError> {
        if inner.cfg.mode == state {
            return Ok(());
        }
        if state == Mode::Disabled {
            inner.cfg.mode = Mode::Disabled;
            port.teardown_listeners(inner);
        } else if inner.cfg.mode == Mode::Disabled {
            if !inner.cfg.is_stdio() {
                port.startup(inner)?;
            }
            inner.cfg.mode = state;
        } else {
            inner.cfg.mode = state;
        }
        Ok(())
    }

    /// Runtime enable-state change (`setportenable`).
    pub fn set_port_enable(self: &Arc<Self>, port: &Arc<Port>, state: Mode) -> Result<(), ConfigError> {
        let mut inner = port.inner.lock().unwrap();
        self.change_enable_locked(port, &mut inner, state)
    }

    /// Drop every port whose configuration was not refreshed by the load
    /// identified by `config_num` (deferred while connected).
    pub fn clear_old_config(self: &Arc<Self>, config_num: i32) {
        let mut ports = self.ports.lock().unwrap();
        let mut i = 0;
        while i < ports.len() {
            let port = ports[i].clone();
            let mut inner = port.inner.lock().unwrap();
            if inner.config_num != config_num {
                if inner.dev_to_tcp_state == XferState::Unconnected {
                    let _ = self.change_enable_locked(&port, &mut inner, Mode::Disabled);
                    drop(inner);
                    ports.remove(i);
                    continue;
                }
                inner.config_num = -1;
                let _ = self.change_enable_locked(&port, &mut inner, Mode::Disabled);
            }
            i += 1;
        }
    }

    /// Mark every port deleted and start shutting it down.
    pub fn shutdown_all(self: &Arc<Self>) {
        let snapshot: Vec<_> = self.ports.lock().unwrap().clone();
        for port in snapshot {
            let mut inner = port.inner.lock().unwrap();
            inner.config_num = -1;
            let _ = self.change_enable_locked(&port, &mut inner, Mode::Disabled);
            port.shutdown_port(&mut inner, "program shutdown");
        }
    }

    /// [`shutdown_all`](Self::shutdown_all) and pump the reactor until
    /// every port has drained and been unlinked.
    pub fn shutdown_all_and_wait(self: &Arc<Self>) {
        let count = self.ports.lock().unwrap().len() as u64;
        self.shutdown_all();
        self.gone.wait(count, &*self.reactor);
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().unwrap().is_empty()
    }

    pub(crate) fn unlink_port(&self, port: &Arc<Port>) {
        let mut ports = self.ports.lock().unwrap();
        ports.retain(|p| !Arc::ptr_eq(p, port));
        drop(ports);
        self.gone.wake();
    }

    /// A port finished its session with a replacement parked on it;
    /// install the replacement, inheriting the listening sockets.
    pub(crate) fn apply_new_config(self: &Arc<Self>, old: &Arc<Port>) {
        let mut ports = self.ports.lock().unwrap();
        let Some(pos) = ports.iter().position(|p| Arc::ptr_eq(p, old)) else {
            return;
        };
        let curr = ports[pos].clone();
        let mut ci = curr.inner.lock().unwrap();
        let Some(pending) = ci.new_config.take() else {
            return;
        };
        if let Err(e) = self.switchout_locked(&mut ports, pos, &mut ci, pending) {
            log::error!("Error applying new configuration to port {}: {e}", curr.name);
        }
    }

    pub fn find_port(&self, name: &str, allow_deleted: bool) -> Option<Arc<Port>> {
        let ports = self.ports.lock().unwrap();
        let port = ports.iter().find(|p| p.name == name)?.clone();
        drop(ports);
        if !allow_deleted && port.inner.lock().unwrap().config_num == -1 {
            return None;
        }
        Some(port)
    }

    /// Ports in configuration order, for the show commands.
    pub fn snapshot(&self) -> Vec<Arc<Port>> {
        self.ports.lock().unwrap().clone()
    }

    fn device_in_use_elsewhere(ports: &[Arc<Port>], me: &Arc<Port>, devname: &str) -> bool {
        ports.iter().any(|p| {
            if Arc::ptr_eq(p, me) {
                return false;
            }
            let pi = p.inner.lock().unwrap();
            pi.cfg.devname == devname && pi.tcp_to_dev_state != XferState::Unconnected
        })
    }

    /// A connection request arrived on one of `port`'s listeners.
    pub(crate) fn port_accept_ready(self: &Arc<Self>, port: &Arc<Port>, fd: RawFd) {
        let ports = self.ports.lock().unwrap();
        let mut guard = port.inner.lock().unwrap();
        let inner = &mut *guard;

        if inner.cfg.mode == Mode::Disabled || inner.config_num == -1 {
            // Clear the backlog entry and drop it on the floor.
            if let Some(l) = inner.listeners.iter().find(|l| l.fd() == fd) {
                let _ = net::accept_nonblocking(&l.listener);
            }
            return;
        }

        let mut err = None;
        if inner.tcp_to_dev_state != XferState::Unconnected {
            if inner.cfg.kickolduser {
                // Drop the current user; the pending accept is re-delivered
                // once the port comes back to Unconnected.
                port.shutdown_port(inner, "kicked off, new user is coming\r\n");
                return;
            }
            err = Some("Port already in use\r\n");
        }

        if err.is_none() && Self::device_in_use_elsewhere(&ports, port, &inner.cfg.devname) {
            err = Some("Port's device already in use\r\n");
        }

        if let Some(msg) = err {
            if let Some(l) = inner.listeners.iter().find(|l| l.fd() == fd) {
                net::accept_and_reject(&l.listener, msg);
            }
            return;
        }

        port.accept_into(inner, fd);
    }

    /// A connection request arrived on a rotator; dispatch it to the first
    /// free port in its list.
    pub(crate) fn rotator_accept_ready(self: &Arc<Self>, rot: &Arc<Rotator>, fd: RawFd) {
        let ports = self.ports.lock().unwrap();

        let hit = rot.pick(|name| Self::port_free_in(&ports, name));
        match hit {
            Some(port) => {
                let Some((stream, peer)) = rot.accept_from(fd) else {
                    return;
                };
                if let Err(e) = net::configure_session_socket(&stream) {
                    log::error!("Could not set up socket options on rotator {}: {e}", rot.name);
                    return;
                }
                let mut inner = port.inner.lock().unwrap();
                port.setup_session(&mut inner, SessionIo::Tcp(stream), Some(peer));
            }
            None => rot.reject(fd, "No free port found\r\n"),
        }
    }

    fn port_free_in(ports: &[Arc<Port>], name: &str) -> Option<Arc<Port>> {
        let port = ports.iter().find(|p| p.name == name)?;
        let pi = port.inner.lock().unwrap();
        if pi.tcp_to_dev_state == XferState::Unconnected
            && pi.config_num != -1
            && pi.cfg.mode != Mode::Disabled
            && !Self::device_in_use_elsewhere(ports, port, &pi.cfg.devname)
        {
            drop(pi);
            Some(port.clone())
        } else {
            None
        }
    }

    pub fn add_rotator(
        self: &Arc<Self>,
        name: &str,
        portv: Vec<String>,
    ) -> Result<Arc<Rotator>, ConfigError> {
        let rot = Rotator::new(self.reactor.clone(), Arc::downgrade(self), name, portv)?;
        self.rotators.lock().unwrap().push(rot.clone());
        Ok(rot)
    }

    pub fn clear_rotators(&self) {
        for rot in self.rotators.lock().unwrap().drain(..) {
            rot.teardown();
        }
    }

    /// Start the session on a stdio-backed port. The daemon hands in the
    /// already-nonblocking stdin/stdout files.
    pub fn start_stdio(self: &Arc<Self>, rx: File, tx: File) -> Result<(), ConfigError> {
        let ports = self.ports.lock().unwrap();
        let port = ports
            .iter()
            .find(|p| p.inner.lock().unwrap().cfg.is_stdio())
            .cloned()
            .ok_or_else(|| ConfigError::new("no stdio port configured"))?;
        let mut inner = port.inner.lock().unwrap();
        if Self::device_in_use_elsewhere(&ports, &port, &inner.cfg.devname) {
            return Err(ConfigError::new("Port's device already in use"));
        }
        if !port.setup_session(&mut inner, SessionIo::Pair { rx, tx }, None) {
            return Err(ConfigError::new("could not set up the stdio session"));
        }
        Ok(())
    }

    // ---- control-plane entry points ----

    /// `monitor tcp|term <portspec>`: attach `session` to the named port's
    /// monitor slot. Error strings go back to the session verbatim.
    pub fn monitor_start(
        &self,
        session: &Arc<ControlSession>,
        kind: &str,
        portspec: &str,
    ) -> Result<Weak<Port>, String> {
        let Some(port) = self.find_port(portspec, true) else {
            return Err(format!("Invalid port number: {portspec}\r\n"));
        };
        let mut inner = port.inner.lock().unwrap();
        if inner.tcp_monitor.upgrade().is_some() || inner.dev_monitor.upgrade().is_some() {
            return Err("Port is already being monitored\r\n".to_string());
        }
        match kind {
            "tcp" => inner.tcp_monitor = Arc::downgrade(session),
            "term" => inner.dev_monitor = Arc::downgrade(session),
            _ => return Err(format!("invalid monitor type: {kind}\r\n")),
        }
        drop(inner);
        Ok(Arc::downgrade(&port))
    }

    /// Detach a monitor. A port that no longer exists is a no-op.
    pub fn monitor_stop(&self, handle: &Weak<Port>) {
        let Some(port) = handle.upgrade() else {
            return;
        };
        let ports = self.ports.lock().unwrap();
        if ports.iter().any(|p| Arc::ptr_eq(p, &port)) {
            let mut inner = port.inner.lock().unwrap();
            inner.tcp_monitor = Weak::new();
            inner.dev_monitor = Weak::new();
        }
    }

    /// `disconnect <portspec>`.
    pub fn disconnect_port(&self, portspec: &str) -> Result<(), String> {
        let Some(port) = self.find_port(portspec, true) else {
            return Err(format!("Invalid port number: {portspec}\r\n"));
        };
        let mut inner = port.inner.lock().unwrap();
        if inner.tcp_to_dev_state == XferState::Unconnected {
            return Err(format!("Port not connected: {portspec}\r\n"));
        }
        port.shutdown_port(&mut inner, "disconnect");
        Ok(())
    }
}
