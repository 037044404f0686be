//! The character-device abstraction a port relays against. The daemon's
//! termios implementation lives in the binary crate; tests plug in loopback
//! devices. A device owns its own fd and reactor registration; the engine
//! only sees the event callbacks it delivers through [`DeviceEvents`].

use std::fmt;
use std::io;
use std::sync::Arc;

use telnet::rfc2217::{BaudRequest, ModemState, Purge};

use crate::Mode;

/// Serial timing parameters reported by [`DeviceIo::setup`] and updated by
/// the RFC 2217 set operations. `bpc` is bits per character on the wire
/// (data bits + start/stop/parity), used for character-delay pacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialParams {
    pub bps: u32,
    pub bpc: u32,
}

impl Default for SerialParams {
    fn default() -> Self {
        // 9600 8N1
        SerialParams { bps: 9600, bpc: 10 }
    }
}

/// A device-layer failure with a message suitable for the peer or the log.
#[derive(Debug)]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new(msg: impl Into<String>) -> Self {
        DeviceError(msg.into())
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeviceError {}

/// Callbacks a device delivers when its fd becomes ready. Implemented by
/// the port; enabled and disabled through the `*_handler_enable` toggles.
pub trait DeviceEvents: Send + Sync {
    fn dev_read_ready(&self);
    fn dev_write_ready(&self);
    fn dev_except(&self);
}

pub trait DeviceIo: Send {
    fn devname(&self) -> &str;

    /// Open and configure the device for a new session, registering its fd
    /// with the reactor and wiring `events`. Handler enables all start
    /// false. `RawLp` opens output-only.
    fn setup(
        &mut self,
        mode: Mode,
        events: Arc<dyn DeviceEvents>,
    ) -> Result<SerialParams, DeviceError>;

    /// Nonblocking read; would-block surfaces as
    /// `io::ErrorKind::WouldBlock`, EOF as `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Nonblocking write.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self, dir: Purge);
    fn send_break(&mut self);

    /// Current modem-state bits, if the device can report them.
    fn get_modem_state(&mut self) -> Option<ModemState>;

    // RFC 2217 set/query operations. Each applies what it can and returns
    // the value to echo in the server reply, plus the refreshed timing
    // parameter the character delay depends on.
    fn baud_rate(&mut self, req: BaudRequest) -> (u32, u32);
    fn data_size(&mut self, req: u8) -> (u8, u32);
    fn parity(&mut self, req: u8) -> (u8, u32);
    fn stop_size(&mut self, req: u8) -> (u8, u32);
    fn control(&mut self, req: u8) -> u8;
    fn flow_control(&mut self, suspend: bool);

    /// Compact "9600N81"-style parameter string for banner expansion.
    fn serparm_to_str(&self) -> String;

    /// Human-readable configuration, for `showport`.
    fn show_devcfg(&self) -> String;

    /// Human-readable control-line state, for `showport` while connected.
    fn show_devcontrol(&self) -> String;

    /// Apply control tokens (DTRHI, RTSLO, …) to the live device.
    fn set_devcontrol(&mut self, controls: &str) -> Result<(), DeviceError>;

    /// Re-parse a device configuration string; takes effect at next setup.
    fn reconfig(&mut self, devcfg: &str) -> Result<(), DeviceError>;

    fn read_handler_enable(&self, enable: bool);
    fn write_handler_enable(&self, enable: bool);
    fn except_handler_enable(&self, enable: bool);

    /// Tear the session down: deregister from the reactor, drain what the
    /// OS requires, close. `done` runs once no further event callback can
    /// fire.
    fn shutdown(&mut self, done: Box<dyn FnOnce() + Send>);
}

/// Creates a configured-but-closed device for a port. Validation of the
/// devcfg string happens here, at configuration time.
pub type DeviceFactory =
    Arc<dyn Fn(&crate::config::PortConfig) -> Result<Box<dyn DeviceIo>, DeviceError> + Send + Sync>;

/// An LED flashed on relay traffic. Flashes are fire-and-forget.
pub trait Led: Send + Sync {
    fn flash(&self);
    fn name(&self) -> &str;
}
