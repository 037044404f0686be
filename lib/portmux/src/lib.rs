//! The per-port data-transfer engine: everything between a listening TCP
//! endpoint and a local character device. A [`registry::Registry`] owns a set
//! of [`port::Port`]s, each a state machine that accepts one TCP session at a
//! time, optionally negotiates telnet and RFC 2217, and relays bytes in both
//! directions with buffering, pacing, inactivity timeouts and tracing. A
//! [`control::ControlPlane`] provides the line-oriented administrative
//! endpoint that can inspect, monitor, retarget and disconnect ports while
//! traffic flows.
//!
//! The engine performs no OS event handling of its own: it is written
//! against the [`reactor::Reactor`] trait for fd/timer dispatch and the
//! [`device::DeviceIo`] trait for the character device, so the whole thing
//! can be driven deterministically from tests.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod control;
pub mod device;
pub mod expand;
pub mod port;
pub mod reactor;
pub mod registry;
pub mod rotator;
pub mod trace;

mod net;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

/// How a port treats its TCP side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Not accepting connections.
    Disabled,
    /// Bytes pass through untouched.
    Raw,
    /// Like raw, but output-only: the device is opened for writing and its
    /// read side is never armed (line-printer style devices).
    RawLp,
    /// Telnet option negotiation, IAC escaping, and (when allowed) RFC 2217.
    Telnet,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Disabled => "off",
            Mode::Raw => "raw",
            Mode::RawLp => "rawlp",
            Mode::Telnet => "telnet",
        })
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "off" => Ok(Mode::Disabled),
            "raw" => Ok(Mode::Raw),
            "rawlp" => Ok(Mode::RawLp),
            "telnet" => Ok(Mode::Telnet),
            _ => Err(()),
        }
    }
}
