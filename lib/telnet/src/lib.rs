//! A sans-I/O telnet codec. It parses IAC command sequences out of a byte
//! stream, drives option negotiation from a per-connection option table, and
//! assembles SB…SE suboptions, without doing any networking itself. Outbound
//! protocol bytes are queued on a [`TelnetOut`] that the caller drains into
//! its socket whenever it decides output is ready.
//!
//! The parser ([`TelnetCodec`]) and the outbound queue ([`TelnetOut`]) are
//! separate objects so that an event handler may enqueue replies while the
//! parser is in the middle of [`process`](TelnetCodec::process)ing input.
//!
//! ```
//! use telnet::{TelnetCodec, TelnetOut, TelnetEvents, OptionEntry, option};
//!
//! struct NoEvents;
//! impl TelnetEvents for NoEvents {}
//!
//! let table = vec![OptionEntry::new(option::SUPPRESS_GO_AHEAD).i_do().sent_will()];
//! let mut codec = TelnetCodec::new(table);
//! let mut out = TelnetOut::new(&[]);
//!
//! // "a" IAC IAC "b" carries a literal 0xff byte
//! let mut buf = [b'a', 255, 255, b'b'];
//! let len = buf.len();
//! let n = codec.process(&mut buf, len, &mut out, &mut NoEvents);
//! assert_eq!(&buf[..n], &[b'a', 255, b'b']);
//! ```

#![forbid(unsafe_code)]

mod codec;
pub mod rfc2217;

pub use codec::{TelnetCodec, TelnetEvents, TelnetOut, MAX_SUBOPTION_SIZE};

/// Interpret As Command, the telnet escape byte.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
/// Suboption begin.
pub const SB: u8 = 250;
/// Suboption end.
pub const SE: u8 = 240;
/// The command byte associated with TCP urgent-data synchronization.
pub const DATA_MARK: u8 = 242;
pub const BREAK: u8 = 243;

/// Telnet option codes used here.
pub mod option {
    pub const BINARY_TRANSMISSION: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SUPPRESS_GO_AHEAD: u8 = 3;
    /// RFC 2217 com-port-option.
    pub const COM_PORT: u8 = 44;
}

/// One row of the option negotiation table.
///
/// `i_will`/`i_do` say which sides of the option we are prepared to enable;
/// `sent_will`/`sent_do` record requests we sent in the initial negotiation
/// sequence, so the peer's first matching reply is treated as an
/// acknowledgment rather than a fresh request.
#[derive(Clone, Copy, Debug)]
pub struct OptionEntry {
    pub option: u8,
    pub i_will: bool,
    pub i_do: bool,
    pub sent_will: bool,
    pub sent_do: bool,
    /// Ask [`TelnetEvents::will_offered`] before accepting a peer WILL.
    pub notify_will: bool,
    /// Deliver completed suboptions for this option to
    /// [`TelnetEvents::suboption`].
    pub has_suboption: bool,
}

impl OptionEntry {
    pub fn new(option: u8) -> Self {
        OptionEntry {
            option,
            i_will: false,
            i_do: false,
            sent_will: false,
            sent_do: false,
            notify_will: false,
            has_suboption: false,
        }
    }

    pub fn i_will(mut self) -> Self {
        self.i_will = true;
        self
    }

    pub fn i_do(mut self) -> Self {
        self.i_do = true;
        self
    }

    pub fn sent_will(mut self) -> Self {
        self.sent_will = true;
        self
    }

    pub fn sent_do(mut self) -> Self {
        self.sent_do = true;
        self
    }

    pub fn notify_will(mut self) -> Self {
        self.notify_will = true;
        self
    }

    pub fn has_suboption(mut self) -> Self {
        self.has_suboption = true;
        self
    }
}
