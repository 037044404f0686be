use bytes::BytesMut;

use crate::{OptionEntry, DO, DONT, IAC, SB, SE, WILL, WONT};

/// Upper bound on an assembled suboption, option code included. Bytes past
/// the limit are dropped; the truncated suboption is still delivered.
pub const MAX_SUBOPTION_SIZE: usize = 256;

/// Upper bound on queued outbound protocol bytes. Exceeding it marks the
/// queue overflowed, which callers treat as a protocol error.
const MAX_PENDING_XMIT: usize = 1024;

/// Events produced while [`TelnetCodec::process`]ing input. All methods get
/// the outbound queue so they can enqueue replies directly.
pub trait TelnetEvents {
    /// A two-byte command (IAC x) that is not option negotiation,
    /// e.g. BREAK or DATA_MARK.
    fn command(&mut self, _out: &mut TelnetOut, _cmd: u8) {}

    /// A completed IAC SB … IAC SE suboption; `data[0]` is the option code.
    fn suboption(&mut self, _out: &mut TelnetOut, _data: &[u8]) {}

    /// The peer offered WILL for an option whose table entry has
    /// `notify_will` set. Return true to accept (DO) or false to refuse
    /// (DONT). Acceptance may enqueue initial notifications on `out`.
    fn will_offered(&mut self, _out: &mut TelnetOut, _option: u8) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    /// Plain user data.
    Data,
    /// Just consumed an IAC.
    Command,
    /// Consumed IAC WILL/WONT/DO/DONT, waiting for the option byte.
    Negotiate(u8),
    /// Inside IAC SB, accumulating the suboption.
    Sub,
    /// Inside a suboption, just consumed an IAC.
    SubIac,
}

/// Queue of outbound telnet protocol bytes (negotiation replies, suboptions,
/// the initial option sequence). The owner drains it with
/// [`data`](TelnetOut::data)/[`consume`](TelnetOut::consume) whenever its
/// transport can take bytes; queued protocol bytes take precedence over user
/// data so IAC sequences are never split.
#[derive(Debug)]
pub struct TelnetOut {
    buf: BytesMut,
    overflow: bool,
}

impl TelnetOut {
    /// Create the queue, preloaded with `init_seq` (already-framed IAC
    /// commands to open negotiation with).
    pub fn new(init_seq: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(MAX_PENDING_XMIT.min(64));
        buf.extend_from_slice(init_seq);
        TelnetOut {
            buf,
            overflow: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn have_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop the first `n` queued bytes after they have been written out.
    pub fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// True once an enqueue did not fit; the connection should be dropped.
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Queue a three-byte IAC command.
    pub fn send_cmd(&mut self, cmd: u8, option: u8) {
        self.push(&[IAC, cmd, option]);
    }

    /// Frame and queue IAC SB `payload` IAC SE, doubling any IAC bytes
    /// inside the payload.
    pub fn send_option(&mut self, payload: &[u8]) {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.extend_from_slice(&[IAC, SB]);
        for &b in payload {
            framed.push(b);
            if b == IAC {
                framed.push(IAC);
            }
        }
        framed.extend_from_slice(&[IAC, SE]);
        self.push(&framed);
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.buf.len() + bytes.len() > MAX_PENDING_XMIT {
            self.overflow = true;
            return;
        }
        self.buf.extend_from_slice(bytes);
    }
}

/// The stateful parser half of the codec. See the crate docs for the split
/// between this and [`TelnetOut`].
#[derive(Debug)]
pub struct TelnetCodec {
    table: Vec<OptionEntry>,
    state: ParseState,
    sub: Vec<u8>,
    error: bool,
}

impl TelnetCodec {
    pub fn new(table: Vec<OptionEntry>) -> Self {
        TelnetCodec {
            table,
            state: ParseState::Data,
            sub: Vec::new(),
            error: false,
        }
    }

    /// True after a protocol violation (malformed suboption framing).
    pub fn error(&self) -> bool {
        self.error
    }

    /// Consume `buf[..len]` in place, compacting cleaned user bytes to the
    /// front of `buf` and returning how many there are. Completed commands,
    /// suboptions and negotiation requests are handled as they appear.
    pub fn process<H: TelnetEvents>(
        &mut self,
        buf: &mut [u8],
        len: usize,
        out: &mut TelnetOut,
        handler: &mut H,
    ) -> usize {
        let mut kept = 0;
        for i in 0..len {
            let b = buf[i];
            match self.state {
                ParseState::Data => {
                    if b == IAC {
                        self.state = ParseState::Command;
                    } else {
                        buf[kept] = b;
                        kept += 1;
                    }
                }
                ParseState::Command => match b {
                    IAC => {
                        // Doubled IAC, a literal 0xff data byte.
                        buf[kept] = IAC;
                        kept += 1;
                        self.state = ParseState::Data;
                    }
                    SB => {
                        self.sub.clear();
                        self.state = ParseState::Sub;
                    }
                    WILL | WONT | DO | DONT => {
                        self.state = ParseState::Negotiate(b);
                    }
                    cmd => {
                        self.state = ParseState::Data;
                        handler.command(out, cmd);
                    }
                },
                ParseState::Negotiate(cmd) => {
                    self.state = ParseState::Data;
                    self.negotiate(cmd, b, out, handler);
                }
                ParseState::Sub => {
                    if b == IAC {
                        self.state = ParseState::SubIac;
                    } else if self.sub.len() < MAX_SUBOPTION_SIZE {
                        self.sub.push(b);
                    }
                }
                ParseState::SubIac => match b {
                    IAC => {
                        if self.sub.len() < MAX_SUBOPTION_SIZE {
                            self.sub.push(IAC);
                        }
                        self.state = ParseState::Sub;
                    }
                    SE => {
                        self.state = ParseState::Data;
                        self.deliver_suboption(out, handler);
                    }
                    _ => {
                        // IAC inside a suboption must be followed by IAC
                        // or SE.
                        self.error = true;
                        self.state = ParseState::Data;
                    }
                },
            }
        }
        kept
    }

    /// Abandon any partially parsed command sequence, returning true if the
    /// last byte consumed was an IAC with nothing following it yet. Used by
    /// the urgent-data resynchronization path.
    pub fn abort_pending_command(&mut self) -> bool {
        let was_iac = self.state == ParseState::Command;
        self.state = ParseState::Data;
        was_iac
    }

    fn entry_mut(&mut self, option: u8) -> Option<&mut OptionEntry> {
        self.table.iter_mut().find(|e| e.option == option)
    }

    fn negotiate<H: TelnetEvents>(
        &mut self,
        cmd: u8,
        option: u8,
        out: &mut TelnetOut,
        handler: &mut H,
    ) {
        let entry = self.entry_mut(option).copied();
        match cmd {
            WILL => match entry {
                Some(e) if e.sent_do => {
                    // Acknowledgment of a DO/DONT we already sent.
                    self.entry_mut(option).unwrap().sent_do = false;
                }
                Some(e) if e.i_do => {
                    let accept = !e.notify_will || handler.will_offered(out, option);
                    out.send_cmd(if accept { DO } else { DONT }, option);
                }
                _ => out.send_cmd(DONT, option),
            },
            WONT => {
                if let Some(e) = self.entry_mut(option) {
                    if e.sent_do {
                        e.sent_do = false;
                    }
                }
            }
            DO => match entry {
                Some(e) if e.sent_will => {
                    self.entry_mut(option).unwrap().sent_will = false;
                }
                Some(e) if e.i_will => out.send_cmd(WILL, option),
                _ => out.send_cmd(WONT, option),
            },
            DONT => {
                if let Some(e) = self.entry_mut(option) {
                    if e.sent_will {
                        e.sent_will = false;
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    fn deliver_suboption<H: TelnetEvents>(&mut self, out: &mut TelnetOut, handler: &mut H) {
        if self.sub.is_empty() {
            return;
        }
        let option = self.sub[0];
        let deliver = self
            .table
            .iter()
            .any(|e| e.option == option && e.has_suboption);
        if deliver {
            handler.suboption(out, &self.sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option;

    #[derive(Default)]
    struct Recorder {
        commands: Vec<u8>,
        suboptions: Vec<Vec<u8>>,
        will_offers: Vec<u8>,
        accept_will: bool,
    }

    impl TelnetEvents for Recorder {
        fn command(&mut self, _out: &mut TelnetOut, cmd: u8) {
            self.commands.push(cmd);
        }

        fn suboption(&mut self, _out: &mut TelnetOut, data: &[u8]) {
            self.suboptions.push(data.to_vec());
        }

        fn will_offered(&mut self, _out: &mut TelnetOut, option: u8) -> bool {
            self.will_offers.push(option);
            self.accept_will
        }
    }

    fn com_port_table() -> Vec<OptionEntry> {
        vec![
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
        ]
    }

    fn process(
        codec: &mut TelnetCodec,
        out: &mut TelnetOut,
        h: &mut Recorder,
        input: &[u8],
    ) -> Vec<u8> {
        let mut buf = input.to_vec();
        let len = buf.len();
        let n = codec.process(&mut buf, len, out, h);
        buf.truncate(n);
        buf
    }

    #[test]
    fn passes_user_data_through() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        let got = process(&mut codec, &mut out, &mut h, b"hello world");
        assert_eq!(got, b"hello world");
        assert!(!out.have_pending());
    }

    #[test]
    fn undoubles_iac() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        let got = process(&mut codec, &mut out, &mut h, &[b'A', IAC, IAC, b'B']);
        assert_eq!(got, [b'A', 0xff, b'B']);
    }

    #[test]
    fn iac_split_across_reads() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        let got = process(&mut codec, &mut out, &mut h, &[b'A', IAC]);
        assert_eq!(got, [b'A']);
        let got = process(&mut codec, &mut out, &mut h, &[IAC, b'B']);
        assert_eq!(got, [0xff, b'B']);
    }

    #[test]
    fn plain_commands_reach_handler() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(&mut codec, &mut out, &mut h, &[IAC, crate::BREAK]);
        assert_eq!(h.commands, [crate::BREAK]);
    }

    #[test]
    fn unknown_will_is_refused() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(&mut codec, &mut out, &mut h, &[IAC, WILL, 99]);
        assert_eq!(out.data(), [IAC, DONT, 99]);
    }

    #[test]
    fn acknowledged_do_is_consumed_silently() {
        // We open with WILL SUPPRESS_GO_AHEAD; the peer's DO is an ack and
        // must not generate another WILL.
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(
            &mut codec,
            &mut out,
            &mut h,
            &[IAC, DO, option::SUPPRESS_GO_AHEAD],
        );
        assert!(!out.have_pending());
        // A second DO is a fresh request, answered from the i_will bit.
        process(
            &mut codec,
            &mut out,
            &mut h,
            &[IAC, DO, option::SUPPRESS_GO_AHEAD],
        );
        assert_eq!(out.data(), [IAC, WONT, option::SUPPRESS_GO_AHEAD]);
    }

    #[test]
    fn will_handler_gates_acceptance() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder {
            accept_will: false,
            ..Default::default()
        };
        process(&mut codec, &mut out, &mut h, &[IAC, WILL, option::COM_PORT]);
        assert_eq!(h.will_offers, [option::COM_PORT]);
        assert_eq!(out.data(), [IAC, DONT, option::COM_PORT]);

        let mut out = TelnetOut::new(&[]);
        h.accept_will = true;
        process(&mut codec, &mut out, &mut h, &[IAC, WILL, option::COM_PORT]);
        assert_eq!(out.data(), [IAC, DO, option::COM_PORT]);
    }

    #[test]
    fn assembles_suboption_with_escaped_iac() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        let got = process(
            &mut codec,
            &mut out,
            &mut h,
            &[
                b'x', IAC, SB, option::COM_PORT, 1, IAC, IAC, 7, IAC, SE, b'y',
            ],
        );
        assert_eq!(got, b"xy");
        assert_eq!(h.suboptions, [vec![option::COM_PORT, 1, 0xff, 7]]);
    }

    #[test]
    fn suboptions_for_plain_options_are_dropped() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(
            &mut codec,
            &mut out,
            &mut h,
            &[IAC, SB, option::ECHO, 1, 2, IAC, SE],
        );
        assert!(h.suboptions.is_empty());
    }

    #[test]
    fn stray_iac_in_suboption_sets_error() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(
            &mut codec,
            &mut out,
            &mut h,
            &[IAC, SB, option::COM_PORT, IAC, WILL],
        );
        assert!(codec.error());
        assert!(h.suboptions.is_empty());
    }

    #[test]
    fn send_option_frames_and_doubles() {
        let mut out = TelnetOut::new(&[]);
        out.send_option(&[44, 101, 0xff, 3]);
        assert_eq!(out.data(), [IAC, SB, 44, 101, IAC, IAC, 3, IAC, SE]);
        out.consume(4);
        assert_eq!(out.data(), [101, IAC, IAC, 3, IAC, SE]);
    }

    #[test]
    fn abort_pending_command_reports_lone_iac() {
        let mut codec = TelnetCodec::new(com_port_table());
        let mut out = TelnetOut::new(&[]);
        let mut h = Recorder::default();
        process(&mut codec, &mut out, &mut h, &[b'a', IAC]);
        assert!(codec.abort_pending_command());
        assert!(!codec.abort_pending_command());
    }

    #[test]
    fn xmit_overflow_is_flagged() {
        let mut out = TelnetOut::new(&[]);
        let big = vec![0u8; 600];
        out.send_option(&big);
        assert!(!out.overflowed());
        out.send_option(&big);
        assert!(out.overflowed());
    }
}
