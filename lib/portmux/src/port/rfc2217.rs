//! RFC 2217 com-port-option handling: the telnet event hooks a connected
//! port wires into its codec. Set operations apply to the device and are
//! echoed back with the accepted values; baud/size/parity changes refresh
//! the character-delay pacing.

use telnet::rfc2217::{cmd, BaudRequest, ModemState, Purge, SERVER_OFFSET};
use telnet::{option, TelnetEvents, TelnetOut, BREAK, DATA_MARK};

use super::recalc_chardelay;
use crate::config::PortConfig;
use crate::device::{DeviceIo, SerialParams};

/// Sent in answer to SIGNATURE when no per-port signature is configured.
const DEFAULT_SIGNATURE: &str = "portmuxd";

/// Longest signature we will echo; bounded by the suboption transmit
/// framing (option + command bytes included).
const MAX_SIGNATURE: usize = telnet::MAX_SUBOPTION_SIZE - 2;

/// Split borrows of the port state the com-port option touches, wired into
/// [`telnet::TelnetCodec::process`] for the duration of one input batch.
pub(crate) struct ComPortEvents<'a> {
    pub dev: &'a mut dyn DeviceIo,
    pub cfg: &'a PortConfig,
    pub params: &'a mut SerialParams,
    pub chardelay: &'a mut u32,
    pub is_2217: &'a mut bool,
    pub linestate_mask: &'a mut u8,
    pub modemstate_mask: &'a mut ModemState,
    pub last_modemstate: &'a mut ModemState,
}

impl ComPortEvents<'_> {
    fn reply(&self, out: &mut TelnetOut, command: u8, rest: &[u8]) {
        let mut payload = Vec::with_capacity(2 + rest.len());
        payload.push(option::COM_PORT);
        payload.push(command + SERVER_OFFSET);
        payload.extend_from_slice(rest);
        out.send_option(&payload);
    }

    fn recalc(&mut self) {
        *self.chardelay = recalc_chardelay(self.cfg, *self.params);
    }
}

impl TelnetEvents for ComPortEvents<'_> {
    fn command(&mut self, _out: &mut TelnetOut, command: u8) {
        if command == BREAK || (self.cfg.telnet_brk_on_sync && command == DATA_MARK) {
            self.dev.send_break();
        }
    }

    fn will_offered(&mut self, out: &mut TelnetOut, opt: u8) -> bool {
        if opt != option::COM_PORT {
            return true;
        }
        if !self.cfg.allow_2217 {
            return false;
        }

        // The remote end turned on RFC 2217 handling.
        *self.is_2217 = true;
        *self.linestate_mask = 0;
        *self.modemstate_mask = ModemState::all();
        *self.last_modemstate = ModemState::empty();

        let mut state = 0;
        if let Some(ms) = self.dev.get_modem_state() {
            *self.last_modemstate = ms;
            state = ms.bits();
        }
        self.reply(out, cmd::NOTIFY_MODEMSTATE, &[state]);
        true
    }

    fn suboption(&mut self, out: &mut TelnetOut, data: &[u8]) {
        if data.len() < 2 || data[0] != option::COM_PORT {
            return;
        }
        match data[1] {
            cmd::SIGNATURE => {
                let sig = self.cfg.signature.as_deref().unwrap_or(DEFAULT_SIGNATURE);
                let sig = &sig.as_bytes()[..sig.len().min(MAX_SIGNATURE)];
                self.reply(out, cmd::SIGNATURE, sig);
            }
            cmd::SET_BAUDRATE => {
                let Some(req) = BaudRequest::decode(&data[2..]) else {
                    return;
                };
                let (reply, bps) = self.dev.baud_rate(req);
                self.params.bps = bps;
                self.recalc();
                let mut rest = Vec::new();
                req.encode_reply(reply, &mut rest);
                self.reply(out, cmd::SET_BAUDRATE, &rest);
            }
            cmd::SET_DATASIZE => {
                let Some(&v) = data.get(2) else { return };
                let (accepted, bpc) = self.dev.data_size(v);
                self.params.bpc = bpc;
                self.recalc();
                self.reply(out, cmd::SET_DATASIZE, &[accepted]);
            }
            cmd::SET_PARITY => {
                let Some(&v) = data.get(2) else { return };
                let (accepted, bpc) = self.dev.parity(v);
                self.params.bpc = bpc;
                self.recalc();
                self.reply(out, cmd::SET_PARITY, &[accepted]);
            }
            cmd::SET_STOPSIZE => {
                let Some(&v) = data.get(2) else { return };
                let (accepted, bpc) = self.dev.stop_size(v);
                self.params.bpc = bpc;
                self.recalc();
                self.reply(out, cmd::SET_STOPSIZE, &[accepted]);
            }
            cmd::SET_CONTROL => {
                let Some(&v) = data.get(2) else { return };
                let accepted = self.dev.control(v);
                self.reply(out, cmd::SET_CONTROL, &[accepted]);
            }
            cmd::FLOWCONTROL_SUSPEND => {
                self.dev.flow_control(true);
                self.reply(out, cmd::FLOWCONTROL_SUSPEND, &[]);
            }
            cmd::FLOWCONTROL_RESUME => {
                self.dev.flow_control(false);
                self.reply(out, cmd::FLOWCONTROL_RESUME, &[]);
            }
            cmd::SET_LINESTATE_MASK => {
                let Some(&v) = data.get(2) else { return };
                *self.linestate_mask = v;
                self.reply(out, cmd::SET_LINESTATE_MASK, &[v]);
            }
            cmd::SET_MODEMSTATE_MASK => {
                let Some(&v) = data.get(2) else { return };
                *self.modemstate_mask = ModemState::from_bits_retain(v);
                self.reply(out, cmd::SET_MODEMSTATE_MASK, &[v]);
            }
            cmd::PURGE_DATA => {
                let Some(&v) = data.get(2) else { return };
                if let Some(purge) = Purge::from_wire(v) {
                    self.dev.flush(purge);
                }
                self.reply(out, cmd::PURGE_DATA, &[v]);
            }
            // NOTIFY_LINESTATE / NOTIFY_MODEMSTATE are server-to-client.
            _ => {}
        }
    }
}
