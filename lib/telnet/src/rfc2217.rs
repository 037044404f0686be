//! RFC 2217 com-port-option constants and the numeric encodings used in its
//! subnegotiations. The option rides on telnet option 44; every client
//! command `n` is answered with `n + 100` from the server side.

/// Client→server subnegotiation command codes. Server replies add
/// [`SERVER_OFFSET`].
pub mod cmd {
    pub const SIGNATURE: u8 = 0;
    pub const SET_BAUDRATE: u8 = 1;
    pub const SET_DATASIZE: u8 = 2;
    pub const SET_PARITY: u8 = 3;
    pub const SET_STOPSIZE: u8 = 4;
    pub const SET_CONTROL: u8 = 5;
    pub const NOTIFY_LINESTATE: u8 = 6;
    pub const NOTIFY_MODEMSTATE: u8 = 7;
    pub const FLOWCONTROL_SUSPEND: u8 = 8;
    pub const FLOWCONTROL_RESUME: u8 = 9;
    pub const SET_LINESTATE_MASK: u8 = 10;
    pub const SET_MODEMSTATE_MASK: u8 = 11;
    pub const PURGE_DATA: u8 = 12;
}

pub const SERVER_OFFSET: u8 = 100;

bitflags::bitflags! {
    /// Modem-state bits as carried in NOTIFY-MODEMSTATE (107).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ModemState: u8 {
        const CD = 0x80;
        const RI = 0x40;
        const DSR = 0x20;
        const CTS = 0x10;
        const CD_CHANGED = 0x08;
        const RI_TRAILING_EDGE = 0x04;
        const DSR_CHANGED = 0x02;
        const CTS_CHANGED = 0x01;
    }
}

/// PURGE-DATA argument values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purge {
    Receive,
    Transmit,
    Both,
}

impl Purge {
    pub fn from_wire(val: u8) -> Option<Self> {
        match val {
            1 => Some(Purge::Receive),
            2 => Some(Purge::Transmit),
            3 => Some(Purge::Both),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Purge::Receive => 1,
            Purge::Transmit => 2,
            Purge::Both => 3,
        }
    }
}

/// A SET-BAUDRATE request. The RFC framing carries a big-endian u32; the
/// older Cisco IOS framing carries a single-byte rate index. Replies must
/// use the same framing the request used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaudRequest {
    Cisco(u8),
    Rfc(u32),
}

impl BaudRequest {
    /// Decode the payload that followed `[44, SET_BAUDRATE]`. Multi-byte
    /// values are assembled byte-by-byte since the wire data has no
    /// alignment.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload.len() {
            1 => Some(BaudRequest::Cisco(payload[0])),
            n if n >= 4 => {
                let val = (u32::from(payload[0]) << 24)
                    | (u32::from(payload[1]) << 16)
                    | (u32::from(payload[2]) << 8)
                    | u32::from(payload[3]);
                Some(BaudRequest::Rfc(val))
            }
            _ => None,
        }
    }

    /// Encode a reply value in the same framing as the request, appending
    /// to a suboption payload.
    pub fn encode_reply(self, reply: u32, payload: &mut Vec<u8>) {
        match self {
            BaudRequest::Cisco(_) => payload.push(reply as u8),
            BaudRequest::Rfc(_) => {
                payload.push((reply >> 24) as u8);
                payload.push((reply >> 16) as u8);
                payload.push((reply >> 8) as u8);
                payload.push(reply as u8);
            }
        }
    }
}
