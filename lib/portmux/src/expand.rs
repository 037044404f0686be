//! Backslash-escape template expansion for banners, open/close strings and
//! trace-file names. Expansion is two-pass: a counting pass sizes the
//! output exactly, then a writing pass fills a single allocation.

use std::net::IpAddr;

use chrono::{DateTime, Datelike, Local, Timelike};

static MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
static DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// The values escapes expand against.
#[derive(Clone, Debug)]
pub struct ExpandCtx<'a> {
    pub devname: &'a str,
    pub portname: &'a str,
    /// Compact serial-parameter string ("9600N81").
    pub serparms: &'a str,
    pub peer: Option<IpAddr>,
    pub when: DateTime<Local>,
    /// Expanding a trace filename: `\d` becomes the device basename and
    /// `\s` means seconds rather than serial parameters.
    pub filename: bool,
}

impl<'a> ExpandCtx<'a> {
    pub fn new(devname: &'a str, portname: &'a str, serparms: &'a str) -> Self {
        ExpandCtx {
            devname,
            portname,
            serparms,
            peer: None,
            when: Local::now(),
            filename: false,
        }
    }
}

/// Expand `template`, returning the bytes to send or the filename to open.
/// Unknown escapes pass through as the escaped character.
pub fn expand(template: &str, ctx: &ExpandCtx) -> Vec<u8> {
    let mut len = 0usize;
    run(template, ctx, &mut |_| len += 1);
    let mut out = Vec::with_capacity(len);
    run(template, ctx, &mut |b| out.push(b));
    debug_assert_eq!(out.len(), len);
    out
}

/// Translate only the static C-style escapes (`\n`, `\NNN`, `\xNN`, …),
/// used for strings fixed at configuration time such as closeon patterns.
pub fn unescape(template: &str) -> Vec<u8> {
    let ctx = ExpandCtx::new("", "", "");
    expand(template, &ctx)
}

fn run(template: &str, ctx: &ExpandCtx, emit: &mut dyn FnMut(u8)) {
    let mut emit_str = |s: &str, emit: &mut dyn FnMut(u8)| {
        for b in s.bytes() {
            emit(b)
        }
    };
    let t = ctx.when;
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            emit(b);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&esc) = bytes.get(i) else { return };
        i += 1;
        match esc {
            b'a' => emit(7),
            b'b' => emit(8),
            b'f' => emit(12),
            b'n' => emit(10),
            b'r' => emit(13),
            b't' => emit(9),
            b'v' => emit(11),
            b'\\' => emit(b'\\'),
            b'?' => emit(b'?'),
            b'\'' => emit(b'\''),
            b'"' => emit(b'"'),
            b'0'..=b'7' => {
                // 1-3 octal digits
                let mut val = u32::from(esc - b'0');
                for _ in 0..2 {
                    match bytes.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            val = val * 8 + u32::from(d - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                emit(val as u8);
            }
            b'x' => {
                // 1-2 hex digits
                let mut val = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match bytes.get(i).and_then(|&d| (d as char).to_digit(16)) {
                        Some(d) => {
                            val = val * 16 + d;
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    continue;
                }
                emit(val as u8);
            }
            b'd' => {
                let dev = if ctx.filename {
                    // No '/' in a filename.
                    ctx.devname.rsplit('/').next().unwrap_or(ctx.devname)
                } else {
                    ctx.devname
                };
                emit_str(dev, emit);
            }
            b'p' => emit_str(ctx.portname, emit),
            b's' => {
                if ctx.filename {
                    emit_str(&format!("{:02}", t.second()), emit);
                } else {
                    emit_str(ctx.serparms, emit);
                }
            }
            b'B' => emit_str(ctx.serparms, emit),
            b'Y' => emit_str(&t.year().to_string(), emit),
            b'y' => emit_str(&t.ordinal0().to_string(), emit),
            b'M' => emit_str(MONTHS[t.month0() as usize], emit),
            b'm' => emit_str(&t.month0().to_string(), emit),
            b'A' => emit_str(DAYS[t.weekday().num_days_from_sunday() as usize], emit),
            b'D' => emit_str(&t.day().to_string(), emit),
            b'H' => emit_str(&format!("{:02}", t.hour()), emit),
            b'h' => emit_str(&format!("{:02}", t.hour12().1), emit),
            b'i' => emit_str(&format!("{:02}", t.minute()), emit),
            b'S' => emit_str(&format!("{:02}", t.second()), emit),
            b'q' => emit_str(if t.hour() < 12 { "am" } else { "pm" }, emit),
            b'P' => emit_str(if t.hour() < 12 { "AM" } else { "PM" }, emit),
            b'T' => emit_str(
                &format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second()),
                emit,
            ),
            b'e' => emit_str(&t.timestamp().to_string(), emit),
            b'U' => emit_str(&format!("{:06}", t.timestamp_subsec_micros()), emit),
            b'I' => {
                if let Some(peer) = ctx.peer {
                    emit_str(&peer.to_string(), emit);
                }
            }
            other => emit(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx<'a>() -> ExpandCtx<'a> {
        let mut ctx = ExpandCtx::new("/dev/ttyS4", "3001", "9600N81");
        ctx.when = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        ctx.peer = Some("10.1.2.3".parse().unwrap());
        ctx
    }

    #[test]
    fn c_escapes() {
        assert_eq!(expand("a\\r\\nb", &ctx()), b"a\r\nb");
        assert_eq!(expand("\\t\\\\\\\"", &ctx()), b"\t\\\"");
    }

    #[test]
    fn octal_and_hex() {
        assert_eq!(expand("\\101", &ctx()), b"A");
        assert_eq!(expand("\\7!", &ctx()), &[7, b'!'][..]);
        assert_eq!(expand("\\x41\\x7g", &ctx()), &[0x41, 0x7, b'g'][..]);
    }

    #[test]
    fn device_and_port() {
        assert_eq!(expand("dev \\d port \\p", &ctx()), b"dev /dev/ttyS4 port 3001");
        let mut c = ctx();
        c.filename = true;
        assert_eq!(expand("\\d", &c), b"ttyS4");
    }

    #[test]
    fn serparms_and_seconds() {
        assert_eq!(expand("\\s \\B", &ctx()), b"9600N81 9600N81");
        let mut c = ctx();
        c.filename = true;
        assert_eq!(expand("\\s \\B", &c), b"09 9600N81");
    }

    #[test]
    fn time_fields() {
        let c = ctx();
        assert_eq!(expand("\\Y-\\D \\T \\q", &c), b"2024-5 14:07:09 pm");
        // Month numbers count from zero, month names do not.
        assert_eq!(expand("\\M=\\m", &c), b"Mar=2");
        assert_eq!(expand("\\h\\P", &c), b"02PM");
    }

    #[test]
    fn peer_ip() {
        assert_eq!(expand("from \\I", &ctx()), b"from 10.1.2.3");
        let mut c = ctx();
        c.peer = None;
        assert_eq!(expand("from \\I", &c), b"from ");
    }

    #[test]
    fn unknown_escape_passes_through() {
        assert_eq!(expand("\\z\\!", &ctx()), b"z!");
    }

    #[test]
    fn trailing_backslash_truncates() {
        assert_eq!(expand("ab\\", &ctx()), b"ab");
    }
}
