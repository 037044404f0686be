//! Per-session trace files: up to three sinks (read direction, write
//! direction, both), with sinks sharing one open file when their filename
//! templates collide so data lands exactly once. Output is raw bytes or a
//! timestamped hex dump. A failed write closes that sink and the session
//! keeps running.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;

use chrono::Local;

use crate::expand::{expand, ExpandCtx};

const PREFIX_DEV: &str = "term";
const PREFIX_NET: &str = "tcp ";

/// Configuration of one trace sink, before expansion/open.
#[derive(Clone, Debug, Default)]
pub struct TraceSpec {
    pub hexdump: bool,
    pub timestamp: bool,
    /// Filename template; `None` disables the sink.
    pub filename: Option<String>,
}

#[derive(Debug)]
struct OpenSink {
    hexdump: bool,
    timestamp: bool,
    file: Option<File>,
}

/// The open sinks of one session plus the read/write/both aliases into
/// them. When two specs name the same template they share an entry, taking
/// the flags of whichever opened first.
#[derive(Debug, Default)]
pub struct TraceSet {
    sinks: Vec<OpenSink>,
    tr: Option<usize>,
    tw: Option<usize>,
    tb: Option<usize>,
    portname: String,
}

impl TraceSet {
    /// Expand filenames against `ctx` (one timestamp for all three, so
    /// colliding templates expand identically) and open what is configured.
    /// An open failure is logged and that sink stays disabled.
    pub fn setup(
        portname: &str,
        read: &TraceSpec,
        write: &TraceSpec,
        both: &TraceSpec,
        ctx: &ExpandCtx,
    ) -> TraceSet {
        let mut set = TraceSet {
            portname: portname.to_string(),
            ..Default::default()
        };

        let mut fctx = ctx.clone();
        fctx.filename = true;

        set.tw = write
            .filename
            .as_deref()
            .map(|t| set.open_sink(write, t, &fctx));
        set.tr = read.filename.as_deref().map(|t| {
            match write.filename.as_deref() {
                Some(wt) if wt == t => set.tw.unwrap(),
                _ => set.open_sink(read, t, &fctx),
            }
        });
        set.tb = both.filename.as_deref().map(|t| {
            match (write.filename.as_deref(), read.filename.as_deref()) {
                (Some(wt), _) if wt == t => set.tw.unwrap(),
                (_, Some(rt)) if rt == t => set.tr.unwrap(),
                _ => set.open_sink(both, t, &fctx),
            }
        });
        set
    }

    fn open_sink(&mut self, spec: &TraceSpec, template: &str, fctx: &ExpandCtx) -> usize {
        let name = String::from_utf8_lossy(&expand(template, fctx)).into_owned();
        let file = match OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&name)
        {
            Ok(f) => Some(f),
            Err(e) => {
                log::error!("Unable to open trace file {name}: {e}");
                None
            }
        };
        self.sinks.push(OpenSink {
            hexdump: spec.hexdump,
            timestamp: spec.timestamp,
            file,
        });
        self.sinks.len() - 1
    }

    /// Device-to-TCP data (prefix "term"): read sink plus the both sink
    /// when it is a distinct file.
    pub fn trace_read_dir(&mut self, data: &[u8]) {
        self.trace_dir(self.tr, self.tb, PREFIX_DEV, data);
    }

    /// TCP-to-device data (prefix "tcp ").
    pub fn trace_write_dir(&mut self, data: &[u8]) {
        self.trace_dir(self.tw, self.tb, PREFIX_NET, data);
    }

    fn trace_dir(&mut self, main: Option<usize>, both: Option<usize>, prefix: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(i) = main {
            self.write_sink(i, prefix, data);
        }
        if let Some(i) = both {
            if main != Some(i) {
                self.write_sink(i, prefix, data);
            }
        }
    }

    /// Session-open line, only to sinks that carry timestamps.
    pub fn header(&mut self, peer: Option<SocketAddr>) {
        let peer = peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "0.0.0.0:0".to_string());
        self.stamp_line(&format!("OPEN ({peer})\n"));
    }

    /// Session-close line with the shutdown reason.
    pub fn footer(&mut self, reason: &str) {
        self.stamp_line(&format!("CLOSE ({reason})\n"));
    }

    fn stamp_line(&mut self, line: &str) {
        let out = format!("{}{}", timestamp(), line);
        let mut written: Vec<usize> = Vec::with_capacity(3);
        for idx in [self.tr, self.tw, self.tb].into_iter().flatten() {
            if written.contains(&idx) {
                continue;
            }
            written.push(idx);
            if self.sinks[idx].timestamp {
                self.write_raw(idx, out.as_bytes());
            }
        }
    }

    /// Close all sinks (drops the files).
    pub fn close(&mut self) {
        self.sinks.clear();
        self.tr = None;
        self.tw = None;
        self.tb = None;
    }

    fn write_sink(&mut self, idx: usize, prefix: &str, data: &[u8]) {
        if self.sinks[idx].file.is_none() {
            return;
        }
        if !self.sinks[idx].hexdump {
            self.write_raw(idx, data);
            return;
        }
        let with_ts = self.sinks[idx].timestamp;
        for row in data.chunks(8) {
            let mut line = String::with_capacity(64);
            if with_ts {
                line.push_str(&timestamp());
            }
            line.push_str(prefix);
            line.push(' ');
            for b in row {
                line.push_str(&format!("{b:02x} "));
            }
            for _ in row.len()..8 {
                line.push_str("   ");
            }
            line.push_str(" |");
            for &b in row {
                line.push(if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                });
            }
            line.push_str("|\n");
            if !self.write_raw(idx, line.as_bytes()) {
                return;
            }
        }
    }

    fn write_raw(&mut self, idx: usize, data: &[u8]) -> bool {
        let sink = &mut self.sinks[idx];
        let Some(file) = sink.file.as_mut() else {
            return false;
        };
        match file.write_all(data) {
            Ok(()) => true,
            Err(e) => {
                // Fatal for the sink, not for the port.
                log::error!(
                    "Unable to write to trace file on port {}: {e}",
                    self.portname
                );
                sink.file = None;
                false
            }
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%Y/%m/%d %H:%M:%S ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::ExpandCtx;

    fn spec(hexdump: bool, timestamp: bool, filename: Option<&str>) -> TraceSpec {
        TraceSpec {
            hexdump,
            timestamp,
            filename: filename.map(String::from),
        }
    }

    #[test]
    fn raw_sink_gets_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tr");
        let ctx = ExpandCtx::new("/dev/null", "p", "");
        let mut set = TraceSet::setup(
            "p",
            &spec(false, false, path.to_str()),
            &spec(false, false, None),
            &spec(false, false, None),
            &ctx,
        );
        set.trace_read_dir(b"abc\xff");
        set.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc\xff");
    }

    #[test]
    fn colliding_templates_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all");
        let ctx = ExpandCtx::new("/dev/null", "p", "");
        let s = spec(false, false, path.to_str());
        let mut set = TraceSet::setup("p", &s, &s, &s, &ctx);
        // Read-direction data must land exactly once even though both the
        // read sink and the both sink refer to the file.
        set.trace_read_dir(b"once");
        set.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"once");
    }

    #[test]
    fn hexdump_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hex");
        let ctx = ExpandCtx::new("/dev/null", "p", "");
        let mut set = TraceSet::setup(
            "p",
            &spec(true, false, path.to_str()),
            &spec(false, false, None),
            &spec(false, false, None),
            &ctx,
        );
        set.trace_read_dir(b"hello\x01world");
        set.close();
        let text = String::from_utf8(std::fs::read(&path).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "term 68 65 6c 6c 6f 01 77 6f  |hello.wo|"
        );
        assert_eq!(
            lines.next().unwrap(),
            "term 72 6c 64                 |rld|"
        );
    }

    #[test]
    fn header_footer_only_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let with_ts = dir.path().join("ts");
        let without = dir.path().join("plain");
        let ctx = ExpandCtx::new("/dev/null", "p", "");
        let mut set = TraceSet::setup(
            "p",
            &spec(false, true, with_ts.to_str()),
            &spec(false, false, without.to_str()),
            &spec(false, false, None),
            &ctx,
        );
        set.header(Some("1.2.3.4:99".parse().unwrap()));
        set.footer("done");
        set.close();
        let ts_text = String::from_utf8(std::fs::read(&with_ts).unwrap()).unwrap();
        assert!(ts_text.contains("OPEN (1.2.3.4:99)"));
        assert!(ts_text.contains("CLOSE (done)"));
        assert_eq!(std::fs::read(&without).unwrap(), b"");
    }

    #[test]
    fn filename_templates_expand() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/\\p-\\d.log", dir.path().display());
        let ctx = ExpandCtx::new("/dev/ttyFoo", "2000", "");
        let mut set = TraceSet::setup(
            "2000",
            &spec(false, false, Some(&template)),
            &spec(false, false, None),
            &spec(false, false, None),
            &ctx,
        );
        set.trace_read_dir(b"x");
        set.close();
        assert!(dir.path().join("2000-ttyFoo.log").exists());
    }
}
