//! The two half-duplex pipes of a connected port: device→TCP with
//! character-delay batching, closeon scanning and IAC doubling, and
//! TCP→device with telnet decoding and urgent-data handling. Backpressure
//! is a flip: a short write disarms the opposite side's read and arms the
//! local write-ready callback until the buffer drains.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use telnet::rfc2217::Purge;
use telnet::{DATA_MARK, IAC};

use super::rfc2217::ComPortEvents;
use super::{DevWriteKind, Port, PortInner, TcpWriteKind, XferState};
use crate::device::DeviceIo;
use crate::net::SessionIo;
use crate::Mode;

/// `io::Write` over the device, so `Buffer::write_to` drives it.
struct DevWriter<'a>(&'a mut dyn DeviceIo);

impl io::Write for DevWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum DevBuf {
    TcpToDev,
    DevStr,
}

impl Port {
    fn enable_tcp_read(&self, inner: &PortInner, enable: bool) {
        if let Some(io) = &inner.io {
            self.reactor.set_read_enabled(io.read_fd(), enable);
        }
    }

    fn enable_tcp_write(&self, inner: &PortInner, enable: bool) {
        if let Some(io) = &inner.io {
            self.reactor.set_write_enabled(io.write_fd(), enable);
        }
    }

    /// Data is ready to read on the device.
    pub(crate) fn handle_dev_fd_read(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.dev_to_tcp_state == XferState::Closing {
            return;
        }

        let telnet = inner.cfg.mode == Mode::Telnet;
        let curend = inner.dev_to_tcp.cursize();
        inner.dev_to_tcp.pos = 0;
        let maxsize = inner.dev_to_tcp.maxsize();
        // Leave room for IAC doubling on telnet streams.
        let room = if telnet {
            (maxsize - curend) / 2
        } else {
            maxsize - curend
        };

        let mut send_now = false;
        let read_res = if room == 0 {
            Ok(0)
        } else {
            inner
                .dev
                .read(&mut inner.dev_to_tcp.raw_mut()[curend..curend + room])
        };
        let mut count = match read_res {
            Ok(0) => {
                if curend != 0 {
                    // Flush what we still hold before deciding anything.
                    send_now = true;
                    0
                } else {
                    self.shutdown_port(inner, "closed port");
                    return;
                }
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::error!("dev read error for port {}: {e}", self.name);
                self.shutdown_port(inner, "dev read error");
                return;
            }
        };

        if count > 0 {
            if let Some(mon) = inner.dev_monitor.upgrade() {
                mon.monitor_write(&inner.dev_to_tcp.raw()[curend..curend + count]);
            }
        }

        {
            let s = &mut *inner;
            if let Some(closeon) = &s.cfg.closeon {
                for i in 0..count {
                    if s.dev_to_tcp.raw()[curend + i] == closeon[s.closeon_pos] {
                        s.closeon_pos += 1;
                        if s.closeon_pos >= closeon.len() {
                            s.close_on_output_done = true;
                            // Nothing after the closeon string is delivered.
                            count = i + 1;
                            break;
                        }
                    } else {
                        s.closeon_pos = 0;
                    }
                }
            }
        }

        inner
            .trace
            .trace_read_dir(&inner.dev_to_tcp.raw()[curend..curend + count]);

        if let Some(led) = &inner.cfg.led_rx {
            led.flash();
        }

        inner.dev_bytes_received += count as u64;

        if telnet && count > 0 {
            // Double the IACs in place; the half-size read reserved the
            // room.
            let buf = inner.dev_to_tcp.raw_mut();
            let mut i = curend;
            let mut end = curend + count;
            while i < end {
                if buf[i] == IAC {
                    buf.copy_within(i..end, i + 1);
                    end += 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            count = end - curend;
        }

        inner.dev_to_tcp.commit(count);

        if send_now || inner.dev_to_tcp.cursize() == maxsize || inner.chardelay == 0 {
            if self.handle_tcp_send(inner).is_ok() {
                self.reset_timer(inner);
            }
            return;
        }

        // Batch: wait up to chardelay for more, but never let a byte sit
        // past the send_time captured when the batch started.
        let now = self.reactor.now();
        if inner.send_timer_running {
            self.reactor.stop_timer(self.send_timer);
        } else {
            inner.send_time = Some(now + Duration::from_micros(u64::from(inner.cfg.chardelay_max)));
        }
        let send_time = inner.send_time.unwrap_or(now);
        if send_time < now {
            inner.send_timer_running = false;
            if self.handle_tcp_send(inner).is_ok() {
                self.reset_timer(inner);
            }
            return;
        }
        let mut delay = send_time - now;
        let chardelay = Duration::from_micros(u64::from(inner.chardelay));
        if delay > chardelay {
            delay = chardelay;
        }
        self.reactor.start_timer(self.send_timer, now + delay);
        inner.send_timer_running = true;
    }

    /// Push the device-to-TCP buffer at the socket. On a short write the
    /// device read is disarmed and the TCP write callback armed.
    pub(crate) fn handle_tcp_send(self: &Arc<Self>, inner: &mut PortInner) -> Result<(), ()> {
        let res = {
            let Some(io) = inner.io.as_ref() else {
                return Err(());
            };
            let mut w: &SessionIo = io;
            inner.dev_to_tcp.write_to(&mut w)
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.shutdown_port(inner, "EPIPE");
                Err(())
            }
            Err(e) => {
                log::error!("The tcp write for port {} had error: {e}", self.name);
                self.shutdown_port(inner, "tcp write error");
                Err(())
            }
            Ok(n) => {
                inner.tcp_bytes_sent += n as u64;
                if inner.dev_to_tcp.cursize() != 0 {
                    inner.dev.read_handler_enable(false);
                    self.enable_tcp_write(inner, true);
                    inner.dev_to_tcp_state = XferState::WaitingOutputClear;
                    Ok(())
                } else if inner.close_on_output_done {
                    inner.close_on_output_done = false;
                    self.shutdown_port(inner, "closeon sequence found");
                    Err(())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// TCP write-ready: banner first if one is still going out, then data.
    pub(crate) fn handle_tcp_fd_write_ready(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.io.is_none() || inner.dev_to_tcp_state == XferState::Closing {
            return;
        }
        match inner.tcp_write_kind {
            TcpWriteKind::Banner => {
                if self.tcp_fd_write(inner, true) == Ok(true) {
                    inner.banner = None;
                    inner.tcp_write_kind = TcpWriteKind::Data;
                }
            }
            TcpWriteKind::Data => {
                let _ = self.tcp_fd_write(inner, false);
            }
        }
    }

    /// Shared TCP write path. Pending telnet command bytes always drain
    /// before user data so IAC sequences are never split. Returns whether
    /// the selected buffer fully drained.
    fn tcp_fd_write(self: &Arc<Self>, inner: &mut PortInner, banner: bool) -> Result<bool, ()> {
        let sending_tn = inner.tn.as_ref().map_or(false, |tn| tn.sending_tn_data);
        if sending_tn {
            let res = {
                let Some(io) = inner.io.as_ref() else {
                    return Err(());
                };
                let mut w: &SessionIo = io;
                let tn = inner.tn.as_mut().unwrap();
                match w.write(tn.out.data()) {
                    Ok(n) => {
                        tn.out.consume(n);
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = res {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    self.shutdown_port(inner, "EPIPE");
                } else {
                    log::error!("The tcp write for port {} had error: {e}", self.name);
                    self.shutdown_port(inner, "tcp write error");
                }
                return Err(());
            }
            if inner.tn.as_ref().unwrap().out.have_pending() {
                // Still command bytes left; hold the user data back.
                return Ok(false);
            }
        }

        let res = {
            let Some(io) = inner.io.as_ref() else {
                return Err(());
            };
            let mut w: &SessionIo = io;
            let buf = if banner {
                match inner.banner.as_mut() {
                    Some(b) => b,
                    None => return Ok(true),
                }
            } else {
                &mut inner.dev_to_tcp
            };
            buf.write_to(&mut w).map(|n| (n, buf.is_empty()))
        };
        let drained = match res {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.shutdown_port(inner, "EPIPE");
                return Err(());
            }
            Err(e) => {
                log::error!("The tcp write for port {} had error: {e}", self.name);
                self.shutdown_port(inner, "tcp write error");
                return Err(());
            }
            Ok((n, drained)) => {
                inner.tcp_bytes_sent += n as u64;
                drained
            }
        };

        if drained {
            // Queued telnet commands get the line next.
            let tn_pending = inner.tn.as_ref().map_or(false, |tn| tn.out.have_pending());
            if tn_pending {
                inner.tn.as_mut().unwrap().sending_tn_data = true;
                self.reset_timer(inner);
                return Ok(drained);
            }

            inner.dev.read_handler_enable(true);
            self.enable_tcp_write(inner, false);
            inner.dev_to_tcp_state = XferState::WaitingInput;

            if inner.close_on_output_done {
                inner.close_on_output_done = false;
                self.shutdown_port(inner, "closeon sequence found");
                return Err(());
            }
        }

        self.reset_timer(inner);
        Ok(drained)
    }

    /// Data is ready to read on the TCP side.
    pub(crate) fn handle_tcp_fd_read(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.io.is_none() || inner.dev_to_tcp_state == XferState::Closing {
            return;
        }

        inner.tcp_to_dev.reset();
        let maxsize = inner.tcp_to_dev.maxsize();
        let read_res = {
            let io = inner.io.as_ref().unwrap();
            let mut r: &SessionIo = io;
            r.read(&mut inner.tcp_to_dev.raw_mut()[..maxsize])
        };
        let count = match read_res {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::error!("read error for port {}: {e}", self.name);
                self.shutdown_port(inner, "tcp read error");
                return;
            }
            Ok(0) => {
                self.shutdown_port(inner, "tcp read close");
                return;
            }
            Ok(n) => n,
        };
        inner.tcp_to_dev.commit(count);
        inner.tcp_bytes_received += count as u64;

        if inner.cfg.mode == Mode::Telnet {
            let failed = {
                let s = &mut *inner;
                let tn = s.tn.as_mut().unwrap();
                let mut events = ComPortEvents {
                    dev: &mut *s.dev,
                    cfg: &s.cfg,
                    params: &mut s.params,
                    chardelay: &mut s.chardelay,
                    is_2217: &mut s.is_2217,
                    linestate_mask: &mut s.linestate_mask,
                    modemstate_mask: &mut s.modemstate_mask,
                    last_modemstate: &mut s.last_modemstate,
                };
                let kept =
                    tn.codec
                        .process(s.tcp_to_dev.raw_mut(), count, &mut tn.out, &mut events);
                s.tcp_to_dev.truncate(kept);
                tn.codec.error() || tn.out.overflowed()
            };
            if failed {
                self.shutdown_port(inner, "telnet output error");
                return;
            }
            // Negotiation replies queued by the handler want the wire.
            self.telnet_output_push(inner);
            if inner.tcp_to_dev.cursize() == 0 {
                // All protocol bytes; nothing to relay.
                return;
            }
        }

        if let Some(mon) = inner.tcp_monitor.upgrade() {
            mon.monitor_write(inner.tcp_to_dev.pending());
        }

        inner.trace.trace_write_dir(inner.tcp_to_dev.pending());

        let res = {
            let s = &mut *inner;
            s.tcp_to_dev.write_to(&mut DevWriter(&mut *s.dev))
        };
        match res {
            Err(e) => {
                log::error!("The dev write for port {} had error: {e}", self.name);
                self.shutdown_port(inner, "dev write error");
                return;
            }
            Ok(n) => {
                if let Some(led) = &inner.cfg.led_tx {
                    led.flash();
                }
                inner.dev_bytes_sent += n as u64;
                if inner.tcp_to_dev.cursize() != 0 {
                    self.enable_tcp_read(inner, false);
                    inner.dev.write_handler_enable(true);
                    inner.tcp_to_dev_state = XferState::WaitingOutputClear;
                }
            }
        }

        self.reset_timer(inner);
    }

    /// The device can take more data.
    pub(crate) fn handle_dev_fd_write(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.dev_write_kind {
            DevWriteKind::Data => {
                let _ = self.dev_fd_write(inner, DevBuf::TcpToDev);
            }
            DevWriteKind::OpenStr => {
                if self.dev_fd_write(inner, DevBuf::DevStr).is_ok()
                    && inner.devstr.as_ref().map_or(true, |b| b.is_empty())
                {
                    inner.dev_write_kind = DevWriteKind::Data;
                    inner.devstr = None;
                }
            }
            DevWriteKind::CloseStr => self.handle_dev_fd_close_write(inner),
        }
    }

    fn dev_fd_write(self: &Arc<Self>, inner: &mut PortInner, which: DevBuf) -> Result<(), ()> {
        let res = {
            let s = &mut *inner;
            let buf = match which {
                DevBuf::TcpToDev => &mut s.tcp_to_dev,
                DevBuf::DevStr => match s.devstr.as_mut() {
                    Some(b) => b,
                    None => return Ok(()),
                },
            };
            buf.write_to(&mut DevWriter(&mut *s.dev))
                .map(|n| (n, buf.is_empty()))
        };
        match res {
            Err(e) => {
                log::error!("The dev write for port {} had error: {e}", self.name);
                self.shutdown_port(inner, "dev write error");
                Err(())
            }
            Ok((n, drained)) => {
                inner.dev_bytes_sent += n as u64;
                if drained {
                    self.enable_tcp_read(inner, true);
                    inner.dev.write_handler_enable(false);
                    inner.tcp_to_dev_state = XferState::WaitingInput;
                }
                self.reset_timer(inner);
                Ok(())
            }
        }
    }

    /// Drain the close string during shutdown, then finish the teardown.
    fn handle_dev_fd_close_write(self: &Arc<Self>, inner: &mut PortInner) {
        let res = {
            let s = &mut *inner;
            match s.devstr.as_mut() {
                Some(buf) => buf.write_to(&mut DevWriter(&mut *s.dev)).map(|_| buf.is_empty()),
                None => Ok(true),
            }
        };
        let done = match res {
            Err(e) => {
                log::error!("The dev write for port {} had error: {e}", self.name);
                true
            }
            Ok(drained) => drained,
        };
        if done {
            let port = self.clone();
            self.reactor
                .defer(Box::new(move || port.finish_shutdown_port()));
        }
    }

    /// Queued telnet output wants the wire; arm the write side unless
    /// in-flight user data (which may contain split IACs) must finish
    /// first.
    pub(crate) fn telnet_output_push(&self, inner: &mut PortInner) {
        if inner.dev_to_tcp.cursize() != 0 {
            return;
        }
        if inner.banner.as_ref().map_or(false, |b| !b.is_empty()) {
            return;
        }
        {
            let Some(tn) = inner.tn.as_mut() else {
                return;
            };
            if !tn.out.have_pending() {
                return;
            }
            tn.sending_tn_data = true;
        }
        inner.dev.read_handler_enable(false);
        self.enable_tcp_write(inner, true);
    }

    /// TCP urgent data: a telnet synch. Flush both queues and discard the
    /// stream up to the DATA_MARK.
    pub(crate) fn handle_tcp_fd_except(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(io) = inner.io.as_ref() else {
            return;
        };
        io.drain_oob();

        if inner.cfg.mode != Mode::Telnet {
            return;
        }

        inner.tcp_to_dev.reset();
        inner.dev.flush(Purge::Both);

        let mut cmd_pos = inner
            .tn
            .as_mut()
            .map_or(false, |tn| tn.codec.abort_pending_command());

        let mut byte = [0u8; 1];
        loop {
            let got = {
                let io = inner.io.as_ref().unwrap();
                let mut r: &SessionIo = io;
                match r.read(&mut byte) {
                    Ok(1) => true,
                    _ => false,
                }
            };
            if !got {
                break;
            }
            if cmd_pos {
                if byte[0] == DATA_MARK {
                    if inner.cfg.telnet_brk_on_sync {
                        inner.dev.send_break();
                    }
                    break;
                }
                cmd_pos = false;
            } else if byte[0] == IAC {
                cmd_pos = true;
            }
        }
    }
}
