//! Per-port configuration: every knob a port carries at runtime, the
//! keyword grammar shared by the configuration file and the control plane's
//! `setportconfig`, and the defaults block. File-format parsing lives in
//! the daemon; this module owns the semantics.

use std::fmt;
use std::sync::Arc;

use crate::device::Led;
use crate::trace::TraceSpec;
use crate::Mode;

/// RS-485 driver-enable configuration, applied at device setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rs485Config {
    pub delay_rts_before_send: u32,
    pub delay_rts_after_send: u32,
    pub rts_on_send: bool,
    pub rts_after_send: bool,
    pub rx_during_tx: bool,
}

/// Named things a port keyword can reference: banner/open/close/closeon/
/// signature strings, trace file templates, LEDs and RS-485 blocks defined
/// elsewhere in the configuration. The daemon implements this over its
/// config tables.
pub trait ConfigResolver: Send + Sync {
    fn find_string(&self, name: &str) -> Option<NamedString>;
    fn find_tracefile(&self, name: &str) -> Option<String>;
    fn find_led(&self, name: &str) -> Option<Arc<dyn Led>>;
    fn find_rs485(&self, name: &str) -> Option<Rs485Config>;
}

/// A named string plus what kind of string it was declared as.
#[derive(Clone, Debug)]
pub enum NamedString {
    Banner(String),
    Signature(String),
    OpenStr(String),
    CloseStr(String),
    /// Closeon strings are matched as bytes; static escapes are translated
    /// when the string is declared.
    Closeon(Vec<u8>),
    Devname(String),
}

/// Defaults applied to every port before its own keywords run.
#[derive(Clone, Debug)]
pub struct PortDefaults {
    pub remctl: bool,
    pub kickolduser: bool,
    pub telnet_brk_on_sync: bool,
    pub chardelay: bool,
    pub chardelay_scale: u32,
    pub chardelay_min: u32,
    pub chardelay_max: u32,
    pub dev_to_tcp_bufsize: usize,
    pub tcp_to_dev_bufsize: usize,
}

impl Default for PortDefaults {
    fn default() -> Self {
        PortDefaults {
            remctl: false,
            kickolduser: false,
            telnet_brk_on_sync: false,
            chardelay: true,
            chardelay_scale: 2,
            chardelay_min: 1000,
            chardelay_max: 20000,
            dev_to_tcp_bufsize: 64,
            tcp_to_dev_bufsize: 64,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        ConfigError(msg.into())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Everything that describes one configured port. Built by the daemon's
/// config layer (or a test), consumed by [`crate::registry::Registry::add_port`].
#[derive(Clone)]
pub struct PortConfig {
    /// The TCP listen spec; `"0"` (or any all-zero string) means the
    /// process's stdin/stdout carry the single session.
    pub name: String,
    pub devname: String,
    pub mode: Mode,
    /// Seconds without I/O before the session is shut down; 0 disables.
    pub timeout: u32,
    pub allow_2217: bool,
    pub kickolduser: bool,
    pub telnet_brk_on_sync: bool,
    pub enable_chardelay: bool,
    /// Character periods to wait for the next character, in tenths.
    pub chardelay_scale: u32,
    /// Lower clamp on the computed delay, microseconds.
    pub chardelay_min: u32,
    /// Hard bound on how long a byte may sit buffered, microseconds.
    pub chardelay_max: u32,
    pub dev_to_tcp_bufsize: usize,
    pub tcp_to_dev_bufsize: usize,
    pub banner: Option<String>,
    pub signature: Option<String>,
    pub openstr: Option<String>,
    pub closestr: Option<String>,
    pub closeon: Option<Vec<u8>>,
    pub trace_read: TraceSpec,
    pub trace_write: TraceSpec,
    pub trace_both: TraceSpec,
    pub led_rx: Option<Arc<dyn Led>>,
    pub led_tx: Option<Arc<dyn Led>>,
    pub rs485: Option<Rs485Config>,
    /// Device parameter tokens the port layer does not interpret
    /// ("9600 8DATABITS NONE 1STOPBIT …"); handed to the device factory.
    pub devcfg: String,
    /// Generation counter of the configuration load that produced this.
    pub config_num: i32,
}

impl fmt::Debug for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortConfig")
            .field("name", &self.name)
            .field("devname", &self.devname)
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("devcfg", &self.devcfg)
            .finish_non_exhaustive()
    }
}

impl PortConfig {
    pub fn new(name: &str, devname: &str, defaults: &PortDefaults) -> Self {
        PortConfig {
            name: name.to_string(),
            devname: devname.to_string(),
            mode: Mode::Disabled,
            timeout: 0,
            allow_2217: defaults.remctl,
            kickolduser: defaults.kickolduser,
            telnet_brk_on_sync: defaults.telnet_brk_on_sync,
            enable_chardelay: defaults.chardelay,
            chardelay_scale: defaults.chardelay_scale,
            chardelay_min: defaults.chardelay_min,
            chardelay_max: defaults.chardelay_max,
            dev_to_tcp_bufsize: defaults.dev_to_tcp_bufsize.max(2),
            tcp_to_dev_bufsize: defaults.tcp_to_dev_bufsize.max(2),
            banner: None,
            signature: None,
            openstr: None,
            closestr: None,
            closeon: None,
            trace_read: TraceSpec::default(),
            trace_write: TraceSpec::default(),
            trace_both: TraceSpec::default(),
            led_rx: None,
            led_tx: None,
            rs485: None,
            devcfg: String::new(),
            config_num: 0,
        }
    }

    /// True if the listen spec means stdin/stdout.
    pub fn is_stdio(&self) -> bool {
        !self.name.is_empty() && self.name.bytes().all(|b| b == b'0')
    }

    /// Apply one device-configuration token. Port-level keywords are
    /// consumed here; anything unrecognized is assumed to be a device
    /// parameter and accumulated into `devcfg` for the device layer to
    /// parse (which is also where typos get caught).
    pub fn apply_keyword(
        &mut self,
        tok: &str,
        resolver: &dyn ConfigResolver,
    ) -> Result<(), ConfigError> {
        fn yesno(tok: &str) -> bool {
            !tok.starts_with('-')
        }
        fn intval(tok: &str, prefix: &str) -> Result<u32, ConfigError> {
            tok[prefix.len()..]
                .parse()
                .map_err(|_| ConfigError(format!("Invalid number for {prefix}{}", &tok[prefix.len()..])))
        }

        match tok {
            "remctl" | "-remctl" => self.allow_2217 = yesno(tok),
            "kickolduser" | "-kickolduser" => self.kickolduser = yesno(tok),
            "telnet_brk_on_sync" | "-telnet_brk_on_sync" => {
                self.telnet_brk_on_sync = yesno(tok)
            }
            "chardelay" | "-chardelay" => self.enable_chardelay = yesno(tok),
            "hexdump" | "-hexdump" => {
                self.trace_read.hexdump = yesno(tok);
                self.trace_write.hexdump = yesno(tok);
                self.trace_both.hexdump = yesno(tok);
            }
            "timestamp" | "-timestamp" => {
                self.trace_read.timestamp = yesno(tok);
                self.trace_write.timestamp = yesno(tok);
                self.trace_both.timestamp = yesno(tok);
            }
            "tr-hexdump" | "-tr-hexdump" => self.trace_read.hexdump = yesno(tok),
            "tr-timestamp" | "-tr-timestamp" => self.trace_read.timestamp = yesno(tok),
            "tw-hexdump" | "-tw-hexdump" => self.trace_write.hexdump = yesno(tok),
            "tw-timestamp" | "-tw-timestamp" => self.trace_write.timestamp = yesno(tok),
            "tb-hexdump" | "-tb-hexdump" => self.trace_both.hexdump = yesno(tok),
            "tb-timestamp" | "-tb-timestamp" => self.trace_both.timestamp = yesno(tok),
            _ => {
                if let Some(name) = tok.strip_prefix("tr=") {
                    self.trace_read.filename = Some(resolver.find_tracefile(name).ok_or_else(
                        || ConfigError(format!("No trace file named {name}")),
                    )?);
                } else if let Some(name) = tok.strip_prefix("tw=") {
                    self.trace_write.filename = Some(resolver.find_tracefile(name).ok_or_else(
                        || ConfigError(format!("No trace file named {name}")),
                    )?);
                } else if let Some(name) = tok.strip_prefix("tb=") {
                    self.trace_both.filename = Some(resolver.find_tracefile(name).ok_or_else(
                        || ConfigError(format!("No trace file named {name}")),
                    )?);
                } else if let Some(name) = tok.strip_prefix("led-rx=") {
                    self.led_rx = Some(
                        resolver
                            .find_led(name)
                            .ok_or_else(|| ConfigError(format!("No LED named {name}")))?,
                    );
                } else if let Some(name) = tok.strip_prefix("led-tx=") {
                    self.led_tx = Some(
                        resolver
                            .find_led(name)
                            .ok_or_else(|| ConfigError(format!("No LED named {name}")))?,
                    );
                } else if let Some(name) = tok.strip_prefix("rs485=") {
                    self.rs485 = Some(
                        resolver
                            .find_rs485(name)
                            .ok_or_else(|| ConfigError(format!("No RS-485 config named {name}")))?,
                    );
                } else if let Some(prefix) = ["chardelay-scale=", "chardelay-min=", "chardelay-max=",
                        "dev-to-tcp-bufsize=", "tcp-to-dev-bufsize="]
                    .iter()
                    .find(|p| tok.starts_with(**p))
                {
                    let val = intval(tok, prefix)?;
                    match *prefix {
                        "chardelay-scale=" => self.chardelay_scale = val,
                        "chardelay-min=" => self.chardelay_min = val,
                        "chardelay-max=" => self.chardelay_max = val,
                        "dev-to-tcp-bufsize=" => self.dev_to_tcp_bufsize = (val as usize).max(2),
                        "tcp-to-dev-bufsize=" => self.tcp_to_dev_bufsize = (val as usize).max(2),
                        _ => unreachable!(),
                    }
                } else if let Some(named) = resolver.find_string(tok) {
                    match named {
                        NamedString::Banner(s) => self.banner = Some(s),
                        NamedString::Signature(s) => self.signature = Some(s),
                        NamedString::OpenStr(s) => self.openstr = Some(s),
                        NamedString::CloseStr(s) => self.closestr = Some(s),
                        NamedString::Closeon(s) => self.closeon = Some(s),
                        NamedString::Devname(_) => {
                            return Err(ConfigError(format!(
                                "Device name string used as config item: {tok}"
                            )))
                        }
                    }
                } else {
                    // Not ours; let the device layer judge it.
                    if !self.devcfg.is_empty() {
                        self.devcfg.push(' ');
                    }
                    self.devcfg.push_str(tok);
                }
            }
        }
        Ok(())
    }
}

/// A resolver with nothing defined, for tests and for `setportconfig`
/// strings that only carry device parameters.
pub struct EmptyResolver;

impl ConfigResolver for EmptyResolver {
    fn find_string(&self, _name: &str) -> Option<NamedString> {
        None
    }

    fn find_tracefile(&self, _name: &str) -> Option<String> {
        None
    }

    fn find_led(&self, _name: &str) -> Option<Arc<dyn Led>> {
        None
    }

    fn find_rs485(&self, _name: &str) -> Option<Rs485Config> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PortConfig {
        PortConfig::new("3001", "/dev/ttyS0", &PortDefaults::default())
    }

    #[test]
    fn toggles_and_numbers() {
        let mut c = cfg();
        c.apply_keyword("remctl", &EmptyResolver).unwrap();
        assert!(c.allow_2217);
        c.apply_keyword("-remctl", &EmptyResolver).unwrap();
        assert!(!c.allow_2217);
        c.apply_keyword("chardelay-scale=5", &EmptyResolver).unwrap();
        assert_eq!(c.chardelay_scale, 5);
        assert!(c.apply_keyword("chardelay-scale=x", &EmptyResolver).is_err());
    }

    #[test]
    fn unknown_tokens_accumulate_as_devcfg() {
        let mut c = cfg();
        c.apply_keyword("9600", &EmptyResolver).unwrap();
        c.apply_keyword("8DATABITS", &EmptyResolver).unwrap();
        c.apply_keyword("NONE", &EmptyResolver).unwrap();
        assert_eq!(c.devcfg, "9600 8DATABITS NONE");
    }

    #[test]
    fn trace_toggles_fan_out() {
        let mut c = cfg();
        c.apply_keyword("hexdump", &EmptyResolver).unwrap();
        assert!(c.trace_read.hexdump && c.trace_write.hexdump && c.trace_both.hexdump);
        c.apply_keyword("-tw-hexdump", &EmptyResolver).unwrap();
        assert!(c.trace_read.hexdump && !c.trace_write.hexdump);
    }

    #[test]
    fn stdio_name_detection() {
        let mut c = cfg();
        assert!(!c.is_stdio());
        c.name = "0".into();
        assert!(c.is_stdio());
        c.name = "000".into();
        assert!(c.is_stdio());
    }

    #[test]
    fn bufsize_floor() {
        let mut c = cfg();
        c.apply_keyword("dev-to-tcp-bufsize=1", &EmptyResolver).unwrap();
        assert_eq!(c.dev_to_tcp_bufsize, 2);
    }
}
