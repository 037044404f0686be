//! Configuration file parsing and the tables behind named banners, trace
//! files, LEDs and RS-485 blocks. This module stays format-focused: it
//! checks shape, not meaning. Semantic validation happens when ports are
//! actually created.
//!
//! ```yaml
//! controller: "127.0.0.1:3000"
//! defaults:
//!   chardelay: true
//! banners:
//!   b1: "port \\p device \\d\\r\\n"
//! tracefiles:
//!   t1: "/var/log/portmux/\\p-\\Y\\m\\D"
//! ports:
//!   - port: "3001"
//!     state: telnet
//!     timeout: 600
//!     device: /dev/ttyS0
//!     options: "9600 8DATABITS NONE 1STOPBIT remctl b1"
//! rotators:
//!   - port: "3020"
//!     ports: ["3001", "3002"]
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::Deserialize;

use portmux::config::{
    ConfigResolver, NamedString, PortConfig, PortDefaults, Rs485Config,
};
use portmux::device::Led;
use portmux::expand::unescape;
use portmux::registry::{AccessCheck, Registry};
use portmux::Mode;

use crate::led::SysfsLed;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Listen spec of the administrative endpoint.
    pub controller: Option<String>,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub banners: HashMap<String, String>,
    #[serde(default)]
    pub signatures: HashMap<String, String>,
    #[serde(default)]
    pub openstrs: HashMap<String, String>,
    #[serde(default)]
    pub closestrs: HashMap<String, String>,
    #[serde(default)]
    pub closeons: HashMap<String, String>,
    #[serde(default)]
    pub devicenames: HashMap<String, String>,
    #[serde(default)]
    pub tracefiles: HashMap<String, String>,
    /// LED name to sysfs directory.
    #[serde(default)]
    pub leds: HashMap<String, String>,
    #[serde(default)]
    pub rs485: HashMap<String, Rs485Section>,
    /// CIDR allow-list for data-port peers; empty means everyone.
    #[serde(default, rename = "allowed-hosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortSection>,
    #[serde(default)]
    pub rotators: Vec<RotatorSection>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsSection {
    #[serde(default)]
    pub remctl: bool,
    #[serde(default)]
    pub kickolduser: bool,
    #[serde(default, rename = "telnet-brk-on-sync")]
    pub telnet_brk_on_sync: bool,
    #[serde(default = "yes")]
    pub chardelay: bool,
    #[serde(default = "d_scale", rename = "chardelay-scale")]
    pub chardelay_scale: u32,
    #[serde(default = "d_min", rename = "chardelay-min")]
    pub chardelay_min: u32,
    #[serde(default = "d_max", rename = "chardelay-max")]
    pub chardelay_max: u32,
    #[serde(default = "d_bufsize", rename = "dev-to-tcp-bufsize")]
    pub dev_to_tcp_bufsize: usize,
    #[serde(default = "d_bufsize", rename = "tcp-to-dev-bufsize")]
    pub tcp_to_dev_bufsize: usize,
}

fn yes() -> bool {
    true
}
fn d_scale() -> u32 {
    2
}
fn d_min() -> u32 {
    1000
}
fn d_max() -> u32 {
    20000
}
fn d_bufsize() -> usize {
    64
}

impl Default for DefaultsSection {
    fn default() -> Self {
        DefaultsSection {
            remctl: false,
            kickolduser: false,
            telnet_brk_on_sync: false,
            chardelay: yes(),
            chardelay_scale: d_scale(),
            chardelay_min: d_min(),
            chardelay_max: d_max(),
            dev_to_tcp_bufsize: d_bufsize(),
            tcp_to_dev_bufsize: d_bufsize(),
        }
    }
}

impl DefaultsSection {
    fn port_defaults(&self) -> PortDefaults {
        PortDefaults {
            remctl: self.remctl,
            kickolduser: self.kickolduser,
            telnet_brk_on_sync: self.telnet_brk_on_sync,
            chardelay: self.chardelay,
            chardelay_scale: self.chardelay_scale,
            chardelay_min: self.chardelay_min,
            chardelay_max: self.chardelay_max,
            dev_to_tcp_bufsize: self.dev_to_tcp_bufsize,
            tcp_to_dev_bufsize: self.tcp_to_dev_bufsize,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSection {
    /// TCP listen spec; "0" means stdin/stdout.
    pub port: String,
    /// off, raw, rawlp or telnet.
    pub state: String,
    #[serde(default)]
    pub timeout: u32,
    pub device: String,
    /// Device parameters and port keywords, whitespace separated.
    #[serde(default)]
    pub options: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotatorSection {
    pub port: String,
    pub ports: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rs485Section {
    #[serde(default, rename = "delay-rts-before-send")]
    pub delay_rts_before_send: u32,
    #[serde(default, rename = "delay-rts-after-send")]
    pub delay_rts_after_send: u32,
    #[serde(default, rename = "rts-on-send")]
    pub rts_on_send: bool,
    #[serde(default, rename = "rts-after-send")]
    pub rts_after_send: bool,
    #[serde(default, rename = "rx-during-tx")]
    pub rx_during_tx: bool,
}

impl Rs485Section {
    fn to_config(self) -> Rs485Config {
        Rs485Config {
            delay_rts_before_send: self.delay_rts_before_send,
            delay_rts_after_send: self.delay_rts_after_send,
            rts_on_send: self.rts_on_send,
            rts_after_send: self.rts_after_send,
            rx_during_tx: self.rx_during_tx,
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<ConfigFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    parse(&text).with_context(|| format!("could not parse {}", path.display()))
}

pub fn parse(text: &str) -> anyhow::Result<ConfigFile> {
    Ok(serde_yaml::from_str(text)?)
}

#[derive(Default)]
struct Tables {
    banners: HashMap<String, String>,
    signatures: HashMap<String, String>,
    openstrs: HashMap<String, String>,
    closestrs: HashMap<String, String>,
    closeons: HashMap<String, Vec<u8>>,
    devicenames: HashMap<String, String>,
    tracefiles: HashMap<String, String>,
    leds: HashMap<String, Arc<SysfsLed>>,
    rs485: HashMap<String, Rs485Config>,
}

/// Resolver over the configuration tables. Interior-mutable so a SIGHUP
/// reload swaps the tables while the registry keeps its handle.
#[derive(Default)]
pub struct FileResolver {
    tables: Mutex<Tables>,
}

impl FileResolver {
    pub fn new() -> Arc<FileResolver> {
        Arc::new(FileResolver::default())
    }

    pub fn update(&self, file: &ConfigFile) {
        let mut tables = self.tables.lock().unwrap();
        tables.banners = file.banners.clone();
        tables.signatures = file.signatures.clone();
        tables.openstrs = file.openstrs.clone();
        tables.closestrs = file.closestrs.clone();
        tables.closeons = file
            .closeons
            .iter()
            .map(|(k, v)| (k.clone(), unescape(v)))
            .collect();
        tables.devicenames = file.devicenames.clone();
        tables.tracefiles = file.tracefiles.clone();
        tables.rs485 = file
            .rs485
            .iter()
            .map(|(k, v)| (k.clone(), v.to_config()))
            .collect();
        // Keep already-created LEDs; sysfs setup happens once per name.
        let old = std::mem::take(&mut tables.leds);
        for (name, dir) in &file.leds {
            let led = old
                .get(name)
                .cloned()
                .unwrap_or_else(|| Arc::new(SysfsLed::new(name, dir)));
            tables.leds.insert(name.clone(), led);
        }
    }
}

impl ConfigResolver for FileResolver {
    fn find_string(&self, name: &str) -> Option<NamedString> {
        let tables = self.tables.lock().unwrap();
        if let Some(s) = tables.banners.get(name) {
            return Some(NamedString::Banner(s.clone()));
        }
        if let Some(s) = tables.signatures.get(name) {
            return Some(NamedString::Signature(s.clone()));
        }
        if let Some(s) = tables.openstrs.get(name) {
            return Some(NamedString::OpenStr(s.clone()));
        }
        if let Some(s) = tables.closestrs.get(name) {
            return Some(NamedString::CloseStr(s.clone()));
        }
        if let Some(s) = tables.closeons.get(name) {
            return Some(NamedString::Closeon(s.clone()));
        }
        if let Some(s) = tables.devicenames.get(name) {
            return Some(NamedString::Devname(s.clone()));
        }
        None
    }

    fn find_tracefile(&self, name: &str) -> Option<String> {
        self.tables.lock().unwrap().tracefiles.get(name).cloned()
    }

    fn find_led(&self, name: &str) -> Option<Arc<dyn Led>> {
        self.tables
            .lock()
            .unwrap()
            .leds
            .get(name)
            .cloned()
            .map(|l| l as Arc<dyn Led>)
    }

    fn find_rs485(&self, name: &str) -> Option<Rs485Config> {
        self.tables.lock().unwrap().rs485.get(name).copied()
    }
}

/// Turn one port section into a full `PortConfig`.
pub fn build_port(
    section: &PortSection,
    defaults: &DefaultsSection,
    resolver: &dyn ConfigResolver,
    config_num: i32,
) -> anyhow::Result<PortConfig> {
    let mode: Mode = section
        .state
        .parse()
        .map_err(|_| anyhow::anyhow!("state was invalid: {}", section.state))?;

    // The device field may itself be a configured device name.
    let devname = match resolver.find_string(&section.device) {
        Some(NamedString::Devname(d)) => d,
        _ => section.device.clone(),
    };

    let mut cfg = PortConfig::new(&section.port, &devname, &defaults.port_defaults());
    cfg.mode = mode;
    cfg.timeout = section.timeout;
    cfg.config_num = config_num;
    for tok in section.options.split_whitespace() {
        cfg.apply_keyword(tok, resolver)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(cfg)
}

/// Instantiate every port and rotator a configuration file names,
/// logging (and skipping) the broken ones.
pub fn apply(
    registry: &Arc<Registry>,
    file: &ConfigFile,
    defaults: &DefaultsSection,
    resolver: &dyn ConfigResolver,
    config_num: i32,
) {
    for section in &file.ports {
        match build_port(section, defaults, resolver, config_num) {
            Ok(cfg) => {
                if let Err(e) = registry.add_port(cfg) {
                    log::error!("Error configuring port {}: {e}", section.port);
                }
            }
            Err(e) => log::error!("Error configuring port {}: {e}", section.port),
        }
    }
    for section in &file.rotators {
        if let Err(e) = registry.add_rotator(&section.port, section.ports.clone()) {
            log::error!("Error configuring rotator {}: {e}", section.port);
        }
    }
}

/// Build the peer allow-list predicate.
pub fn access_check(allowed: &[String]) -> anyhow::Result<Option<AccessCheck>> {
    if allowed.is_empty() {
        return Ok(None);
    }
    let nets: Vec<ipnet::IpNet> = allowed
        .iter()
        .map(|s| {
            s.parse()
                .with_context(|| format!("bad allowed-hosts entry: {s}"))
        })
        .collect::<anyhow::Result<_>>()?;
    Ok(Some(Arc::new(move |peer: SocketAddr| {
        nets.iter().any(|net| net.contains(&peer.ip()))
    })))
}
