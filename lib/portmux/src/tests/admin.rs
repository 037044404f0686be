//! Control-plane scenarios: line editing, commands, monitoring.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use super::{
    at_eof, basic_config, connect_session, dev_kick, drain, test_factory, DevTable, TestReactor,
};
use crate::config::EmptyResolver;
use crate::control::ControlPlane;
use crate::registry::Registry;
use crate::Mode;

fn setup() -> (Arc<TestReactor>, Arc<Registry>, DevTable, Arc<ControlPlane>) {
    let reactor = TestReactor::new();
    let (factory, devices) = test_factory();
    let r: Arc<dyn crate::reactor::Reactor> = reactor.clone();
    let registry = Registry::new(r.clone(), factory, Arc::new(EmptyResolver), None);
    let plane = ControlPlane::new(r, registry.clone(), "portmuxd", "1.2.3");
    plane.startup("127.0.0.1:0").unwrap();
    (reactor, registry, devices, plane)
}

fn admin_connect(reactor: &Arc<TestReactor>, plane: &Arc<ControlPlane>) -> TcpStream {
    let addr = plane.listen_addrs()[0];
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(1));
        reactor.settle();
    }
    stream
}

fn command(reactor: &Arc<TestReactor>, stream: &mut TcpStream, line: &str) -> Vec<u8> {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\r").unwrap();
    let mut out = Vec::new();
    for _ in 0..30 {
        std::thread::sleep(Duration::from_millis(1));
        reactor.settle();
        out.extend_from_slice(&drain(stream));
        if out.windows(3).rev().take(8).any(|w| w == b"-> ") {
            break;
        }
    }
    out
}

fn text(out: &[u8]) -> String {
    String::from_utf8_lossy(out).into_owned()
}

#[test]
fn greets_with_prompt_and_reports_version() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut admin = admin_connect(&reactor, &plane);

    let greeting = drain(&mut admin);
    assert!(text(&greeting).contains("-> "));

    let out = command(&reactor, &mut admin, "version");
    assert!(text(&out).contains("portmuxd version 1.2.3"));
}

#[test]
fn unknown_command_and_help() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    let out = command(&reactor, &mut admin, "frobnicate");
    assert!(text(&out).contains("Unknown command: frobnicate"));

    let out = command(&reactor, &mut admin, "help");
    assert!(text(&out).contains("monitor stop - stop the current monitor."));
}

#[test]
fn backspace_edits_the_line() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    // "verx<BS>sion" submits as "version".
    let out = command(&reactor, &mut admin, "verx\x08sion");
    assert!(text(&out).contains("version 1.2.3"));
    // The erase echo went out too.
    assert!(text(&out).contains("\x08 \x08"));
}

#[test]
fn overlong_line_is_rejected() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    let long = "x".repeat(300);
    admin.write_all(long.as_bytes()).unwrap();
    let mut out = Vec::new();
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(1));
        reactor.settle();
        out.extend_from_slice(&drain(&mut admin));
    }
    assert!(text(&out).contains("Input line too long"));
}

#[test]
fn showport_reports_ports() {
    let (reactor, registry, _devices, plane) = setup();
    let mut cfg = basic_config("127.0.0.1:0", "showdev", Mode::Raw);
    cfg.timeout = 42;
    registry.add_port(cfg).unwrap();
    let port = registry.find_port("127.0.0.1:0", true).unwrap();

    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    let out = text(&command(&reactor, &mut admin, "showport"));
    assert!(out.contains(&format!("TCP Port {}", port.name)));
    assert!(out.contains("enable state: raw"));
    assert!(out.contains("timeout: 42"));
    assert!(out.contains("device: showdev"));

    let out = text(&command(&reactor, &mut admin, "showshortport nosuch"));
    assert!(out.contains("Invalid port number: nosuch"));
}

#[test]
fn setporttimeout_applies() {
    let (reactor, registry, _devices, plane) = setup();
    registry
        .add_port(basic_config("127.0.0.1:0", "todev", Mode::Raw))
        .unwrap();
    let port = registry.find_port("127.0.0.1:0", true).unwrap();

    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    command(&reactor, &mut admin, "setporttimeout 127.0.0.1:0 17");
    assert_eq!(port.inner.lock().unwrap().timeout, 17);

    let out = text(&command(&reactor, &mut admin, "setporttimeout 127.0.0.1:0 bogus"));
    assert!(out.contains("Invalid timeout: bogus"));
}

#[test]
fn monitor_tees_device_traffic_until_stopped() {
    let (reactor, registry, devices, plane) = setup();
    registry
        .add_port(basic_config("127.0.0.1:0", "mondev", Mode::Raw))
        .unwrap();
    let port = registry.find_port("127.0.0.1:0", true).unwrap();

    let mut client = connect_session(&reactor, &port, &devices, "mondev");
    let dev = devices.lock().unwrap()["mondev"].clone();

    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);
    command(&reactor, &mut admin, "monitor term 127.0.0.1:0");

    dev.lock().unwrap().from_dev.extend(b"abc");
    dev_kick(&dev);
    reactor.settle();

    // Both the data client and the monitor see the bytes.
    assert_eq!(drain(&mut client), b"abc");
    let seen = drain(&mut admin);
    assert!(seen.windows(3).any(|w| w == b"abc"));

    command(&reactor, &mut admin, "monitor stop");
    dev.lock().unwrap().from_dev.extend(b"xyz");
    dev_kick(&dev);
    reactor.settle();
    assert_eq!(drain(&mut client), b"xyz");
    let seen = drain(&mut admin);
    assert!(!seen.windows(3).any(|w| w == b"xyz"));
}

#[test]
fn second_monitor_is_refused() {
    let (reactor, registry, _devices, plane) = setup();
    registry
        .add_port(basic_config("127.0.0.1:0", "mon2", Mode::Raw))
        .unwrap();

    let mut a = admin_connect(&reactor, &plane);
    drain(&mut a);
    command(&reactor, &mut a, "monitor term 127.0.0.1:0");

    let mut b = admin_connect(&reactor, &plane);
    drain(&mut b);
    let out = text(&command(&reactor, &mut b, "monitor term 127.0.0.1:0"));
    assert!(out.contains("Port is already being monitored"));

    let out = text(&command(&reactor, &mut a, "monitor tcp 127.0.0.1:0"));
    assert!(out.contains("Already monitoring a port"));
}

#[test]
fn disconnect_drops_the_session() {
    let (reactor, registry, devices, plane) = setup();
    registry
        .add_port(basic_config("127.0.0.1:0", "discdev", Mode::Raw))
        .unwrap();
    let port = registry.find_port("127.0.0.1:0", true).unwrap();

    let mut client = connect_session(&reactor, &port, &devices, "discdev");
    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    command(&reactor, &mut admin, "disconnect 127.0.0.1:0");
    assert!(at_eof(&mut client));

    let out = text(&command(&reactor, &mut admin, "disconnect 127.0.0.1:0"));
    assert!(out.contains("Port not connected: 127.0.0.1:0"));
}

#[test]
fn exit_closes_the_session() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut admin = admin_connect(&reactor, &plane);
    drain(&mut admin);

    admin.write_all(b"exit\r").unwrap();
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(1));
        reactor.settle();
    }
    assert!(at_eof(&mut admin));
}

#[test]
fn session_cap_is_enforced() {
    let (reactor, _registry, _devices, plane) = setup();
    let mut sessions = Vec::new();
    for _ in 0..4 {
        sessions.push(admin_connect(&reactor, &plane));
    }
    let mut extra = admin_connect(&reactor, &plane);
    let out = drain(&mut extra);
    assert!(text(&out).contains("Too many controller ports"));
}
