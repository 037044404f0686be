//! portmuxd: multiplex local serial devices onto TCP endpoints. Remote
//! clients read, write and (over RFC 2217) control a device as if it were
//! attached locally; a separate line-oriented admin endpoint inspects and
//! manages the ports while traffic flows.

use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use portmux::control::ControlPlane;
use portmux::device::{DeviceFactory, DeviceIo};
use portmux::reactor::Reactor;
use portmux::registry::Registry;

use portmuxd::config;
use portmuxd::reactor::EpollReactor;
use portmuxd::serial::SerialDevice;

const ABOUT: &str = "\
    Multiplex local serial devices onto TCP endpoints, with optional\n\
    telnet and RFC 2217 remote serial control.";

#[derive(Debug, Parser)]
#[clap(name = "portmuxd", about = ABOUT)]
#[clap(version)]
struct CliOptions {
    /// Path to the configuration file
    #[clap(short = 'c', long, default_value = "/etc/portmuxd.yaml")]
    config: PathBuf,

    /// Admin endpoint listen spec, overriding the configuration file
    #[clap(short = 'p', long)]
    controller: Option<String>,

    /// Parse the configuration, report problems, and exit
    #[clap(long)]
    check: bool,
}

/// stdin/stdout duplicated into nonblocking files for a stdio-backed port.
fn stdio_files() -> anyhow::Result<(File, File)> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let mut files = Vec::with_capacity(2);
    for fd in [0, 1] {
        let dup = nix::unistd::dup(fd).context("could not dup stdio")?;
        fcntl(dup, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("could not make stdio nonblocking")?;
        // dup() just handed us sole ownership of this descriptor.
        files.push(unsafe { File::from_raw_fd(dup) });
    }
    let tx = files.pop().unwrap();
    let rx = files.pop().unwrap();
    Ok((rx, tx))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = CliOptions::parse();

    let file = config::load(&opts.config)?;
    if opts.check {
        println!("configuration OK");
        return Ok(());
    }

    let reactor = EpollReactor::new().context("could not create the event loop")?;
    let dyn_reactor: Arc<dyn Reactor> = reactor.clone();

    let resolver = config::FileResolver::new();
    resolver.update(&file);

    let factory: DeviceFactory = {
        let reactor = dyn_reactor.clone();
        Arc::new(move |cfg| {
            SerialDevice::new(reactor.clone(), cfg).map(|d| Box::new(d) as Box<dyn DeviceIo>)
        })
    };
    let access = config::access_check(&file.allowed_hosts)?;
    let registry = Registry::new(dyn_reactor.clone(), factory, resolver.clone(), access);

    let mut defaults = file.defaults.clone();
    let mut config_num = 0;
    config::apply(&registry, &file, &defaults, resolver.as_ref(), config_num);

    let controller_spec = opts.controller.clone().or_else(|| file.controller.clone());
    let plane = match controller_spec {
        Some(spec) => {
            let plane = ControlPlane::new(
                dyn_reactor.clone(),
                registry.clone(),
                "portmuxd",
                env!("CARGO_PKG_VERSION"),
            );
            plane
                .startup(&spec)
                .with_context(|| format!("could not open the controller port {spec}"))?;
            for addr in plane.listen_addrs() {
                log::info!("controller listening on {addr}");
            }
            Some(plane)
        }
        None => None,
    };

    let have_stdio = file
        .ports
        .iter()
        .any(|p| !p.port.is_empty() && p.port.bytes().all(|b| b == b'0'));
    if have_stdio {
        let (rx, tx) = stdio_files()?;
        registry
            .start_stdio(rx, tx)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let hup = Arc::new(AtomicBool::new(false));
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, hup.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone())?;

    log::info!("portmuxd {} running", env!("CARGO_PKG_VERSION"));

    loop {
        reactor.turn(Some(Duration::from_millis(500)));

        if term.load(Ordering::Relaxed) {
            break;
        }
        if hup.swap(false, Ordering::Relaxed) {
            log::info!("got SIGHUP, rereading {}", opts.config.display());
            match config::load(&opts.config) {
                Ok(newfile) => {
                    config_num += 1;
                    resolver.update(&newfile);
                    registry.clear_rotators();
                    defaults = newfile.defaults.clone();
                    config::apply(&registry, &newfile, &defaults, resolver.as_ref(), config_num);
                    registry.clear_old_config(config_num);
                }
                Err(e) => log::error!("not applying new configuration: {e:#}"),
            }
        }
    }

    log::info!("shutting down");
    registry.shutdown_all_and_wait();
    if let Some(plane) = plane {
        plane.shutdown();
        while !plane.is_idle() {
            reactor.turn(Some(Duration::from_millis(50)));
        }
    }
    Ok(())
}
