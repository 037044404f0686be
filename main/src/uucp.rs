//! UUCP-style lock files: the conventional filesystem claim on a serial
//! device (`/var/lock/LCK..ttyS0`), taken before open and released after
//! close. Stale locks from dead processes are broken automatically.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use nix::sys::signal::kill;
use nix::unistd::Pid;

const LOCK_DIR: &str = "/var/lock";

pub struct UucpLock {
    path: PathBuf,
}

impl Drop for UucpLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(devname: &str) -> PathBuf {
    let base = devname.rsplit('/').next().unwrap_or(devname);
    PathBuf::from(LOCK_DIR).join(format!("LCK..{base}"))
}

fn holder_pid(path: &PathBuf) -> Option<i32> {
    let mut text = String::new();
    OpenOptions::new()
        .read(true)
        .open(path)
        .ok()?
        .read_to_string(&mut text)
        .ok()?;
    text.trim().parse().ok()
}

/// Claim `devname`. `Ok(None)` means the system has no usable lock
/// directory (containers, test boxes) and locking is skipped.
pub fn acquire(devname: &str) -> Result<Option<UucpLock>, String> {
    let path = lock_path(devname);
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                // HDB format: the pid, ten columns wide.
                let _ = write!(f, "{:10}\n", std::process::id());
                return Ok(Some(UucpLock { path }));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match holder_pid(&path) {
                    Some(pid) if kill(Pid::from_raw(pid), None).is_err() => {
                        // Stale: the holder is gone.
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    Some(pid) => {
                        return Err(format!("Port's device is in use by pid {pid}"));
                    }
                    None => {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                log::debug!("no usable lock directory for {devname}: {e}");
                return Ok(None);
            }
            Err(e) => return Err(format!("Unable to create lock file: {e}")),
        }
    }
    Err("Port's device is locked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names_use_the_basename() {
        assert_eq!(
            lock_path("/dev/ttyUSB0"),
            PathBuf::from("/var/lock/LCK..ttyUSB0")
        );
        assert_eq!(lock_path("plain"), PathBuf::from("/var/lock/LCK..plain"));
    }
}
