//! Sysfs LED driver for per-port rx/tx activity blinking. Flashes use the
//! kernel's oneshot trigger and are strictly fire-and-forget.

use std::fs;
use std::path::PathBuf;

use portmux::device::Led;

pub struct SysfsLed {
    name: String,
    shot: PathBuf,
}

impl SysfsLed {
    /// `dir` is the LED's sysfs directory (`/sys/class/leds/<led>`). The
    /// trigger is switched to oneshot here; a missing LED just produces
    /// silent no-op flashes.
    pub fn new(name: &str, dir: &str) -> SysfsLed {
        let dir = PathBuf::from(dir);
        if fs::write(dir.join("trigger"), "oneshot").is_err() {
            log::warn!("Unable to set oneshot trigger for LED {name}");
        }
        SysfsLed {
            name: name.to_string(),
            shot: dir.join("shot"),
        }
    }
}

impl Led for SysfsLed {
    fn flash(&self) {
        let _ = fs::write(&self.shot, "1");
    }

    fn name(&self) -> &str {
        &self.name
    }
}
