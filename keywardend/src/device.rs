//! Physical keyboard devices: exclusive grabbing, blocking reads, and
//! hot-plug identity.

use keywarden_common::tracing;
use keywarden_common::InputEvent;
use evdev::Device as EvdevDevice;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// EVIOCGRAB ioctl number for exclusive device access
const EVIOCGRAB: u64 = 0x40044590;

/// Upper bound on simultaneously multiplexed devices.
pub const MULTIPLEX_MAX: usize = 64;

/// Errors from keyboard device I/O
#[derive(Error, Debug)]
pub enum KeyboardError {
    #[error("failed to open device: {0}")]
    Open(io::Error),
    #[error("read error: {0}")]
    Read(io::Error),
    #[error("device returned end of file")]
    Eof,
    #[error("grab ioctl failed: {0}")]
    Grab(io::Error),
    #[error("device is disabled")]
    Disabled,
}

/// Grab state of a physical keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbdState {
    /// Open without an exclusive grab; events also reach other readers.
    Open,
    /// Exclusively grabbed; the daemon is the only reader.
    Locked,
    /// Failed or unplugged; no fd activity until `reset`.
    Disabled,
}

/// One physical keyboard device.
///
/// Identity (name + physical id) is captured at open time and survives
/// `reset`, which is how a keyboard is recognized again after being
/// unplugged and re-enumerated under a different event node.
pub struct Keyboard {
    dev: EvdevDevice,
    path: PathBuf,
    name: String,
    phys: String,
    state: KbdState,
}

impl Keyboard {
    /// Open the character device and capture its identity.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KeyboardError> {
        let path = path.as_ref().to_path_buf();
        let dev = EvdevDevice::open(&path).map_err(KeyboardError::Open)?;
        let name = dev.name().unwrap_or("Unknown Device").to_string();
        let phys = dev.physical_path().unwrap_or("unknown").to_string();
        Ok(Self {
            dev,
            path,
            name,
            phys,
            state: KbdState::Open,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phys(&self) -> &str {
        &self.phys
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> KbdState {
        self.state
    }

    pub fn raw_fd(&self) -> RawFd {
        self.dev.as_raw_fd()
    }

    /// Acquire the exclusive grab. Idempotent when already locked.
    pub fn lock(&mut self) -> Result<(), KeyboardError> {
        if self.state == KbdState::Locked {
            return Ok(());
        }
        let rc = unsafe { libc::ioctl(self.dev.as_raw_fd(), EVIOCGRAB, 1 as libc::c_int) };
        if rc < 0 {
            return Err(KeyboardError::Grab(io::Error::last_os_error()));
        }
        self.state = KbdState::Locked;
        Ok(())
    }

    /// Release the exclusive grab.
    pub fn unlock(&mut self) -> Result<(), KeyboardError> {
        let rc = unsafe { libc::ioctl(self.dev.as_raw_fd(), EVIOCGRAB, 0 as libc::c_int) };
        if rc < 0 {
            return Err(KeyboardError::Grab(io::Error::last_os_error()));
        }
        self.state = KbdState::Open;
        Ok(())
    }

    /// Blocking read of one event.
    pub fn get(&mut self) -> Result<InputEvent, KeyboardError> {
        if self.state == KbdState::Disabled {
            return Err(KeyboardError::Disabled);
        }
        let fd = self.dev.as_raw_fd();
        let mut buf = [0u8; InputEvent::SIZE];
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(KeyboardError::Read(err));
            }

            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == buf.len() as isize {
                return Ok(InputEvent::from_bytes(&buf));
            }
            if n == 0 {
                return Err(KeyboardError::Eof);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => return Err(KeyboardError::Read(err)),
                }
            } else {
                // The kernel hands out whole input_event records only.
                return Err(KeyboardError::Read(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short read from input device",
                )));
            }
        }
    }

    /// Mark the keyboard as failed. The caller must not call `get` again
    /// until `reset` has re-attached it to a device node.
    pub fn disable(&mut self) {
        self.state = KbdState::Disabled;
    }

    /// Re-open against a new device path after hot-plug re-enumeration.
    /// Identity is preserved; the grab is not (call `lock` afterwards).
    pub fn reset<P: AsRef<Path>>(&mut self, new_path: P) -> Result<(), KeyboardError> {
        let new_path = new_path.as_ref().to_path_buf();
        let dev = EvdevDevice::open(&new_path).map_err(KeyboardError::Open)?;
        self.dev = dev;
        self.path = new_path;
        self.state = KbdState::Open;
        Ok(())
    }

    /// Hot-plug identity test: does the device at `path` report the same
    /// name and physical id as this keyboard? For identical twin devices
    /// on the same bus the first match wins.
    pub fn is_me<P: AsRef<Path>>(&self, path: P) -> Result<bool, KeyboardError> {
        let dev = EvdevDevice::open(path.as_ref()).map_err(KeyboardError::Open)?;
        let name = dev.name().unwrap_or("Unknown Device");
        let phys = dev.physical_path().unwrap_or("unknown");
        Ok(name == self.name && phys == self.phys)
    }
}

/// Block until one of `fds` is readable (or has an error condition to
/// surface) and return its index, or `None` on timeout. At most
/// [`MULTIPLEX_MAX`] devices are considered.
pub fn multiplex(fds: &[RawFd], timeout_ms: i32) -> io::Result<Option<usize>> {
    if fds.is_empty() {
        if timeout_ms > 0 {
            thread::sleep(Duration::from_millis(timeout_ms as u64));
        }
        return Ok(None);
    }

    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .take(MULTIPLEX_MAX)
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(None);
    }
    // POLLERR/POLLHUP are reported unconditionally; surfacing those fds
    // lets the caller's read path detect the dead device.
    Ok(pfds.iter().position(|p| p.revents != 0))
}

/// Enumerate `/dev/input/event*` nodes that look like keyboards.
pub fn discover_keyboards() -> Vec<PathBuf> {
    let mut found = Vec::new();
    let entries = match fs::read_dir("/dev/input") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read /dev/input: {}", e);
            return found;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !file_name.starts_with("event") {
            continue;
        }
        match EvdevDevice::open(&path) {
            Ok(dev) => {
                let keys = dev.supported_keys();
                let is_keyboard = dev.supported_events().contains(evdev::EventType::KEY)
                    && keys.map_or(false, |k| {
                        k.contains(evdev::Key::KEY_ENTER) && k.contains(evdev::Key::KEY_A)
                    });
                if is_keyboard {
                    info!(
                        "Found keyboard: {} at {}",
                        dev.name().unwrap_or("Unknown Device"),
                        path.display()
                    );
                    found.push(path);
                }
            }
            Err(e) => {
                debug!("Failed to open {}: {}", path.display(), e);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_multiplex_times_out_when_idle() {
        let (r, w) = pipe();
        assert_eq!(multiplex(&[r], 20).unwrap(), None);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_multiplex_reports_readable_fd() {
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let n = unsafe { libc::write(w2, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        assert_eq!(multiplex(&[r1, r2], 1000).unwrap(), Some(1));

        unsafe {
            libc::close(r1);
            libc::close(w1);
            libc::close(r2);
            libc::close(w2);
        }
    }

    #[test]
    fn test_multiplex_empty_set_sleeps() {
        assert_eq!(multiplex(&[], 10).unwrap(), None);
    }

    #[test]
    fn test_multiplex_surfaces_hangup() {
        // A pipe whose write end is closed polls as ready so the caller's
        // read can observe EOF and pull the device.
        let (r, w) = pipe();
        unsafe { libc::close(w) };
        assert_eq!(multiplex(&[r], 1000).unwrap(), Some(0));
        unsafe { libc::close(r) };
    }
}
