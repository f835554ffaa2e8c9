//! Synthetic output device backed by `/dev/uinput`.
//!
//! Events are buffered by `emit` and written by `flush`, which paces each
//! write by a configurable delay. The pacing works around a compositor
//! bug where keys sent back-to-back get dropped.

use keywarden_common::tracing;
use keywarden_common::{InputEvent, EV_KEY};
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

// uinput ioctl constants
const UI_SET_EVBIT: u64 = 0x40045564; // _IOW('U', 100, int)
const UI_SET_KEYBIT: u64 = 0x40045565; // _IOW('U', 101, int)
const UI_SET_MSCBIT: u64 = 0x40045568; // _IOW('U', 104, int)
const UI_DEV_CREATE: u64 = 0x5501; // _IO('U', 1)
const UI_DEV_DESTROY: u64 = 0x5502; // _IO('U', 2)

const EV_SYN: u16 = 0x00;
const EV_MSC: u16 = 0x04;
const MSC_SCAN: u16 = 0x04;
const KEY_MAX: u16 = 0x2ff;
const BUS_VIRTUAL: u16 = 0x06;

/// Default pacing between written events, in microseconds.
const DEFAULT_EVENT_DELAY_US: u64 = 3800;

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Interface to the synthetic output device. The daemon core talks to
/// this trait so tests can substitute a recording implementation.
pub trait Injector: Send {
    /// Buffer one event for the next `flush`.
    fn emit(&mut self, ev: &InputEvent);

    /// Buffer one event given as raw fields.
    fn emit_parts(&mut self, type_: u16, code: u16, value: i32);

    /// Write all buffered events to the kernel, pacing each one.
    fn flush(&mut self) -> io::Result<()>;

    /// Buffer a key-up for every key this device currently holds pressed,
    /// in the order they were pressed.
    fn up_all(&mut self);

    /// Reconfigure the pacing delay in microseconds.
    fn set_event_delay(&mut self, micros: u64);

    /// Number of keys with more synthesized downs than ups.
    fn held_count(&self) -> usize;
}

/// Real uinput-backed injector.
pub struct UinputInjector {
    fd: Option<RawFd>,
    event_delay: Duration,
    buffer: Vec<InputEvent>,
    held: Vec<u16>,
}

impl UinputInjector {
    /// Create an uninitialized injector. `initialize` performs the
    /// privileged device setup.
    pub fn new() -> Self {
        Self {
            fd: None,
            event_delay: Duration::from_micros(DEFAULT_EVENT_DELAY_US),
            buffer: Vec::with_capacity(128),
            held: Vec::new(),
        }
    }

    /// Create the virtual keyboard device. Must run with privileges
    /// sufficient to open `/dev/uinput`; this failure is fatal for the
    /// daemon.
    pub fn initialize(&mut self) -> io::Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }

        info!("Initializing uinput virtual device");

        let uinput_file = OpenOptions::new().write(true).open("/dev/uinput")?;
        let fd = uinput_file.as_raw_fd();
        // Keep the fd valid for the lifetime of the injector; closed in Drop.
        mem::forget(uinput_file);

        unsafe {
            if libc::ioctl(fd, UI_SET_EVBIT, EV_KEY as libc::c_int) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(fd, UI_SET_EVBIT, EV_SYN as libc::c_int) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(fd, UI_SET_EVBIT, EV_MSC as libc::c_int) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(fd, UI_SET_MSCBIT, MSC_SCAN as libc::c_int) < 0 {
                warn!("Failed to set MSC_SCAN bit");
            }
            for key in 1..=KEY_MAX {
                if libc::ioctl(fd, UI_SET_KEYBIT, key as libc::c_int) < 0 {
                    warn!("Failed to set keybit for key {}", key);
                }
            }
        }

        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let name = b"Keywarden Virtual Keyboard";
        dev.name[..name.len()].copy_from_slice(name);
        dev.id.bustype = BUS_VIRTUAL;
        dev.id.vendor = 0x4b57;
        dev.id.product = 0x0001;
        dev.id.version = 1;

        unsafe {
            let dev_ptr = &dev as *const UinputUserDev as *const libc::c_void;
            if libc::write(fd, dev_ptr, mem::size_of::<UinputUserDev>()) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        info!(
            "Created uinput virtual device: {}",
            String::from_utf8_lossy(name)
        );
        self.fd = Some(fd);
        Ok(())
    }

    /// Key-hold bookkeeping: a key is held while it has seen more downs
    /// than ups. Repeats (value 2) do not stack.
    fn track(&mut self, ev: &InputEvent) {
        if ev.type_ != EV_KEY {
            return;
        }
        if ev.value > 0 {
            if !self.held.contains(&ev.code) {
                self.held.push(ev.code);
            }
        } else {
            self.held.retain(|&code| code != ev.code);
        }
    }

    /// Write one event to the uinput device, stamping it with the current
    /// time.
    fn write_event(&self, ev: &InputEvent) -> io::Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "uinput device not initialized"))?;

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            libc::gettimeofday(&mut tv, std::ptr::null_mut());
        }
        let stamped = InputEvent {
            tv_sec: tv.tv_sec as i64,
            tv_usec: tv.tv_usec as i64,
            ..*ev
        };

        let bytes = stamped.to_bytes();
        let written =
            unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written != bytes.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Default for UinputInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl Injector for UinputInjector {
    fn emit(&mut self, ev: &InputEvent) {
        self.track(ev);
        self.buffer.push(*ev);
    }

    fn emit_parts(&mut self, type_: u16, code: u16, value: i32) {
        self.emit(&InputEvent::new(type_, code, value));
    }

    fn flush(&mut self) -> io::Result<()> {
        let events: Vec<InputEvent> = self.buffer.drain(..).collect();
        for ev in &events {
            self.write_event(ev)?;
            if !self.event_delay.is_zero() {
                thread::sleep(self.event_delay);
            }
        }
        Ok(())
    }

    fn up_all(&mut self) {
        let held: Vec<u16> = self.held.clone();
        for code in held {
            self.emit_parts(EV_KEY, code, 0);
        }
    }

    fn set_event_delay(&mut self, micros: u64) {
        self.event_delay = Duration::from_micros(micros);
    }

    fn held_count(&self) -> usize {
        self.held.len()
    }
}

impl Drop for UinputInjector {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            info!("Destroying uinput virtual device");
            unsafe {
                libc::ioctl(fd, UI_DEV_DESTROY);
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injector_starts_uninitialized() {
        let injector = UinputInjector::new();
        assert!(injector.fd.is_none());
        assert_eq!(injector.held_count(), 0);
    }

    #[test]
    fn test_flush_without_device_fails() {
        let mut injector = UinputInjector::new();
        injector.emit_parts(EV_KEY, 30, 1);
        assert!(injector.flush().is_err());
    }

    #[test]
    fn test_held_tracking() {
        let mut injector = UinputInjector::new();
        injector.emit_parts(EV_KEY, 30, 1);
        injector.emit_parts(EV_KEY, 42, 1);
        assert_eq!(injector.held_count(), 2);

        // Repeats do not stack.
        injector.emit_parts(EV_KEY, 30, 2);
        assert_eq!(injector.held_count(), 2);

        injector.emit_parts(EV_KEY, 30, 0);
        assert_eq!(injector.held_count(), 1);

        // Non-key events are not tracked.
        injector.emit_parts(EV_SYN, 0, 0);
        assert_eq!(injector.held_count(), 1);
    }

    #[test]
    fn test_up_all_releases_in_press_order() {
        let mut injector = UinputInjector::new();
        injector.emit_parts(EV_KEY, 30, 1);
        injector.emit_parts(EV_KEY, 42, 1);
        injector.emit_parts(EV_KEY, 56, 1);
        injector.buffer.clear();

        injector.up_all();
        assert_eq!(injector.held_count(), 0);

        let ups: Vec<(u16, i32)> = injector.buffer.iter().map(|ev| (ev.code, ev.value)).collect();
        assert_eq!(ups, vec![(30, 0), (42, 0), (56, 0)]);
    }

    #[test]
    fn test_up_all_twice_is_idempotent() {
        let mut injector = UinputInjector::new();
        injector.emit_parts(EV_KEY, 30, 1);
        injector.buffer.clear();

        injector.up_all();
        assert_eq!(injector.buffer.len(), 1);

        injector.up_all();
        // Nothing held any more, so the second pass adds nothing.
        assert_eq!(injector.buffer.len(), 1);
    }
}
