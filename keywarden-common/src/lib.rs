//! Wire protocol shared between the keywarden input daemon and the
//! unprivileged macro daemon.
//!
//! The two processes exchange fixed-size `KbdAction` records over a local
//! stream socket. Framing is implicit: each side reads exactly
//! `KbdAction::SIZE` bytes per record. A response stream from the macro
//! daemon is zero or more `done == 0` records followed by exactly one
//! `done == 1` terminator.

use std::fmt;

// Re-export common dependencies
pub use tracing;

/// Default socket path for talking to the macro daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/keywarden/kbd.sock";

/// Default directory holding the passthrough key CSV files.
pub const DEFAULT_KEYS_DIR: &str = "/var/lib/keywarden/keys";

// Linux input event type constants used on both ends of the socket.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_MSC: u16 = 0x04;
pub const SYN_REPORT: u16 = 0x00;

/// One Linux `input_event`, in the kernel's 64-bit wire layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputEvent {
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    /// Byte size of one event record on the wire.
    pub const SIZE: usize = 24;

    /// Build an event with a zeroed timestamp. The injector stamps events
    /// at write time.
    pub fn new(type_: u16, code: u16, value: i32) -> Self {
        Self {
            tv_sec: 0,
            tv_usec: 0,
            type_,
            code,
            value,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.tv_sec.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.tv_usec.to_ne_bytes());
        buf[16..18].copy_from_slice(&self.type_.to_ne_bytes());
        buf[18..20].copy_from_slice(&self.code.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.value.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            tv_sec: i64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            tv_usec: i64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            type_: u16::from_ne_bytes(buf[16..18].try_into().unwrap()),
            code: u16::from_ne_bytes(buf[18..20].try_into().unwrap()),
            value: i32::from_ne_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "type={} code={} value={}",
            self.type_, self.code, self.value
        )
    }
}

/// One request or response record on the keyboard socket.
///
/// Requests from the input daemon always carry `done == 0`. Responses from
/// the macro daemon carry `done == 0` for events to synthesize and
/// `done == 1` to terminate the stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KbdAction {
    pub done: u32,
    pub ev: InputEvent,
}

impl KbdAction {
    /// Byte size of one record on the wire: a `u32`, 4 bytes of C struct
    /// padding, then the 24-byte event.
    pub const SIZE: usize = 32;

    pub fn request(ev: InputEvent) -> Self {
        Self { done: 0, ev }
    }

    pub fn event(ev: InputEvent) -> Self {
        Self { done: 0, ev }
    }

    pub fn terminator() -> Self {
        Self {
            done: 1,
            ev: InputEvent::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.done.to_ne_bytes());
        // bytes 4..8 stay zero: alignment padding before the event
        buf[8..32].copy_from_slice(&self.ev.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let ev: [u8; InputEvent::SIZE] = buf[8..32].try_into().unwrap();
        Self {
            done: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            ev: InputEvent::from_bytes(&ev),
        }
    }
}

// The byte encodings above must match the C struct layout exactly.
const _: () = assert!(std::mem::size_of::<InputEvent>() == InputEvent::SIZE);
const _: () = assert!(std::mem::size_of::<KbdAction>() == KbdAction::SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let ev = InputEvent {
            tv_sec: 1234,
            tv_usec: 5678,
            type_: EV_KEY,
            code: 30,
            value: 1,
        };
        assert_eq!(InputEvent::from_bytes(&ev.to_bytes()), ev);
    }

    #[test]
    fn test_action_roundtrip() {
        let action = KbdAction::request(InputEvent::new(EV_KEY, 42, 1));
        let decoded = KbdAction::from_bytes(&action.to_bytes());
        assert_eq!(decoded, action);
        assert!(!decoded.is_done());

        let done = KbdAction::terminator();
        assert!(KbdAction::from_bytes(&done.to_bytes()).is_done());
    }

    #[test]
    fn test_padding_is_zeroed() {
        let action = KbdAction::terminator();
        let bytes = action.to_bytes();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_layout_matches_kernel_struct() {
        // input_event on 64-bit Linux is 24 bytes; the action record adds a
        // u32 plus alignment padding.
        assert_eq!(std::mem::size_of::<InputEvent>(), 24);
        assert_eq!(std::mem::size_of::<KbdAction>(), 32);
    }
}
