//! Permission checks and privilege handling.
//!
//! This module handles:
//! - Root/effective-uid checks at startup
//! - Validation of passthrough key files (strict mode and ownership)
//! - Probing hot-plugged `/dev/input` nodes until udev has applied the
//!   expected group and mode

use keywarden_common::tracing;
use nix::unistd::{geteuid, getuid, Gid, Group};
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// How long to wait for udev to fix up a fresh `/dev/input` node.
pub const MAX_PERMISSION_WAIT: Duration = Duration::from_secs(5);

/// Sleep step used while probing a fresh device node.
const PERMISSION_WAIT_STEP: Duration = Duration::from_micros(100);

/// Check if the current process is running as root
pub fn is_root() -> bool {
    getuid().is_root()
}

/// Look up the gid of the `input` group, which owns `/dev/input` nodes.
pub fn input_group_gid() -> Result<Gid, Box<dyn std::error::Error>> {
    let group = Group::from_name("input")?.ok_or("group 'input' not found")?;
    Ok(group.gid)
}

/// A passthrough key file is accepted only when its mode is exactly 0644
/// and it is owned by the daemon's effective user. Anything looser would
/// let another account widen the set of keys exposed to the macro daemon.
pub fn key_file_permissions_ok(meta: &Metadata) -> bool {
    meta.mode() & 0o777 == 0o644 && meta.uid() == geteuid().as_raw()
}

/// Render a mode's permission bits as `rwxr-x---` for log messages.
pub fn describe_mode(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Outcome of probing a hot-plugged device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReadiness {
    /// Character device, group `input`, group read+write.
    Ready,
    /// The path exists but is not a character device.
    NotCharDevice,
    /// The node never reached the expected group/mode within the cap.
    Timeout,
}

/// Decide readiness from one observation of the node. `None` means the
/// node has not settled yet and the caller should keep polling.
pub fn classify_node(
    is_char_device: bool,
    mode: u32,
    gid: u32,
    input_gid: Gid,
) -> Option<DeviceReadiness> {
    if !is_char_device {
        return Some(DeviceReadiness::NotCharDevice);
    }
    let grp_perm = mode & 0o070;
    if gid == input_gid.as_raw() && grp_perm & 0o040 != 0 && grp_perm & 0o020 != 0 {
        return Some(DeviceReadiness::Ready);
    }
    None
}

/// Wait for a fresh `/dev/input` node to become usable.
///
/// Immediately after a hotplug event the node tends to be root:root with
/// restrictive permissions until udev rules run. Poll in 100 µs steps
/// until it is a character device owned by the `input` group with group
/// read+write, capped at [`MAX_PERMISSION_WAIT`].
pub fn wait_device_ready(path: &Path, input_gid: Gid, cap: Duration) -> DeviceReadiness {
    let start = Instant::now();
    loop {
        thread::sleep(PERMISSION_WAIT_STEP);

        if let Ok(meta) = std::fs::metadata(path) {
            match classify_node(
                meta.file_type().is_char_device(),
                meta.mode(),
                meta.gid(),
                input_gid,
            ) {
                Some(DeviceReadiness::NotCharDevice) => {
                    warn!("File {} is not a character device", path.display());
                    return DeviceReadiness::NotCharDevice;
                }
                Some(state) => return state,
                None => {}
            }
        }

        if start.elapsed() > cap {
            return DeviceReadiness::Timeout;
        }
    }
}

/// Readiness probing behind a trait, so the hot-plug watcher can be
/// driven in tests without real device nodes.
pub trait ReadinessProbe: Send {
    fn wait_ready(&self, path: &Path) -> DeviceReadiness;
}

/// Production probe: polls the node until udev has applied the expected
/// group and mode.
pub struct UdevSettleProbe {
    input_gid: Gid,
    cap: Duration,
}

impl UdevSettleProbe {
    pub fn new(input_gid: Gid) -> Self {
        Self {
            input_gid,
            cap: MAX_PERMISSION_WAIT,
        }
    }
}

impl ReadinessProbe for UdevSettleProbe {
    fn wait_ready(&self, path: &Path) -> DeviceReadiness {
        wait_device_ready(path, self.input_gid, self.cap)
    }
}
