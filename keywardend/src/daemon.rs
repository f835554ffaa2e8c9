//! The daemon core: grabs the configured keyboards, multiplexes their
//! events, filters against the passthrough table, drives the macro
//! daemon round trip, and re-emits events through the synthetic device.
//!
//! Three long-lived threads cooperate here: the read loop, the key-file
//! watcher and the `/dev/input` hot-plug watcher. They synchronize
//! through the passthrough, available-set and pulled-set mutexes; no two
//! of those locks are ever held at the same time.

use crate::config::DaemonConfig;
use crate::device::{self, KbdState, Keyboard, KeyboardError};
use crate::fswatch::{FsEvent, FsEventKind, FsWatcher, WatchError};
use crate::injector::{Injector, UinputInjector};
use crate::ipc::{IpcError, PeerChannel};
use crate::passthrough::PassthroughTable;
use crate::security::{self, DeviceReadiness, ReadinessProbe, UdevSettleProbe};
use keywarden_common::tracing;
use keywarden_common::{InputEvent, KbdAction};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on one multiplexed wait, so the read loop periodically
/// re-snapshots the available set and notices re-attached keyboards.
const READ_POLL_TIMEOUT_MS: i32 = 1000;

pub type SharedKeyboard = Arc<Mutex<Keyboard>>;
pub type KeyboardSet = Arc<Mutex<Vec<SharedKeyboard>>>;

/// The keyboard input daemon.
pub struct KbdDaemon {
    config: DaemonConfig,
    passthrough: Arc<Mutex<PassthroughTable>>,
    available: KeyboardSet,
    pulled: KeyboardSet,
    injector: Box<dyn Injector>,
    peer: PeerChannel,
}

impl KbdDaemon {
    /// Build the daemon with its real collaborators: the uinput device
    /// (fatal on failure), the macro daemon socket (waits until the peer
    /// is up) and the configured or discovered keyboards.
    pub fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let mut injector = UinputInjector::new();
        injector
            .initialize()
            .map_err(|e| format!("failed to initialize uinput device: {}", e))?;
        injector.set_event_delay(config.uinput.event_delay_us);

        let recv_timeout = Duration::from_millis(config.peer.recv_timeout_ms);
        let peer = PeerChannel::connect_blocking(&config.daemon.socket_path, recv_timeout);

        let mut daemon = Self::with_parts(
            config,
            Arc::new(Mutex::new(PassthroughTable::new())),
            Box::new(injector),
            peer,
        );

        let paths: Vec<PathBuf> = if daemon.config.devices.paths.is_empty() {
            info!("No devices configured, discovering keyboards");
            device::discover_keyboards()
        } else {
            daemon.config.devices.paths.iter().map(PathBuf::from).collect()
        };
        for path in paths {
            if let Err(e) = daemon.add_device(&path) {
                error!("Unable to open keyboard {}: {}", path.display(), e);
            }
        }

        Ok(daemon)
    }

    /// Build the daemon from explicit collaborators. Lets tests inject a
    /// recording injector and a channel to a mock macro daemon.
    pub fn with_parts(
        config: DaemonConfig,
        passthrough: Arc<Mutex<PassthroughTable>>,
        injector: Box<dyn Injector>,
        peer: PeerChannel,
    ) -> Self {
        Self {
            config,
            passthrough,
            available: Arc::new(Mutex::new(Vec::new())),
            pulled: Arc::new(Mutex::new(Vec::new())),
            injector,
            peer,
        }
    }

    /// Open a keyboard device and add it to the available set.
    pub fn add_device<P: AsRef<Path>>(&mut self, path: P) -> Result<(), KeyboardError> {
        let kbd = Keyboard::open(path)?;
        info!("Added keyboard: {} @ {}", kbd.name(), kbd.phys());
        self.available
            .lock()
            .unwrap()
            .push(Arc::new(Mutex::new(kbd)));
        Ok(())
    }

    /// Grab all keyboards, start the watcher threads and enter the read
    /// loop. Does not return in normal operation; shutdown is process
    /// exit.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        {
            let available = self.available.lock().unwrap();
            for kbd in available.iter() {
                let mut k = kbd.lock().unwrap();
                info!(
                    "Attempting to get lock on device: {} @ {}",
                    k.name(),
                    k.phys()
                );
                if let Err(e) = k.lock() {
                    error!("Unable to lock keyboard {}: {}", k.name(), e);
                    k.disable();
                }
            }
        }
        self.prune_disabled();

        // Seed the passthrough table and watch the keys directory.
        let keys_fsw = FsWatcher::new()?;
        seed_passthrough(&keys_fsw, &self.passthrough, &self.config.daemon.keys_dir)?;
        let _keys_watcher = spawn_keys_watcher(keys_fsw, Arc::clone(&self.passthrough));

        // Watch /dev/input for hot-plugged keyboards. Notifications only:
        // new nodes must never be auto-subscribed.
        let mut input_fsw = FsWatcher::new()?;
        input_fsw.set_watch_dirs(true);
        input_fsw.set_auto_add(false);
        input_fsw.add("/dev/input")?;
        let input_gid = security::input_group_gid()?;
        let _input_watcher = spawn_hotplug_watcher(
            input_fsw,
            Arc::clone(&self.available),
            Arc::clone(&self.pulled),
            Box::new(UdevSettleProbe::new(input_gid)),
        );

        info!("keywardend running");
        loop {
            let kbds: Vec<SharedKeyboard> = self.available.lock().unwrap().clone();
            let fds: Vec<RawFd> = kbds.iter().map(|k| k.lock().unwrap().raw_fd()).collect();

            let idx = match device::multiplex(&fds, READ_POLL_TIMEOUT_MS) {
                Ok(Some(idx)) => idx,
                Ok(None) => continue,
                Err(e) => {
                    error!("Multiplexing across input devices failed: {}", e);
                    continue;
                }
            };

            let kbd = &kbds[idx];
            let mut live_event = None;
            {
                let mut k = kbd.lock().unwrap();
                match k.get() {
                    Ok(ev) => match k.state() {
                        KbdState::Locked => live_event = Some(ev),
                        _ => {
                            // The grab is not in place yet: throw the event
                            // away rather than leak it, then grab now.
                            if let Err(e) = k.lock() {
                                error!("Unable to lock keyboard {}: {}", k.name(), e);
                                k.disable();
                            }
                        }
                    },
                    Err(e) => {
                        error!(
                            "Read error on keyboard {}, assumed to be removed: {}",
                            k.name(),
                            e
                        );
                        k.disable();
                    }
                }
            }

            if kbd.lock().unwrap().state() == KbdState::Disabled {
                self.pull_keyboard(kbd);
                continue;
            }

            let Some(event) = live_event else { continue };
            self.handle_event(event);
        }
    }

    /// Classify one live event and route it either straight to the
    /// synthetic device or through the macro daemon.
    pub fn handle_event(&mut self, ev: InputEvent) {
        let is_passthrough = self.passthrough.lock().unwrap().contains(ev.code);

        if !is_passthrough {
            // Keys outside the passthrough set stay local and low-latency,
            // and are never shown to the macro daemon.
            self.injector.emit(&ev);
            if let Err(e) = self.injector.flush() {
                error!("Failed to write to uinput device: {}", e);
            }
            return;
        }

        if let Err(e) = self.round_trip(&ev) {
            warn!("Macro daemon round trip failed: {}", e);
            self.recover_peer(&ev);
        }
    }

    /// Forward one event to the macro daemon and emit its response
    /// stream. An empty response means the macro daemon captured the
    /// binding and the original key is swallowed.
    fn round_trip(&mut self, ev: &InputEvent) -> Result<(), IpcError> {
        self.peer.send(&KbdAction::request(*ev))?;

        let mut count = 0usize;
        loop {
            let action = self.peer.recv()?;
            if action.is_done() {
                break;
            }
            self.injector.emit(&action.ev);
            count += 1;
        }

        if let Err(e) = self.injector.flush() {
            error!("Failed to write to uinput device: {}", e);
        }
        if count == 0 {
            debug!("Macro daemon swallowed event: {}", ev);
        }
        Ok(())
    }

    /// Recovery after losing the macro daemon mid round-trip: emit the
    /// original keystroke, release every held synthetic key, hand the
    /// keyboards back to the user while reconnecting, then grab them
    /// again.
    fn recover_peer(&mut self, orig: &InputEvent) {
        {
            let available = self.available.lock().unwrap();

            self.injector.emit(orig);
            self.injector.up_all();
            if let Err(e) = self.injector.flush() {
                error!("Failed to write to uinput device: {}", e);
            }
            // A second pass: pacing can drop a release, and a stuck
            // modifier would be worse than a redundant key-up.
            self.injector.up_all();
            if let Err(e) = self.injector.flush() {
                error!("Failed to write to uinput device: {}", e);
            }

            for kbd in available.iter() {
                let mut k = kbd.lock().unwrap();
                info!(
                    "Unlocking keyboard while the macro daemon is down: \"{}\" @ {}",
                    k.name(),
                    k.phys()
                );
                if let Err(e) = k.unlock() {
                    error!("Unable to unlock keyboard {}: {}", k.name(), e);
                    k.disable();
                }
            }

            error!("Unable to communicate with the macro daemon, reconnecting ...");
            self.peer.recon();

            for kbd in available.iter() {
                let mut k = kbd.lock().unwrap();
                if k.state() == KbdState::Disabled {
                    continue;
                }
                if let Err(e) = k.lock() {
                    // Keep going; the failure resurfaces on the next read.
                    error!("Unable to lock keyboard {}: {}", k.name(), e);
                }
            }
        }
        self.prune_disabled();
    }

    /// Move one failed keyboard from the available set to the pulled set,
    /// where the hot-plug watcher will look for it.
    fn pull_keyboard(&self, kbd: &SharedKeyboard) {
        {
            let mut available = self.available.lock().unwrap();
            if let Some(pos) = available.iter().position(|k| Arc::ptr_eq(k, kbd)) {
                available.remove(pos);
            }
        }
        self.pulled.lock().unwrap().push(Arc::clone(kbd));
    }

    /// Move every disabled keyboard out of the available set. The two set
    /// locks are taken one after the other, never nested.
    fn prune_disabled(&self) {
        let disabled: Vec<SharedKeyboard> = {
            let mut available = self.available.lock().unwrap();
            let mut out = Vec::new();
            let mut i = 0;
            while i < available.len() {
                if available[i].lock().unwrap().state() == KbdState::Disabled {
                    out.push(available.remove(i));
                } else {
                    i += 1;
                }
            }
            out
        };
        if !disabled.is_empty() {
            self.pulled.lock().unwrap().extend(disabled);
        }
    }
}

/// Seed the passthrough table from the keys directory. Each loaded
/// file's canonical path is registered with the watcher as well, so a
/// later delete event reports the same path the table keys its
/// contribution on, even when the configured directory is relative or
/// reached through a symlink.
pub fn seed_passthrough<P: AsRef<Path>>(
    watcher: &FsWatcher,
    passthrough: &Arc<Mutex<PassthroughTable>>,
    keys_dir: P,
) -> Result<(), WatchError> {
    let seeded = watcher.add_from(keys_dir)?;
    let mut table = passthrough.lock().unwrap();
    for (path, _meta) in &seeded {
        match table.load_file(path) {
            Ok(canonical) => {
                if canonical != *path {
                    if let Err(e) = watcher.add(&canonical) {
                        warn!(
                            "Unable to watch key file {}: {}",
                            canonical.display(),
                            e
                        );
                    }
                }
            }
            Err(e) => {
                error!("Unable to load key file {}: {}", path.display(), e);
            }
        }
    }
    info!(
        "Passthrough table holds {} keys from {} files",
        table.len(),
        table.source_count()
    );
    Ok(())
}

/// Start the key-file watcher thread. Each create/modify reloads the
/// file into the table; a delete retracts its contribution. Reload
/// errors leave the previous table state standing.
pub fn spawn_keys_watcher(
    watcher: FsWatcher,
    passthrough: Arc<Mutex<PassthroughTable>>,
) -> JoinHandle<()> {
    let handle = watcher.handle();
    watcher.begin(move |ev: FsEvent| {
        let mut table = passthrough.lock().unwrap();
        info!("Key file change on: {}", ev.path.display());
        match ev.kind {
            FsEventKind::Delete => table.unload(&ev.path),
            FsEventKind::Create | FsEventKind::Modify => match table.load_file(&ev.path) {
                Ok(canonical) => {
                    if let Err(e) = handle.add(&canonical) {
                        warn!(
                            "Unable to watch key file {}: {}",
                            canonical.display(),
                            e
                        );
                    }
                }
                Err(e) => {
                    error!("Unable to load key file {}: {}", ev.path.display(), e);
                }
            },
        }
        true
    })
}

/// Start the `/dev/input` hot-plug watcher thread. When a node appears
/// and the probe reports it settled, it is matched against the pulled
/// keyboards by identity and re-attached on a hit.
pub fn spawn_hotplug_watcher(
    watcher: FsWatcher,
    available: KeyboardSet,
    pulled: KeyboardSet,
    probe: Box<dyn ReadinessProbe>,
) -> JoinHandle<()> {
    watcher.begin(move |ev: FsEvent| {
        // Don't react to the directory itself, or to nodes going away.
        if ev.path == Path::new("/dev/input") || ev.kind == FsEventKind::Delete {
            return true;
        }
        if pulled.lock().unwrap().is_empty() {
            return true;
        }

        info!("Input device hotplug event on: {}", ev.path.display());

        match probe.wait_ready(&ev.path) {
            DeviceReadiness::NotCharDevice => return true,
            DeviceReadiness::Timeout => {
                error!(
                    "Could not acquire rw permissions with group input on {}",
                    ev.path.display()
                );
                return true;
            }
            DeviceReadiness::Ready => {}
        }

        let mut reattached = None;
        {
            let mut pulled_set = pulled.lock().unwrap();

            let mut found = None;
            for (i, kbd) in pulled_set.iter().enumerate() {
                let k = kbd.lock().unwrap();
                match k.is_me(&ev.path) {
                    Ok(true) => {
                        found = Some(i);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!("Cannot probe {}: {}", ev.path.display(), e);
                    }
                }
            }

            if let Some(i) = found {
                let kbd = pulled_set.remove(i);
                let ok = {
                    let mut k = kbd.lock().unwrap();
                    match k.reset(&ev.path).and_then(|()| k.lock()) {
                        Ok(()) => {
                            info!("Keyboard was plugged back in: {}", k.name());
                            true
                        }
                        Err(e) => {
                            error!("Unable to re-attach keyboard {}: {}", k.name(), e);
                            k.disable();
                            false
                        }
                    }
                };
                if ok {
                    reattached = Some(kbd);
                } else {
                    pulled_set.push(kbd);
                }
            }
        }
        if let Some(kbd) = reattached {
            available.lock().unwrap().push(kbd);
        }
        true
    })
}
