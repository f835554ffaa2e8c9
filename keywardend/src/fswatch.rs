//! Filesystem watching for key files and `/dev/input`.
//!
//! Thin layer over `notify` that delivers simplified create/modify/delete
//! events to a callback on a dedicated worker thread.

use keywarden_common::tracing;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Simplified event kind delivered to watch callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Modify,
    Delete,
}

/// One filesystem event.
#[derive(Debug)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
    /// Fresh stat of the path; `None` when it no longer exists.
    pub metadata: Option<fs::Metadata>,
}

/// Handle for adding watches after the worker has started, e.g. from
/// inside a watch callback.
#[derive(Clone)]
pub struct WatchHandle {
    watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl WatchHandle {
    pub fn add<P: AsRef<Path>>(&self, path: P) -> Result<(), WatchError> {
        let mut watcher = self.watcher.lock().unwrap();
        watcher.watch(path.as_ref(), RecursiveMode::NonRecursive)?;
        Ok(())
    }
}

/// Watches individual files and directories and hands events to a
/// callback on a worker thread.
pub struct FsWatcher {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    rx: Receiver<notify::Result<notify::Event>>,
    watch_dirs: bool,
    auto_add: bool,
}

impl FsWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, rx) = channel();
        let watcher = notify::recommended_watcher(tx)?;
        Ok(Self {
            watcher: Arc::new(Mutex::new(watcher)),
            rx,
            watch_dirs: false,
            auto_add: true,
        })
    }

    /// Report events for directories themselves instead of skipping them.
    pub fn set_watch_dirs(&mut self, watch_dirs: bool) {
        self.watch_dirs = watch_dirs;
    }

    /// Automatically subscribe files that appear inside watched
    /// directories. Disabled for `/dev/input`, where only notifications
    /// are wanted.
    pub fn set_auto_add(&mut self, auto_add: bool) {
        self.auto_add = auto_add;
    }

    /// Watch a single path.
    pub fn add<P: AsRef<Path>>(&self, path: P) -> Result<(), WatchError> {
        let mut watcher = self.watcher.lock().unwrap();
        watcher.watch(path.as_ref(), RecursiveMode::NonRecursive)?;
        Ok(())
    }

    /// Watch `dir` and every regular file currently inside it. The
    /// directory is canonicalized first, so delivered event paths carry
    /// the canonical directory prefix that consumers key their state on.
    /// Returns the files with their metadata, for seeding initial state.
    pub fn add_from<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<(PathBuf, fs::Metadata)>, WatchError> {
        let dir = fs::canonicalize(dir.as_ref())?;
        self.add(&dir)?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_file() {
                self.add(&path)?;
                files.push((path, meta));
            }
        }
        Ok(files)
    }

    /// Handle for adding watches from a callback.
    pub fn handle(&self) -> WatchHandle {
        WatchHandle {
            watcher: Arc::clone(&self.watcher),
        }
    }

    /// Spawn the worker that delivers events to `callback`. The watcher
    /// lives inside the worker; the callback returning `false` ends the
    /// watch.
    pub fn begin<F>(self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(FsEvent) -> bool + Send + 'static,
    {
        let FsWatcher {
            watcher,
            rx,
            watch_dirs,
            auto_add,
        } = self;

        thread::spawn(move || {
            for result in rx {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Filesystem watch error: {}", e);
                        continue;
                    }
                };

                let kind = match event.kind {
                    notify::EventKind::Create(_) => FsEventKind::Create,
                    notify::EventKind::Modify(_) => FsEventKind::Modify,
                    notify::EventKind::Remove(_) => FsEventKind::Delete,
                    _ => continue,
                };

                for path in event.paths {
                    let metadata = fs::metadata(&path).ok();

                    if !watch_dirs && metadata.as_ref().map_or(false, |m| m.is_dir()) {
                        continue;
                    }

                    if auto_add
                        && kind == FsEventKind::Create
                        && metadata.as_ref().map_or(false, |m| m.is_file())
                    {
                        let mut w = watcher.lock().unwrap();
                        if let Err(e) = w.watch(&path, RecursiveMode::NonRecursive) {
                            warn!("Failed to watch new file {}: {}", path.display(), e);
                        }
                    }

                    if !callback(FsEvent {
                        path,
                        kind,
                        metadata,
                    }) {
                        return;
                    }
                }
            }
        })
    }
}
