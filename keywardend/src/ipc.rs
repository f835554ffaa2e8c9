//! Stream-socket channel to the unprivileged macro daemon.
//!
//! The daemon is the connecting side. Exactly one request is outstanding
//! at a time; the read loop serializes. Any failure here is handled by
//! the caller's recovery sequence, which ends in `recon`.

use keywarden_common::tracing;
use keywarden_common::KbdAction;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors on the macro daemon socket
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("failed to connect to macro daemon: {0}")]
    Connect(std::io::Error),
    #[error("failed to send action: {0}")]
    Send(std::io::Error),
    #[error("failed to receive action: {0}")]
    Receive(std::io::Error),
    #[error("receive timed out")]
    Timeout,
    #[error("connection closed by macro daemon")]
    Closed,
}

/// Initial delay between reconnection attempts
pub const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the reconnection backoff
pub const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(5);

/// Connection to the macro daemon.
pub struct PeerChannel {
    socket_path: PathBuf,
    stream: UnixStream,
    recv_timeout: Duration,
}

impl PeerChannel {
    /// Connect to the macro daemon socket.
    pub fn connect<P: AsRef<Path>>(path: P, recv_timeout: Duration) -> Result<Self, IpcError> {
        let socket_path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).map_err(IpcError::Connect)?;
        stream
            .set_read_timeout(Some(recv_timeout))
            .map_err(IpcError::Connect)?;
        Ok(Self {
            socket_path,
            stream,
            recv_timeout,
        })
    }

    /// Connect, retrying with backoff until the macro daemon is up. Used
    /// at startup, where the macro daemon may not have been spawned yet.
    pub fn connect_blocking<P: AsRef<Path>>(path: P, recv_timeout: Duration) -> Self {
        let mut delay = RECONNECT_DELAY;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match Self::connect(path.as_ref(), recv_timeout) {
                Ok(channel) => return channel,
                Err(e) => {
                    if attempt == 1 || attempt % 20 == 0 {
                        warn!(
                            "Macro daemon at {} not reachable yet (attempt {}): {}",
                            path.as_ref().display(),
                            attempt,
                            e
                        );
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        }
    }

    pub fn set_recv_timeout(&mut self, recv_timeout: Duration) -> Result<(), IpcError> {
        self.recv_timeout = recv_timeout;
        self.stream
            .set_read_timeout(Some(recv_timeout))
            .map_err(IpcError::Receive)
    }

    /// Write one framed action.
    pub fn send(&mut self, action: &KbdAction) -> Result<(), IpcError> {
        self.stream
            .write_all(&action.to_bytes())
            .map_err(IpcError::Send)
    }

    /// Read one framed action, waiting at most the configured timeout.
    pub fn recv(&mut self) -> Result<KbdAction, IpcError> {
        let mut buf = [0u8; KbdAction::SIZE];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => Ok(KbdAction::from_bytes(&buf)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Err(IpcError::Timeout)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(IpcError::Closed),
            Err(e) => Err(IpcError::Receive(e)),
        }
    }

    /// Tear down and re-establish the connection, backing off until the
    /// macro daemon is reachable again. Keyboards are unlocked while this
    /// runs, so blocking indefinitely is safe for the user.
    pub fn recon(&mut self) {
        let mut delay = RECONNECT_DELAY;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => {
                    if let Err(e) = stream.set_read_timeout(Some(self.recv_timeout)) {
                        warn!("Failed to set receive timeout after reconnect: {}", e);
                    }
                    self.stream = stream;
                    info!(
                        "Reconnected to macro daemon at {} after {} attempt(s)",
                        self.socket_path.display(),
                        attempt
                    );
                    return;
                }
                Err(e) => {
                    if attempt == 1 || attempt % 20 == 0 {
                        warn!(
                            "Macro daemon at {} unreachable (attempt {}): {}",
                            self.socket_path.display(),
                            attempt,
                            e
                        );
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(RECONNECT_DELAY_MAX);
                }
            }
        }
    }
}
