//! Keywarden Input Daemon - Main Entry Point
//!
//! This is the privileged daemon responsible for:
//! - Exclusively grabbing the physical keyboards
//! - Filtering keystrokes against the passthrough table
//! - Forwarding whitelisted keys to the macro daemon
//! - Re-emitting events through a synthetic uinput device

use keywarden_common::tracing;
use keywardend::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use keywardend::daemon::KbdDaemon;
use keywardend::security;
use std::env;
use std::str::FromStr;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = DaemonConfig::load_or_default(&config_path);

    // Initialize logging
    let level =
        tracing::Level::from_str(&config.daemon.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("Starting keywardend v{}", env!("CARGO_PKG_VERSION"));
    info!("Using configuration: {}", config_path);

    // Device grabbing and uinput setup need root.
    if !security::is_root() {
        error!("keywardend must be started as root for device access");
        return Err("insufficient privileges".into());
    }

    info!("Using socket path: {}", config.daemon.socket_path);
    info!("Using keys directory: {}", config.daemon.keys_dir);

    let mut daemon = KbdDaemon::new(config)?;
    daemon.run()
}
