//! Simple CLI tool to test device grabbing and event reading
//! Usage: cargo run --bin test_grab -- /dev/input/eventX

use keywarden_common::tracing;
use keywarden_common::EV_KEY;
use keywardend::device::{discover_keyboards, Keyboard};
use keywardend::security;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <device_path>", args[0]);
        eprintln!("Example: {} /dev/input/event3", args[0]);
        eprintln!("\nThis tool will:");
        eprintln!("  1. List the keyboards found under /dev/input");
        eprintln!("  2. Grab the specified device exclusively (EVIOCGRAB)");
        eprintln!("  3. Print all key events from that device");
        eprintln!("  4. Press Ctrl+C to exit and ungrab");
        std::process::exit(1);
    }

    let device_path = &args[1];
    info!("Testing device grab for: {}", device_path);

    if !security::is_root() {
        error!("This tool must be run as root for device access");
        error!("Try: sudo cargo run --bin test_grab -- {}", device_path);
        std::process::exit(1);
    }

    let keyboards = discover_keyboards();
    info!("Found {} keyboards:", keyboards.len());
    for path in &keyboards {
        info!("  - {}", path.display());
    }

    let mut kbd = Keyboard::open(device_path)?;
    info!("Grabbing {} @ {} ...", kbd.name(), kbd.phys());
    kbd.lock()?;
    info!("Device grabbed. Events from this device are now intercepted.");
    info!("Press keys on the device - they appear here but NOT in other applications.");
    info!("Press Ctrl+C to exit and release the device.");

    loop {
        let ev = kbd.get()?;
        if ev.type_ == EV_KEY {
            let action = match ev.value {
                0 => "RELEASED",
                1 => "PRESSED",
                _ => "REPEATED",
            };
            info!("Key {} {}", ev.code, action);
        }
    }
}
