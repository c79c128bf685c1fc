use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C lets running workers finish and aborts the build; a second
/// one exits immediately.
pub fn install_signal_handler() {
    let installed = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, waiting for running workers...");
    });
    if let Err(e) = installed {
        warn!("failed to install Ctrl-C handler, interrupts will not abort cleanly: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
