//! The one process-global piece of mutable state in this codebase: whether
//! the current invocation has been asked to cancel. A signal handler thread
//! flips the flag; every suspension point named in the concurrency model
//! (file-loop boundaries, per-page in the file differ, per-chunk in the
//! CRC/compression stream, restore inner loops) polls it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Spawn the background thread that listens for termination signals and
/// raises the interrupt flag. Call once from `main`.
pub fn install_handler() -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            tracing::warn!("received signal {sig}, will stop at the next safe point");
            request();
        }
    });
    Ok(())
}

pub fn request() {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn is_requested() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Reset the flag. Only meaningful in tests, where a process is never
/// actually signaled and several scenarios run in the same binary.
pub fn reset_for_test() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}
