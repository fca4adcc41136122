//! Cooperative shutdown. SIGTERM/SIGINT set a process-wide flag that the
//! coordinator and cell workers poll at safe points: a worker that sees
//! the flag finishes its current chunk append, rewrites `progress.json`
//! atomically, and exits; the coordinator stops spawning, forwards
//! SIGTERM to its workers, and drains them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};

static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

fn flag() -> &'static Arc<AtomicBool> {
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Register the signal handlers. Called once at process start, in both
/// the coordinator and the worker processes.
pub fn install() -> Result<()> {
    signal_hook::flag::register(SIGTERM, Arc::clone(flag()))?;
    signal_hook::flag::register(SIGINT, Arc::clone(flag()))?;
    Ok(())
}

/// Whether a shutdown signal has arrived.
pub fn requested() -> bool {
    flag().load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_clear_until_a_signal_arrives() {
        assert!(!requested());
    }
}
