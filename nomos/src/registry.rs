/*
 * This file is a part of Nomos
*/

//! Process-wide atomics that don't belong to any one `IndexDirectory`:
//! whether the process is shutting down, and whether a durability-critical
//! background operation has poisoned the process (per spec §7, I/O errors
//! in `sync` are fatal for the process).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static POISONED: AtomicBool = AtomicBool::new(false);

pub fn begin_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Mark the process poisoned: a background sync lost durability. Callers on
/// this path should log and then drive the process towards `exit_flush`
/// and exit, per spec §7's propagation policy.
pub fn poison() {
    POISONED.store(true, Ordering::SeqCst);
}

pub fn is_poisoned() -> bool {
    POISONED.load(Ordering::SeqCst)
}

/// Wall-clock seconds since the epoch, the `now` the engine stamps tags and
/// checks expiry against.
pub fn wall_clock_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_plausible() {
        // anything after 2020-01-01 in epoch seconds
        assert!(wall_clock_seconds() > 1_577_836_800);
    }
}
