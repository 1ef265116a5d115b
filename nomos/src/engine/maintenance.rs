/*
 * This file is a part of Nomos
*/

//! The hourly `clearOld` + `pack` sweep (spec §4.6): one dedicated timer
//! thread, ticking every five minutes, that does real work only when a
//! wall-clock hour boundary has actually passed.

use crate::engine::replication::ReplicationLog;
use crate::engine::toplevel::TopLevelIndex;
use crate::registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TICK: Duration = Duration::from_secs(5 * 60);

/// What `HourlyMaintenance` needs from its owner; implemented by
/// `IndexDirectory` so this module doesn't need to know about the directory
/// map or auto-create policy.
pub trait MaintenanceTarget: Send + Sync {
    fn top_levels_snapshot(&self) -> Vec<Arc<TopLevelIndex>>;
    fn replication(&self) -> Option<Arc<ReplicationLog>>;
    fn replication_log_keep_time(&self) -> u64;
}

pub struct HourlyMaintenance {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HourlyMaintenance {
    pub fn start<T: MaintenanceTarget + 'static>(target: Arc<T>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = thread::Builder::new()
            .name("nomos-hourly".into())
            .spawn(move || maintenance_loop(target, stop_clone))
            .expect("spawn hourly maintenance thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn current_hour() -> u64 {
    (registry::wall_clock_seconds() as u64) / 3600
}

fn maintenance_loop<T: MaintenanceTarget>(target: Arc<T>, stop: Arc<AtomicBool>) {
    let mut last_hour = current_hour();
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(TICK);
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let hour = current_hour();
        if hour != last_hour {
            last_hour = hour;
            run_once(&target);
        }
    }
}

// A single thread runs every pass serially, so nothing else ever contends
// for it -- the spec's `hourly_lock` falls out for free here rather than
// needing a separate mutex.
fn run_once<T: MaintenanceTarget>(target: &Arc<T>) {
    let now = registry::wall_clock_seconds();
    for top_level in target.top_levels_snapshot() {
        top_level.clear_old(now);
        if let Err(e) = top_level.pack(now) {
            log::error!("pack failed for top-level '{}': {e}", top_level.name);
        }
    }
    if let Some(repl) = target.replication() {
        repl.sweep_retention(target.replication_log_keep_time(), std::time::SystemTime::now());
    }
}
