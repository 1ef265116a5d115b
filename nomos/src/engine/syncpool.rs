/*
 * This file is a part of Nomos
*/

//! Fixed pool of OS-thread workers that drain dirty top-levels to disk
//! (spec §4.3). Deliberately plain threads + `Condvar`, not tokio tasks --
//! the spec's scheduling model calls these out as a distinct kind of thread
//! from the client I/O workers.

use crate::engine::replication::ReplicationLog;
use crate::engine::toplevel::TopLevelIndex;
use crate::registry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

struct WorkerQueue {
    mutex: Mutex<VecDeque<Arc<TopLevelIndex>>>,
    condvar: Condvar,
}

pub struct SyncWorkerPool {
    queues: Vec<Arc<WorkerQueue>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    stop: Arc<AtomicBool>,
}

impl SyncWorkerPool {
    pub fn start(thread_count: usize, replication: Option<Arc<ReplicationLog>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let count = thread_count.max(1);
        let mut queues = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for idx in 0..count {
            let queue = Arc::new(WorkerQueue {
                mutex: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
            });
            queues.push(queue.clone());
            let stop = stop.clone();
            let replication = replication.clone();
            let handle = thread::Builder::new()
                .name(format!("nomos-sync-{idx}"))
                .spawn(move || worker_loop(queue, stop, replication))
                .expect("spawn sync worker thread");
            handles.push(handle);
        }
        Self {
            queues,
            handles,
            next: AtomicUsize::new(0),
            stop,
        }
    }

    /// Enqueue a top-level on the next worker, round-robin. Cheap: callers
    /// do this after every mutation.
    pub fn enqueue(&self, top_level: Arc<TopLevelIndex>) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let queue = &self.queues[idx];
        queue.mutex.lock().unwrap().push_back(top_level);
        queue.condvar.notify_one();
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for queue in &self.queues {
            queue.condvar.notify_all();
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: Arc<WorkerQueue>, stop: Arc<AtomicBool>, replication: Option<Arc<ReplicationLog>>) {
    loop {
        let batch: Vec<Arc<TopLevelIndex>> = {
            let mut guard = queue.mutex.lock().unwrap();
            while guard.is_empty() && !stop.load(Ordering::SeqCst) {
                guard = queue.condvar.wait(guard).unwrap();
            }
            if guard.is_empty() && stop.load(Ordering::SeqCst) {
                return;
            }
            guard.drain(..).collect()
        };

        let now = registry::wall_clock_seconds();
        for top_level in batch {
            match top_level.sync(now, false, replication.as_deref()) {
                Ok(true) => {}
                Ok(false) => {
                    // Another worker holds this top-level's I/O lock; try
                    // again ourselves rather than block on it.
                    queue.mutex.lock().unwrap().push_back(top_level);
                }
                Err(e) => {
                    log::error!("sync failed for top-level '{}': {e}", top_level.name);
                    registry::poison();
                }
            }
        }
    }
}
