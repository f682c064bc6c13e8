//! Supervision for background maintenance work.
//!
//! Cache maintenance (startup clean, size recomputation, auto-shrink) runs
//! off the caller's thread but is never fire-and-forget: every spawned task
//! is tracked, its panic is reported through `tracing`, and owners can
//! drain outstanding work on shutdown or in tests.

use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, error};

#[derive(Debug, Default)]
pub(crate) struct MaintenanceSupervisor {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl MaintenanceSupervisor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawns a named background task. The closure is responsible for
    /// logging its own recoverable failures; panics are reported when the
    /// task is reaped.
    pub(crate) fn spawn(&self, label: &'static str, work: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name(format!("cache-{label}"))
            .spawn(work);

        match handle {
            Ok(handle) => {
                debug!(task = label, "Spawned maintenance task");
                self.reap_finished();
                self.handles.lock().unwrap().push((label, handle));
            }
            Err(err) => {
                error!(task = label, error = %err, "Failed to spawn maintenance task");
            }
        }
    }

    /// Blocks until all outstanding maintenance tasks complete. Panicked
    /// tasks are logged, never propagated.
    pub(crate) fn drain(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for (label, handle) in handles {
            if handle.join().is_err() {
                error!(task = label, "Maintenance task panicked");
            }
        }
    }

    // Drop handles of tasks that already finished so the list stays small.
    fn reap_finished(&self) {
        let mut handles = self.handles.lock().unwrap();
        let mut remaining = Vec::with_capacity(handles.len());
        for (label, handle) in handles.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(task = label, "Maintenance task panicked");
                }
            } else {
                remaining.push((label, handle));
            }
        }
        *handles = remaining;
    }
}

impl Drop for MaintenanceSupervisor {
    fn drop(&mut self) {
        self.drain();
    }
}
