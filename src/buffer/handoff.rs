//! Single-slot hand-off from the audio callback to managed work.
//!
//! The producer calls [`CallbackHandoff::signal`] once per callback; a
//! dedicated worker thread wakes and runs the work closure. Signals that
//! arrive while the worker is busy coalesce into at most one further run;
//! the closure re-reads the latest buffer state, so nothing is lost.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use tracing::debug;

struct Shared {
    pending: AtomicBool,
    stop: AtomicBool,
}

/// One work closure, one worker thread, one pending slot.
pub struct CallbackHandoff {
    shared: Arc<Shared>,
    worker: Thread,
    join: Option<JoinHandle<()>>,
}

impl CallbackHandoff {
    /// Spawn the worker thread that runs `work` once per coalesced signal.
    pub fn spawn(name: &str, mut work: impl FnMut() + Send + 'static) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("handoff worker started");
            loop {
                if worker_shared.stop.load(Ordering::Acquire) {
                    break;
                }
                if worker_shared.pending.swap(false, Ordering::AcqRel) {
                    work();
                } else {
                    // An unpark between the swap and this park leaves a
                    // token behind, so the wake-up cannot be lost.
                    thread::park();
                }
            }
            debug!("handoff worker stopped");
        })?;

        let worker = join.thread().clone();
        Ok(Self {
            shared,
            worker,
            join: Some(join),
        })
    }

    /// Wake the worker. Never blocks, never allocates; safe to call from
    /// the audio callback.
    pub fn signal(&self) {
        self.shared.pending.store(true, Ordering::Release);
        self.worker.unpark();
    }

    /// Stop the worker and wait for it to exit. Idempotent. When called
    /// from the worker thread itself (the work closure dropped the last
    /// owner), the worker is left to unwind on its own instead of joined.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.worker.unpark();
        if let Some(join) = self.join.take() {
            if thread::current().id() != join.thread().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for CallbackHandoff {
    fn drop(&mut self) {
        self.stop();
    }
}
