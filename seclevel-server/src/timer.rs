//! One-shot timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle of a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Schedules one-shot callbacks on its own threads.
pub trait TimerService: Send + Sync {
    /// Run `callback` once after `delay`.
    fn start_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a timer; a no-op if it already fired.
    fn stop(&self, handle: TimerHandle);
}

/// Timer service running on a tokio runtime.
pub struct TokioTimer {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioTimer {
    /// Timers on the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Timers on the runtime of the calling task. Panics outside a runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl TimerService for TokioTimer {
    fn start_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // hold the map lock across spawn so the task cannot remove itself first
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let armed = tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if armed {
                // handlers block on per-device locks
                let _ = tokio::task::spawn_blocking(callback).await;
            }
        });
        guard.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn stop(&self, handle: TimerHandle) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(task) = task {
            task.abort();
        }
    }
}
