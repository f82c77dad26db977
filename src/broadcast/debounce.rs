use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Scheduled {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Keyed trailing-edge debouncer.
///
/// Scheduling a task under a key that already has a task waiting aborts the
/// waiting one. A task that has started running is no longer cancellable.
#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    scheduled: Arc<Mutex<HashMap<String, Scheduled>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `task` after the delay unless another task is scheduled under
    /// the same key first
    pub fn schedule<F>(&self, key: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let scheduled = Arc::clone(&self.scheduled);
        let delay = self.delay;
        let task_key = key.clone();

        // Held across spawn so the task cannot look itself up before insertion
        let mut waiting = self.scheduled.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut waiting = scheduled.lock();
                if waiting.get(&task_key).is_some_and(|s| s.generation == generation) {
                    waiting.remove(&task_key);
                }
            }
            task.await;
        });

        if let Some(previous) = waiting.insert(key, Scheduled { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Tasks still waiting for their delay
    pub fn waiting(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub fn cancel_all(&self) {
        for (_, scheduled) in self.scheduled.lock().drain() {
            scheduled.handle.abort();
        }
    }
}
