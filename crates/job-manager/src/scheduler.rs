use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limits the number of external tasks running at once across all jobs.
#[derive(Debug, Clone, Default)]
pub struct TaskSlots {
    semaphore: Option<Arc<Semaphore>>,
}

impl TaskSlots {
    /// Create the limiter. `None` allows any number of tasks, leaving the limits to the
    /// underlying task runtime.
    pub fn new(max_concurrent_tasks: Option<usize>) -> Self {
        TaskSlots {
            semaphore: max_concurrent_tasks.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Wait for a free slot. The slot is held until the returned permit is dropped.
    ///
    /// Returns `None` only if the limiter has been closed.
    pub async fn acquire(&self) -> Option<TaskSlot> {
        match &self.semaphore {
            Some(semaphore) => semaphore
                .clone()
                .acquire_owned()
                .await
                .ok()
                .map(|permit| TaskSlot {
                    _permit: Some(permit),
                }),
            None => Some(TaskSlot { _permit: None }),
        }
    }

    /// Stop handing out slots. Tasks waiting for a slot will fail to acquire one.
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }

    /// The number of free slots, or `None` when there is no limit.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}

/// Holds a slot until dropped.
#[derive(Debug)]
pub struct TaskSlot {
    _permit: Option<OwnedSemaphorePermit>,
}
