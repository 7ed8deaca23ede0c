use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO admission for tasks, bounded by pool size.
///
/// Tokio's semaphore hands out permits in request order, so tasks acquire
/// workers in submission order.
pub(super) struct TaskQueue {
    size: usize,
    slots: Mutex<Arc<Semaphore>>,
}

impl TaskQueue {
    pub(super) fn new(size: usize) -> Self {
        Self {
            size,
            slots: Mutex::new(Arc::new(Semaphore::new(size))),
        }
    }

    /// The semaphore a newly submitted task queues on.
    pub(super) fn slots(&self) -> Arc<Semaphore> {
        self.slots.lock().clone()
    }

    /// Wait for a slot. `None` if the queue was stopped meanwhile.
    pub(super) async fn acquire(slots: Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        slots.acquire_owned().await.ok()
    }

    /// Fail every waiter and start over with an empty queue.
    pub(super) fn rearm(&self) {
        let old = std::mem::replace(&mut *self.slots.lock(), Arc::new(Semaphore::new(self.size)));
        old.close();
    }

    pub(super) fn in_flight(&self) -> usize {
        self.size - self.slots.lock().available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::TaskQueue;

    #[tokio::test]
    async fn rearm_fails_waiters_and_resets() {
        let queue = TaskQueue::new(1);
        let slots = queue.slots();
        let held = TaskQueue::acquire(slots.clone()).await.expect("first slot");
        assert_eq!(queue.in_flight(), 1);

        let waiter = tokio::spawn(TaskQueue::acquire(slots));
        tokio::task::yield_now().await;
        queue.rearm();
        assert!(waiter.await.expect("join").is_none());

        drop(held);
        assert_eq!(queue.in_flight(), 0);
        assert!(TaskQueue::acquire(queue.slots()).await.is_some());
    }
}
