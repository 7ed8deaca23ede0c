use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Write-once slot for a task's outcome. The first `resolve` wins; later
/// calls from racing replies, timers or faults are ignored.
#[derive(Debug)]
pub struct ResultCell<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResultCell<T> {
    #[must_use]
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Returns `true` if this call resolved the cell.
    pub fn resolve(&self, value: T) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // The receiver may be gone already; the cell still counts as resolved.
        let _ = tx.send(value);
        true
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::ResultCell;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (cell, rx) = ResultCell::new();
        assert!(!cell.is_resolved());
        assert!(cell.resolve("reply"));
        assert!(!cell.resolve("timeout"));
        assert!(cell.is_resolved());
        assert_eq!(rx.await.expect("resolved"), "reply");
    }

    #[test]
    fn resolves_without_a_receiver() {
        let (cell, rx) = ResultCell::new();
        drop(rx);
        assert!(cell.resolve(1));
        assert!(!cell.resolve(2));
    }
}
