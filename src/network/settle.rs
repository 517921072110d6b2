//! Single-resolution guard.
//!
//! Several event handlers race to resolve one pending operation; the first
//! call to [`SettleOnce::settle`] delivers its value, later calls are no-ops.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Clonable handle that resolves a oneshot receiver at most once.
pub struct SettleOnce<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for SettleOnce<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> SettleOnce<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let guard = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (guard, rx)
    }

    /// Deliver `value` if nothing has been delivered yet.
    ///
    /// Returns `true` if this call settled the guard.
    pub fn settle(&self, value: T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}
