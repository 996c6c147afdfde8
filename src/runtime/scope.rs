//! Structured task scopes
//!
//! Every device owns a [`DeviceScope`], a child of the hub scope. All
//! long-running work of a device (reactive nodes, FSM loops, guards,
//! timers, binding forwarders) spawns through its scope; cancelling a
//! scope cancels every task spawned in it and in its child scopes.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cancellable group of tasks with parent→child propagation.
#[derive(Clone)]
pub struct DeviceScope {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DeviceScope {
    /// Root scope.
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Child scope; cancelling the parent cancels the child.
    pub fn child(&self) -> DeviceScope {
        let child = DeviceScope::new();
        let child_tx = child.cancel_tx.clone();
        let mut parent_rx = self.cancel_rx.clone();
        if *parent_rx.borrow() {
            let _ = child_tx.send(true);
            return child;
        }
        // the watcher lives in the child so a parent cancel is seen even
        // while the parent's own tasks are being torn down
        child.spawn(async move {
            loop {
                if *parent_rx.borrow() {
                    let _ = child_tx.send(true);
                    break;
                }
                if parent_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        child
    }

    /// Spawn a task bound to this scope. The future is dropped at the
    /// next await point once the scope is cancelled.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut cancelled = self.cancel_rx.clone();
        let handle = tokio::spawn(async move {
            if *cancelled.borrow() {
                return;
            }
            tokio::select! {
                _ = fut => {}
                _ = cancelled.changed() => {}
            }
        });
        self.handles.lock().expect("scope lock poisoned").push(handle);
    }

    /// Cancel every task in this scope and its children.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        let mut handles = self.handles.lock().expect("scope lock poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// A receiver that resolves when the scope is cancelled.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Default for DeviceScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_stops_tasks() {
        let scope = DeviceScope::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        scope.spawn(async move {
            loop {
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        scope.cancel();
        let at_cancel = counter.load(Ordering::SeqCst);
        assert!(at_cancel > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = DeviceScope::new();
        let child = parent.child();
        let flag = Arc::new(AtomicUsize::new(0));
        let seen = flag.clone();
        child.spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            seen.store(1, Ordering::SeqCst);
        });
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(child.is_cancelled() || flag.load(Ordering::SeqCst) == 0);
    }

    #[tokio::test]
    async fn test_spawn_after_cancel_is_inert() {
        let scope = DeviceScope::new();
        scope.cancel();
        let flag = Arc::new(AtomicUsize::new(0));
        let seen = flag.clone();
        scope.spawn(async move {
            seen.store(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flag.load(Ordering::SeqCst), 0);
    }
}
