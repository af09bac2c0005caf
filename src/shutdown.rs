//! Hierarchical cancellation
//!
//! One root `Shutdown` is created by the node; every coordination context
//! gets a child scope. Cancelling a scope cancels all of its descendants,
//! never its parent.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once this scope is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Create a child scope that is cancelled together with this one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        let parent = self.clone();
        let child_tx = Arc::downgrade(&child.tx);
        let mut child_rx = child.tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    if let Some(tx) = child_tx.upgrade() {
                        tx.send_replace(true);
                    }
                }
                // child cancelled on its own, or every handle to it dropped
                _ = child_rx.wait_for(|cancelled| *cancelled) => {}
            }
        });
        child
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let root = Shutdown::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        timeout(Duration::from_secs(1), grandchild.cancelled())
            .await
            .expect("grandchild should observe root cancellation");
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let root = Shutdown::new();
        let child = root.child();
        child.cancel();

        assert!(child.is_cancelled());
        tokio::task::yield_now().await;
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_of_cancelled_scope_starts_cancelled() {
        let root = Shutdown::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }
}
