//! Hierarchical cancellation tree (SPEC_FULL.md SUPPLEMENT: "Cancellation
//! tree"). Coordinator -> MasterActionContext -> Dispatcher each hold a
//! `CancelNode`; cancelling a node cancels its whole subtree, but a fork's
//! siblings (e.g. two concurrent MasterActions, or two NodeActions of the
//! same stage) are unaffected by each other.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelNode {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    parent: Option<Box<CancelNode>>,
}

impl CancelNode {
    pub fn root() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx, parent: None }
    }

    /// A child that inherits cancellation from `self` (and everything
    /// above it) without being able to affect its siblings.
    pub fn fork(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx, parent: Some(Box::new(self.clone())) }
    }

    /// Cancels this node and every descendant forked from it. Does not
    /// affect the parent or sibling forks.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this node or any ancestor is cancelled; resolves
    /// immediately if that is already true.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut own = self.rx.clone();
        let own_cancelled = async {
            while !*own.borrow() {
                if own.changed().await.is_err() {
                    break;
                }
            }
        };
        match &self.parent {
            None => own_cancelled.await,
            Some(parent) => {
                tokio::select! {
                    _ = own_cancelled => {}
                    _ = parent.cancelled() => {}
                }
            }
        }
    }
}

impl Default for CancelNode {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_node_is_not_cancelled() {
        let node = CancelNode::root();
        assert!(!node.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_synchronously() {
        let node = CancelNode::root();
        node.cancel();
        assert!(node.is_cancelled());
    }

    #[test]
    fn forked_children_are_independent_of_siblings() {
        let parent = CancelNode::root();
        let child_a = parent.fork();
        let child_b = parent.fork();

        child_a.cancel();
        assert!(child_a.is_cancelled());
        assert!(!child_b.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn cancelling_parent_cascades_to_children() {
        let parent = CancelNode::root();
        let child = parent.fork();
        let grandchild = child.fork();

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_ancestor_cancel() {
        let parent = CancelNode::root();
        let child = parent.fork();
        let waiter = child.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
