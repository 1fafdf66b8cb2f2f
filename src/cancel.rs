use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hierarchical cancellation signal.
///
/// A child token reports cancelled when it or any ancestor has been cancelled.
/// Cancelling a child never affects its parent, which is what lets a single
/// worker be stopped without stopping its stage.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Node>,
}

#[derive(Debug, Default)]
struct Node {
    cancelled: AtomicBool,
    parent: Option<Arc<Node>>,
}

impl CancellationToken {
    /// Create a new root token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token linked under this one
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancel this token and every token derived from it
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether this token or any ancestor is cancelled
    pub fn is_cancelled(&self) -> bool {
        let mut node = Some(&self.inner);
        while let Some(current) = node {
            if current.cancelled.load(Ordering::Acquire) {
                return true;
            }
            node = current.parent.as_ref();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_sees_parent_cancel() {
        let root = CancellationToken::new();
        let stage = root.child();
        let worker = stage.child();

        root.cancel();
        assert!(stage.is_cancelled());
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let stage = CancellationToken::new();
        let first = stage.child();
        let second = stage.child();

        first.cancel();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!stage.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
