//! Hierarchical cooperative cancellation.
//!
//! A [`CancellationSource`] owns one node of the cancellation tree and hands
//! out cloneable [`CancellationToken`]s that observe it. A node may have any
//! number of parents: it reports cancelled as soon as it or any ancestor is
//! cancelled. Cancellation is pushed down the tree synchronously, so
//! [`CancellationToken::is_cancelled`] is already `true` for every descendant
//! when [`CancellationSource::cancel`] returns. Async waiters parked in
//! [`CancellationToken::cancelled`] wake on their next poll.
//!
//! Disposing a source tears the node down: it is cancelled first, and every
//! later state query on its tokens fails with
//! [`SessionError::InvalidState`]. This separates "alive but cancelled" from
//! "no longer exists".
//!
//! ```
//! use molsync::cancellation::CancellationSource;
//!
//! let connection = CancellationSource::new();
//! let stream = connection.child();
//! let token = stream.token();
//!
//! connection.cancel();
//! assert!(token.is_cancelled().unwrap_or(false));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Notify;

use crate::error::SessionError;

/// The control handle of one cancellation scope.
///
/// Dropping the source does **not** cancel its tokens. Call
/// [`cancel`](Self::cancel) or [`dispose`](Self::dispose) explicitly.
#[derive(Debug)]
pub struct CancellationSource {
    node: Arc<Node>,
}

/// A cloneable observer of a cancellation scope.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    node: Arc<Node>,
}

#[derive(Debug, Default)]
struct Node {
    cancelled: AtomicBool,
    disposed: AtomicBool,
    /// Descendants to cancel along with this node. Guarded together with
    /// the `cancelled` transition so no child can attach after the
    /// children were drained.
    children: Mutex<Vec<Weak<Node>>>,
    notify: Notify,
}

impl Node {
    fn cancel(&self) {
        let children = {
            let mut guard =
                self.children.lock().unwrap_or_else(PoisonError::into_inner);
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    /// Register `child` for cascade. Returns `true` if this node is already
    /// cancelled, in which case the child must start cancelled.
    fn attach(&self, child: &Arc<Self>) -> bool {
        let mut guard =
            self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        guard.retain(|weak| weak.strong_count() > 0);
        guard.push(Arc::downgrade(child));
        false
    }

    fn state(&self) -> Result<bool, SessionError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::InvalidState(
                "cancellation scope has been disposed".into(),
            ));
        }
        Ok(self.cancelled.load(Ordering::Acquire))
    }
}

impl CancellationSource {
    /// Create a root scope with no parents.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node::default()),
        }
    }

    /// Create a scope that is cancelled when any of `parents` is.
    ///
    /// If a parent is already cancelled the new scope starts cancelled.
    #[must_use]
    pub fn with_parents(parents: &[&CancellationToken]) -> Self {
        let node = Arc::new(Node::default());
        let mut inherited = false;
        for parent in parents {
            inherited |= parent.node.attach(&node);
        }
        if inherited {
            node.cancel();
        }
        Self { node }
    }

    /// Create a scope whose only parent is this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parents(&[&self.token()])
    }

    /// Obtain a cloneable token observing this scope.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            node: Arc::clone(&self.node),
        }
    }

    /// Cancel this scope and every scope derived from it. Idempotent.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Cancel, then tear the scope down. Later queries on its tokens fail
    /// with [`SessionError::InvalidState`]. Idempotent.
    pub fn dispose(&self) {
        self.node.cancel();
        self.node.disposed.store(true, Ordering::Release);
        self.node.notify.notify_waiters();
    }

    /// Whether this scope (or an ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> Result<bool, SessionError> {
        self.node.state()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.node.disposed.load(Ordering::Acquire)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Whether cancellation has been requested on this scope or any
    /// ancestor.
    ///
    /// Fails with [`SessionError::InvalidState`] once the owning scope has
    /// been disposed.
    pub fn is_cancelled(&self) -> Result<bool, SessionError> {
        self.node.state()
    }

    /// Infallible check used by running loops: `true` when cancelled or
    /// disposed.
    #[inline]
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// Wait until this scope is cancelled. Returns immediately if it already
    /// is.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.node.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent
            // `notify_waiters` cannot slip between the two.
            let _ = notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Owned variant of [`cancelled`](Self::cancelled) for `'static`
    /// contexts such as spawned tasks and stream adapters.
    pub async fn cancelled_owned(self) {
        self.cancelled().await;
    }

    /// Create a child scope of this token.
    #[must_use]
    pub fn child(&self) -> CancellationSource {
        CancellationSource::with_parents(&[self])
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn token_starts_uncancelled() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled().unwrap());
        assert!(!source.is_cancelled().unwrap());
    }

    #[test]
    fn cancel_cascades_through_descendants() {
        let root = CancellationSource::new();
        let mid = root.child();
        let leaf = mid.child();
        let tokens = [mid.token(), leaf.token(), leaf.token().clone()];

        root.cancel();

        for token in &tokens {
            assert!(token.is_cancelled().unwrap());
        }
    }

    #[test]
    fn any_parent_cancels_child() {
        let a = CancellationSource::new();
        let b = CancellationSource::new();
        let linked = CancellationSource::with_parents(&[&a.token(), &b.token()]);

        b.cancel();

        assert!(linked.token().is_cancelled().unwrap());
        assert!(!a.token().is_cancelled().unwrap());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancellationSource::new();
        let child = root.child();
        child.cancel();
        assert!(child.token().is_cancelled().unwrap());
        assert!(!root.token().is_cancelled().unwrap());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let root = CancellationSource::new();
        root.cancel();
        let child = root.child();
        assert!(child.token().is_cancelled().unwrap());
    }

    #[test]
    fn cancel_is_idempotent() {
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel();
        source.cancel();
        assert!(token.is_cancelled().unwrap());
    }

    #[test]
    fn disposed_scope_rejects_queries() {
        let source = CancellationSource::new();
        let token = source.token();
        source.dispose();

        assert!(source.is_disposed());
        assert!(matches!(
            token.is_cancelled(),
            Err(SessionError::InvalidState(_))
        ));
        assert!(token.is_triggered());
    }

    #[test]
    fn dispose_cancels_children_without_disposing_them() {
        let root = CancellationSource::new();
        let child = root.child();
        root.dispose();
        assert!(child.token().is_cancelled().unwrap());
    }

    #[tokio::test]
    async fn waiter_wakes_on_ancestor_cancel() {
        let root = CancellationSource::new();
        let token = root.child().token();

        let waiter = tokio::spawn(token.cancelled_owned());
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let source = CancellationSource::new();
        source.cancel();
        tokio::time::timeout(Duration::from_millis(50), source.token().cancelled())
            .await
            .unwrap();
    }
}
