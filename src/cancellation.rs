//! Cancellation tokens for lifecycle operations.
//!
//! A [`CancellationToken`] is passed to every orchestrator entry point. When
//! it fires, in-flight lifecycle calls are abandoned at their next await
//! point, backoff sleeps end early and no further batches start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Cloneable cancellation signal with parent/child propagation.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::CancellationToken;
///
/// let parent = CancellationToken::new();
/// let child = parent.child_token();
///
/// parent.cancel();
/// assert!(child.is_cancelled());
/// ```
///
/// Racing an operation against cancellation:
///
/// ```rust
/// use ferrous_conductor::CancellationToken;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let token = CancellationToken::new();
/// token.cancel();
/// tokio::select! {
///     _ = tokio::time::sleep(Duration::from_secs(60)) => unreachable!(),
///     _ = token.cancelled() => {}
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn new(cancelled: bool) -> Self {
        Self {
            cancelled: AtomicBool::new(cancelled),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new(false)),
        }
    }

    /// A token that is cancelled when this one is, but can also be cancelled
    /// on its own without affecting the parent.
    pub fn child_token(&self) -> Self {
        let mut children = self.inner.children.lock();
        let child = Arc::new(TokenInner::new(self.is_cancelled()));
        if !self.is_cancelled() {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        Self { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// A child token that cancels itself after `timeout`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child_token();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        child
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
