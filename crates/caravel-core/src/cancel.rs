use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

// ---------------------------------------------------------------------------
// CancelToken — cooperative cancellation for the object → slab → sector chain
// ---------------------------------------------------------------------------

/// Hierarchical cancellation token.
///
/// Canceling a token cancels every token derived from it via [`child`].
/// Cancellation is observable two ways: by polling [`is_canceled`], and by
/// selecting on [`done`], a channel that closes (all receives fail) the
/// moment the token is canceled. No value is ever sent on the channel; the
/// close itself is the signal.
///
/// [`child`]: CancelToken::child
/// [`is_canceled`]: CancelToken::is_canceled
/// [`done`]: CancelToken::done
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    canceled: AtomicBool,
    closed: Receiver<()>,
    guard: Mutex<Option<Sender<()>>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                closed: rx,
                guard: Mutex::new(Some(tx)),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derive a child token. The child is canceled when the parent is
    /// canceled, but canceling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        {
            let mut children = self.lock_children();
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // The parent may have been canceled while we registered.
        if self.is_canceled() {
            child.cancel();
        }
        child
    }

    /// Derive a child token that cancels itself after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let watchdog = child.clone();
        std::thread::spawn(move || {
            crossbeam_channel::select! {
                recv(watchdog.done()) -> _ => {}
                recv(crossbeam_channel::after(timeout)) -> _ => watchdog.cancel(),
            }
        });
        child
    }

    /// Cancel this token and all of its descendants. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.inner.guard.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        let children: Vec<Weak<Inner>> = self.lock_children().drain(..).collect();
        for weak in children {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel();
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Channel for `select!`: every receive fails once the token is canceled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.closed
    }

    /// Guard that cancels the token when dropped.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Inner>>> {
        match self.inner.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels the wrapped token on drop. Used to tie in-flight work to a scope.
pub struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
