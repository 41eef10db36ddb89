//! Plumbing shared by the KV and HTTP expectation builders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use super::{Destroyer, HookError, HookManager};

/// Owner side of a cancellation signal. A test holds one and fires it when it ends.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
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

    pub fn token(&self) -> Cancel {
        Cancel {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Waiter side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancel {
    /// A token that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Resolves once the source is cancelled or dropped.
    pub async fn cancelled(&mut self) {
        match &mut self.rx {
            Some(rx) => {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// One-shot result slot a hook fills in from inside the chain.
pub(crate) struct Signal<T> {
    slot: Mutex<Option<oneshot::Sender<Result<T, HookError>>>>,
}

impl<T> Signal<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Result<T, HookError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                slot: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Deliver a result. Only the first call has any effect.
    pub(crate) fn fire(&self, result: Result<T, HookError>) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

pub(crate) async fn wait_signal<T>(
    rx: oneshot::Receiver<Result<T, HookError>>,
    cancel: &mut Cancel,
) -> Result<T, HookError> {
    tokio::select! {
        result = rx => result.unwrap_or(Err(HookError::Destroyed)),
        _ = cancel.cancelled() => Err(HookError::Cancelled),
    }
}

/// Remaining uses of a `times(n)` expectation. Unlimited when `None`.
#[derive(Debug)]
pub(crate) struct Budget {
    remaining: Option<AtomicUsize>,
}

impl Budget {
    pub(crate) fn new(times: Option<usize>) -> Self {
        Self {
            remaining: times.map(AtomicUsize::new),
        }
    }

    /// Consume one use, returning false once the budget is spent.
    pub(crate) fn take(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }
}

impl Budget {
    /// Whether every use has been consumed. Never true for an unlimited budget.
    pub(crate) fn is_spent(&self) -> bool {
        self.remaining
            .as_ref()
            .is_some_and(|left| left.load(Ordering::SeqCst) == 0)
    }
}

/// Lets a hook find its own registration so it can leave the chain once its
/// budget is spent.
pub(crate) struct SelfRef<H: ?Sized> {
    hooks: HookManager<H>,
    hook: OnceLock<Weak<H>>,
}

impl<H: ?Sized> SelfRef<H> {
    pub(crate) fn new(hooks: HookManager<H>) -> Arc<Self> {
        Arc::new(Self {
            hooks,
            hook: OnceLock::new(),
        })
    }

    pub(crate) fn bind(&self, hook: &Arc<H>) {
        let _ = self.hook.set(Arc::downgrade(hook));
    }

    pub(crate) fn unregister(&self) {
        if let Some(hook) = self.hook.get().and_then(Weak::upgrade) {
            self.hooks.remove(&hook);
        }
    }
}

/// A waiter's hook and destroyer, removed from the chain when dropped.
pub(crate) struct Registration<H: ?Sized> {
    hooks: HookManager<H>,
    hook: Arc<H>,
    destroyer: Arc<Destroyer>,
}

impl<H: ?Sized> Registration<H> {
    pub(crate) fn new(hooks: HookManager<H>, hook: Arc<H>, destroyer: Arc<Destroyer>) -> Self {
        Self {
            hooks,
            hook,
            destroyer,
        }
    }
}

impl<H: ?Sized> Drop for Registration<H> {
    fn drop(&mut self) {
        self.hooks.remove(&self.hook);
        self.hooks.remove_destroyer(&self.destroyer);
    }
}
