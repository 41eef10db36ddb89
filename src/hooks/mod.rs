//! Interceptable middleware chains.
//!
//! Every protocol surface dispatches through a [`HookManager`]. Hooks run
//! most-recently-added first; each receives a `next` continuation that runs
//! the older hooks. A hook that returns without calling `next` short-circuits
//! the chain.
//!
//! Managers form a tree: hooks added to a child are also visible to every
//! ancestor, and [`HookManager::destroy`] removes them again and fires the
//! child's destroyers. Tests use this to scope their hooks to their lifetime.

mod expect;
pub mod http;
pub mod kv;
pub mod pathparse;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use expect::{Cancel, CancelSource};
pub use http::{HttpExpect, HttpHookFn, HttpHooks};
pub use kv::{KvExpect, KvHookFn, KvHooks};
pub use pathparse::PathTemplate;

/// Outcome of a hook or of a whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult<R> {
    /// The request was handled, optionally producing a value.
    Handled(R),
    /// Nobody handled the request.
    Pass,
}

impl<R> HookResult<R> {
    pub fn is_handled(&self) -> bool {
        matches!(self, HookResult::Handled(_))
    }

    pub fn handled(self) -> Option<R> {
        match self {
            HookResult::Handled(value) => Some(value),
            HookResult::Pass => None,
        }
    }
}

/// Errors returned by expectation waits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("wait ended due to destroyed hook manager")]
    Destroyed,

    #[error("timeout")]
    Cancelled,
}

pub(crate) type Destroyer = dyn Fn() + Send + Sync;

struct Chain<H: ?Sized> {
    hooks: Vec<Arc<H>>,
    destroyers: Vec<Arc<Destroyer>>,
}

impl<H: ?Sized> Default for Chain<H> {
    fn default() -> Self {
        Self {
            hooks: Vec::new(),
            destroyers: Vec::new(),
        }
    }
}

/// A node in a tree of hook chains. Cloning shares the same node.
pub struct HookManager<H: ?Sized> {
    chain: Arc<Mutex<Chain<H>>>,
    parent: Option<Box<HookManager<H>>>,
}

impl<H: ?Sized> Clone for HookManager<H> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            parent: self.parent.clone(),
        }
    }
}

impl<H: ?Sized> Default for HookManager<H> {
    fn default() -> Self {
        Self {
            chain: Arc::new(Mutex::new(Chain::default())),
            parent: None,
        }
    }
}

impl<H: ?Sized> std::fmt::Debug for HookManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("hooks", &self.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl<H: ?Sized> HookManager<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new manager whose hooks are also visible through `self`.
    pub fn child(&self) -> Self {
        Self {
            chain: Arc::new(Mutex::new(Chain::default())),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Add a hook to the end of the chain, making it the first to run.
    pub fn add(&self, hook: Arc<H>) {
        self.chain.lock().hooks.push(Arc::clone(&hook));
        if let Some(parent) = &self.parent {
            parent.add(hook);
        }
    }

    /// Register a callback that runs when this manager (or an ancestor) is destroyed.
    pub fn add_destroyer(&self, destroyer: Arc<Destroyer>) {
        self.chain.lock().destroyers.push(Arc::clone(&destroyer));
        if let Some(parent) = &self.parent {
            parent.add_destroyer(destroyer);
        }
    }

    /// Remove `hook` from this manager and its ancestors.
    pub(crate) fn remove(&self, hook: &Arc<H>) {
        self.chain.lock().hooks.retain(|h| !Arc::ptr_eq(h, hook));
        if let Some(parent) = &self.parent {
            parent.remove(hook);
        }
    }

    pub(crate) fn remove_destroyer(&self, destroyer: &Arc<Destroyer>) {
        self.chain
            .lock()
            .destroyers
            .retain(|d| !Arc::ptr_eq(d, destroyer));
        if let Some(parent) = &self.parent {
            parent.remove_destroyer(destroyer);
        }
    }

    /// Remove every hook added through this manager from its ancestors and
    /// run its destroyers.
    pub fn destroy(&self) {
        let Chain { hooks, destroyers } = std::mem::take(&mut *self.chain.lock());
        if let Some(parent) = &self.parent {
            for hook in &hooks {
                parent.remove(hook);
            }
            for destroyer in &destroyers {
                parent.remove_destroyer(destroyer);
            }
        }
        for destroyer in destroyers {
            destroyer();
        }
    }

    pub fn len(&self) -> usize {
        self.chain.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the chain newest-first. `call` invokes one hook with the
    /// continuation that runs the remaining, older hooks.
    ///
    /// The chain is copied before running so hooks may add or remove hooks
    /// without deadlocking.
    pub fn invoke<R>(
        &self,
        call: &dyn Fn(&H, &mut dyn FnMut() -> HookResult<R>) -> HookResult<R>,
    ) -> HookResult<R> {
        let hooks = self.chain.lock().hooks.clone();
        walk(&hooks, call)
    }
}

fn walk<H: ?Sized, R>(
    hooks: &[Arc<H>],
    call: &dyn Fn(&H, &mut dyn FnMut() -> HookResult<R>) -> HookResult<R>,
) -> HookResult<R> {
    match hooks.split_last() {
        None => HookResult::Pass,
        Some((newest, older)) => {
            let mut next = || walk(older, call);
            call(newest, &mut next)
        }
    }
}
