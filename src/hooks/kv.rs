//! Hooks over binary KV packets.

use std::sync::Arc;
use std::time::Instant;

use super::expect::{Budget, Cancel, Registration, SelfRef, Signal, wait_signal};
use super::{HookError, HookManager, HookResult};
use crate::memd::{Magic, OpCode, Packet};
use crate::services::kv::KvClient;

/// A KV hook: the connection, the packet, when it arrived, and the rest of the chain.
pub type KvHookFn = dyn Fn(&Arc<KvClient>, &Packet, Instant, &mut dyn FnMut() -> HookResult<()>) -> HookResult<()>
    + Send
    + Sync;

/// Chain of KV hooks.
pub type KvHooks = HookManager<KvHookFn>;

type KvPredicate = dyn Fn(&Arc<KvClient>, &Packet) -> bool + Send + Sync;

impl HookManager<KvHookFn> {
    /// Run the chain for one packet. `Pass` means no hook handled it.
    pub fn invoke_packet(&self, client: &Arc<KvClient>, pak: &Packet, start: Instant) -> HookResult<()> {
        self.invoke(&|hook, next| hook(client, pak, start, next))
    }

    /// Start building an expectation on this chain.
    pub fn expect(&self) -> KvExpect {
        KvExpect::new(self.clone())
    }
}

/// Builder for a KV hook that only fires on matching packets.
#[derive(Clone)]
pub struct KvExpect {
    hooks: KvHooks,
    source: Option<Arc<KvClient>>,
    magic: Option<Magic>,
    command: Option<OpCode>,
    opaque: Option<u32>,
    key: Option<Vec<u8>>,
    collection_id: Option<u32>,
    bucket: Option<String>,
    scope: Option<String>,
    collection: Option<String>,
    predicates: Vec<Arc<KvPredicate>>,
    times: Option<usize>,
}

impl KvExpect {
    pub fn new(hooks: KvHooks) -> Self {
        Self {
            hooks,
            source: None,
            magic: None,
            command: None,
            opaque: None,
            key: None,
            collection_id: None,
            bucket: None,
            scope: None,
            collection: None,
            predicates: Vec::new(),
            times: None,
        }
    }

    /// Expect the reply to `pak` on the same connection.
    pub fn reply_to(self, source: &Arc<KvClient>, pak: &Packet) -> Self {
        self.source(source).opaque(pak.opaque)
    }

    pub fn source(mut self, client: &Arc<KvClient>) -> Self {
        self.source = Some(Arc::clone(client));
        self
    }

    pub fn magic(mut self, magic: Magic) -> Self {
        self.magic = Some(magic);
        self
    }

    pub fn cmd(mut self, command: OpCode) -> Self {
        self.command = Some(command);
        self
    }

    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = Some(opaque);
        self
    }

    pub fn key(self, key: &str) -> Self {
        self.key_bytes(key.as_bytes())
    }

    pub fn key_bytes(mut self, key: &[u8]) -> Self {
        self.key = Some(key.to_vec());
        self
    }

    pub fn collection_id(mut self, id: u32) -> Self {
        self.collection_id = Some(id);
        self
    }

    pub fn bucket_name(mut self, name: &str) -> Self {
        self.bucket = Some(name.to_string());
        self
    }

    pub fn scope_name(mut self, name: &str) -> Self {
        self.scope = Some(name.to_string());
        self
    }

    pub fn collection_name(mut self, name: &str) -> Self {
        self.collection = Some(name.to_string());
        self
    }

    /// Add an arbitrary predicate.
    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Arc<KvClient>, &Packet) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Only handle the first `n` matches; later ones fall through.
    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    pub fn matches(&self, client: &Arc<KvClient>, pak: &Packet) -> bool {
        if self.source.as_ref().is_some_and(|s| !Arc::ptr_eq(s, client)) {
            return false;
        }
        if self.magic.is_some_and(|m| m != pak.magic)
            || self.command.is_some_and(|c| c != pak.command)
            || self.opaque.is_some_and(|o| o != pak.opaque)
            || self.collection_id.is_some_and(|c| c != pak.collection_id)
        {
            return false;
        }
        if self.key.as_deref().is_some_and(|k| k != pak.key.as_slice()) {
            return false;
        }
        if let Some(bucket) = &self.bucket {
            if client.selected_bucket_name().as_deref() != Some(bucket.as_str()) {
                return false;
            }
        }
        if self.scope.is_some() || self.collection.is_some() {
            let Some(bucket) = client.selected_bucket() else {
                return false;
            };
            let Some((scope, collection)) = bucket.collections().get_by_id(pak.collection_id) else {
                return false;
            };
            if self.scope.as_ref().is_some_and(|s| *s != scope)
                || self.collection.as_ref().is_some_and(|c| *c != collection)
            {
                return false;
            }
        }
        self.predicates.iter().all(|p| p(client, pak))
    }

    /// Install `handler` for matching packets. Non-matching packets go to
    /// the rest of the chain. A `times(n)` hook leaves the chain after its
    /// `n`th match.
    pub fn handler<F>(self, handler: F) -> Self
    where
        F: Fn(&Arc<KvClient>, &Packet, Instant, &mut dyn FnMut() -> HookResult<()>) -> HookResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.install(handler);
        self
    }

    fn install<F>(&self, handler: F) -> Arc<KvHookFn>
    where
        F: Fn(&Arc<KvClient>, &Packet, Instant, &mut dyn FnMut() -> HookResult<()>) -> HookResult<()>
            + Send
            + Sync
            + 'static,
    {
        let expect = self.clone();
        let budget = Budget::new(self.times);
        let this = SelfRef::new(self.hooks.clone());
        let registered = Arc::clone(&this);
        let hook: Arc<KvHookFn> = Arc::new(
            move |client: &Arc<KvClient>, pak: &Packet, start: Instant, next: &mut dyn FnMut() -> HookResult<()>| {
                if !expect.matches(client, pak) || !budget.take() {
                    return next();
                }
                if budget.is_spent() {
                    registered.unregister();
                }
                handler(client, pak, start, next)
            },
        );
        this.bind(&hook);
        self.hooks.add(Arc::clone(&hook));
        hook
    }

    /// Wait for the next matching packet. The packet still flows through the
    /// rest of the chain. Fails if the hook manager is destroyed or `cancel`
    /// fires first. The hook is removed once the wait is over.
    pub async fn wait(self, cancel: &mut Cancel) -> Result<(Arc<KvClient>, Packet), HookError> {
        let (signal, rx) = Signal::new();
        let on_destroy = Arc::clone(&signal);
        let destroyer: Arc<super::Destroyer> = Arc::new(move || {
            on_destroy.fire(Err(HookError::Destroyed));
        });
        self.hooks.add_destroyer(Arc::clone(&destroyer));
        let hook = self.install(move |client, pak, _, next| {
            let result = next();
            signal.fire(Ok((Arc::clone(client), pak.clone())));
            result
        });
        let _registration = Registration::new(self.hooks.clone(), hook, destroyer);
        wait_signal(rx, cancel).await
    }
}
