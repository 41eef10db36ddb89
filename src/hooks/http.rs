//! Hooks over HTTP requests.

use std::sync::Arc;

use axum::http::Method;

use super::expect::{Budget, Cancel, Registration, SelfRef, Signal, wait_signal};
use super::pathparse::PathTemplate;
use super::{HookError, HookManager, HookResult};
use crate::services::http::{HttpRequest, HttpResponse, HttpService};

/// An HTTP hook: the receiving service, the request and the rest of the chain.
pub type HttpHookFn = dyn Fn(&Arc<HttpService>, &HttpRequest, &mut dyn FnMut() -> HookResult<HttpResponse>) -> HookResult<HttpResponse>
    + Send
    + Sync;

/// Chain of HTTP hooks.
pub type HttpHooks = HookManager<HttpHookFn>;

type HttpPredicate = dyn Fn(&HttpRequest) -> bool + Send + Sync;

impl HookManager<HttpHookFn> {
    pub fn invoke_request(&self, service: &Arc<HttpService>, req: &HttpRequest) -> HookResult<HttpResponse> {
        self.invoke(&|hook, next| hook(service, req, next))
    }

    pub fn expect(&self) -> HttpExpect {
        HttpExpect::new(self.clone())
    }
}

/// Builder for an HTTP hook that only fires on matching requests.
#[derive(Clone)]
pub struct HttpExpect {
    hooks: HttpHooks,
    method: Option<Method>,
    path: Option<PathTemplate>,
    predicates: Vec<Arc<HttpPredicate>>,
    times: Option<usize>,
}

impl HttpExpect {
    pub fn new(hooks: HttpHooks) -> Self {
        Self {
            hooks,
            method: None,
            path: None,
            predicates: Vec::new(),
            times: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match the path against a glob template (see [`PathTemplate`]).
    pub fn path(mut self, template: &str) -> Self {
        self.path = Some(PathTemplate::new(template));
        self
    }

    /// Require a header to be present with exactly this value.
    pub fn header(self, name: &str, value: &str) -> Self {
        let name = name.to_string();
        let value = value.to_string();
        self.matching(move |req| {
            req.headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == value)
        })
    }

    /// Require the request body to satisfy `check`.
    pub fn body<F>(self, check: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.matching(move |req| check(&req.body))
    }

    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    pub fn matches(&self, req: &HttpRequest) -> bool {
        if self.method.as_ref().is_some_and(|m| *m != req.method) {
            return false;
        }
        if self.path.as_ref().is_some_and(|p| !p.matches(&req.path)) {
            return false;
        }
        self.predicates.iter().all(|p| p(req))
    }

    /// Install `handler` for matching requests. A `times(n)` hook leaves
    /// the chain after its `n`th match.
    pub fn handler<F>(self, handler: F) -> Self
    where
        F: Fn(&Arc<HttpService>, &HttpRequest, &mut dyn FnMut() -> HookResult<HttpResponse>) -> HookResult<HttpResponse>
            + Send
            + Sync
            + 'static,
    {
        self.install(handler);
        self
    }

    fn install<F>(&self, handler: F) -> Arc<HttpHookFn>
    where
        F: Fn(&Arc<HttpService>, &HttpRequest, &mut dyn FnMut() -> HookResult<HttpResponse>) -> HookResult<HttpResponse>
            + Send
            + Sync
            + 'static,
    {
        let expect = self.clone();
        let budget = Budget::new(self.times);
        let this = SelfRef::new(self.hooks.clone());
        let registered = Arc::clone(&this);
        let hook: Arc<HttpHookFn> = Arc::new(
            move |service: &Arc<HttpService>,
                  req: &HttpRequest,
                  next: &mut dyn FnMut() -> HookResult<HttpResponse>| {
                if !expect.matches(req) || !budget.take() {
                    return next();
                }
                if budget.is_spent() {
                    registered.unregister();
                }
                handler(service, req, next)
            },
        );
        this.bind(&hook);
        self.hooks.add(Arc::clone(&hook));
        hook
    }

    /// Wait for the next matching request. The request is still answered by
    /// the rest of the chain, and the hook is removed once the wait is over.
    pub async fn wait(self, cancel: &mut Cancel) -> Result<(Arc<HttpService>, HttpRequest), HookError> {
        let (signal, rx) = Signal::new();
        let on_destroy = Arc::clone(&signal);
        let destroyer: Arc<super::Destroyer> = Arc::new(move || {
            on_destroy.fire(Err(HookError::Destroyed));
        });
        self.hooks.add_destroyer(Arc::clone(&destroyer));
        let hook = self.install(move |service, req, next| {
            let result = next();
            signal.fire(Ok((Arc::clone(service), req.clone())));
            result
        });
        let _registration = Registration::new(self.hooks.clone(), hook, destroyer);
        wait_signal(rx, cancel).await
    }
}
