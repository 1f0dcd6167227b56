// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Resolve and load hook chains.
//!
//! Hooks compose outward-in: the first registered hook runs first and holds
//! a `next` capability bound to the remainder of the chain, with the default
//! resolver/loader as the innermost link. A hook may short-circuit with its
//! own result, delegate via `next`, or delegate and transform what comes
//! back.
//!
//! The chain protocol is strict. `next` is single-use per invocation, and a
//! hook that answers without calling `next` must acknowledge it by setting
//! `short_circuit`. Both slips report [`LoaderError::HookProtocolViolation`]
//! instead of being papered over.

use crate::error::{LoaderError, Result};
use crate::registry::{ModuleFormat, ModuleId};
use crate::resolver::DefaultResolver;
use crate::source::{DefaultLoad, SourceText};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Input to the resolve chain
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Raw specifier as written by the importer
    pub specifier: String,
    /// Canonical id of the importing module, if any
    pub parent: Option<ModuleId>,
}

impl ResolveRequest {
    /// Build a request
    pub fn new(specifier: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            specifier: specifier.into(),
            parent: parent.map(String::from),
        }
    }
}

/// Output of the resolve chain
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Canonical id, unique per registry
    pub id: ModuleId,
    /// Format the id resolved to
    pub format: ModuleFormat,
    /// Content already produced during resolution (inline sources such as
    /// `data:` URLs); the load chain serves it without re-reading storage
    pub source: Option<SourceText>,
    /// Acknowledgement that remaining links were skipped deliberately
    pub short_circuit: bool,
}

impl Resolution {
    /// Resolution with no inline content
    pub fn new(id: impl Into<ModuleId>, format: ModuleFormat) -> Self {
        Self {
            id: id.into(),
            format,
            source: None,
            short_circuit: false,
        }
    }

    /// Mark the resolution as a deliberate short-circuit
    pub fn short_circuited(mut self) -> Self {
        self.short_circuit = true;
        self
    }

    /// Attach inline content
    pub fn with_source(mut self, source: SourceText) -> Self {
        self.source = Some(source);
        self
    }
}

/// Input to the load chain
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Canonical id to load
    pub id: ModuleId,
    /// Format established by resolution
    pub format: ModuleFormat,
    /// Inline content carried over from resolution, if any
    pub source: Option<SourceText>,
}

impl From<Resolution> for LoadRequest {
    fn from(resolution: Resolution) -> Self {
        Self {
            id: resolution.id,
            format: resolution.format,
            source: resolution.source,
        }
    }
}

/// Output of the load chain
#[derive(Debug, Clone)]
pub struct Loaded {
    /// Format of the content; hooks may reclassify intentionally
    pub format: ModuleFormat,
    /// The module's source content
    pub source: SourceText,
    /// Acknowledgement that remaining links were skipped deliberately
    pub short_circuit: bool,
}

/// A pluggable resolution link.
///
/// Implement `resolve` for hooks usable from both pipelines. Async-only
/// hooks override `resolve_async` and report `sync_capable() == false`;
/// the blocking pipeline then refuses them up front.
#[async_trait]
pub trait ResolveHook: Send + Sync {
    /// Whether the blocking pipeline may invoke this hook
    fn sync_capable(&self) -> bool {
        true
    }

    /// Blocking resolution
    fn resolve(&self, request: ResolveRequest, next: &NextResolve<'_>) -> Result<Resolution> {
        let _ = next;
        Err(LoaderError::SyncLoadUnsupported(request.specifier))
    }

    /// Suspending resolution; defaults to the blocking behavior
    async fn resolve_async(
        &self,
        request: ResolveRequest,
        next: &NextResolve<'_>,
    ) -> Result<Resolution> {
        self.resolve(request, next)
    }
}

impl<F> ResolveHook for F
where
    F: for<'a, 'b> Fn(ResolveRequest, &'a NextResolve<'b>) -> Result<Resolution> + Send + Sync,
{
    fn resolve(&self, request: ResolveRequest, next: &NextResolve<'_>) -> Result<Resolution> {
        self(request, next)
    }
}

/// A pluggable load link; same shape and protocol as [`ResolveHook`]
#[async_trait]
pub trait LoadHook: Send + Sync {
    /// Whether the blocking pipeline may invoke this hook
    fn sync_capable(&self) -> bool {
        true
    }

    /// Blocking load
    fn load(&self, request: LoadRequest, next: &NextLoad<'_>) -> Result<Loaded> {
        let _ = next;
        Err(LoaderError::SyncLoadUnsupported(request.id))
    }

    /// Suspending load; defaults to the blocking behavior
    async fn load_async(&self, request: LoadRequest, next: &NextLoad<'_>) -> Result<Loaded> {
        self.load(request, next)
    }
}

impl<F> LoadHook for F
where
    F: for<'a, 'b> Fn(LoadRequest, &'a NextLoad<'b>) -> Result<Loaded> + Send + Sync,
{
    fn load(&self, request: LoadRequest, next: &NextLoad<'_>) -> Result<Loaded> {
        self(request, next)
    }
}

/// Capability to invoke the remainder of the resolve chain, at most once
pub struct NextResolve<'a> {
    chain: &'a [Arc<dyn ResolveHook>],
    fallback: &'a DefaultResolver,
    calls: AtomicUsize,
}

impl<'a> NextResolve<'a> {
    fn new(chain: &'a [Arc<dyn ResolveHook>], fallback: &'a DefaultResolver) -> Self {
        Self {
            chain,
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    fn consume(&self) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(LoaderError::HookProtocolViolation(
                "resolve hook invoked next() more than once".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the owning hook already delegated
    pub fn invoked(&self) -> bool {
        self.calls.load(Ordering::SeqCst) > 0
    }

    /// Delegate to the rest of the chain, blocking
    pub fn call(&self, request: ResolveRequest) -> Result<Resolution> {
        self.consume()?;
        run_resolve_chain_sync(self.chain, self.fallback, request)
    }

    /// Delegate to the rest of the chain, suspending
    pub async fn call_async(&self, request: ResolveRequest) -> Result<Resolution> {
        self.consume()?;
        run_resolve_chain_async(self.chain, self.fallback, request).await
    }
}

/// Capability to invoke the remainder of the load chain, at most once
pub struct NextLoad<'a> {
    chain: &'a [Arc<dyn LoadHook>],
    fallback: &'a DefaultLoad,
    calls: AtomicUsize,
}

impl<'a> NextLoad<'a> {
    fn new(chain: &'a [Arc<dyn LoadHook>], fallback: &'a DefaultLoad) -> Self {
        Self {
            chain,
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    fn consume(&self) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(LoaderError::HookProtocolViolation(
                "load hook invoked next() more than once".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the owning hook already delegated
    pub fn invoked(&self) -> bool {
        self.calls.load(Ordering::SeqCst) > 0
    }

    /// Delegate to the rest of the chain, blocking
    pub fn call(&self, request: LoadRequest) -> Result<Loaded> {
        self.consume()?;
        run_load_chain_sync(self.chain, self.fallback, request)
    }

    /// Delegate to the rest of the chain, suspending
    pub async fn call_async(&self, request: LoadRequest) -> Result<Loaded> {
        self.consume()?;
        run_load_chain_async(self.chain, self.fallback, request).await
    }
}

pub(crate) fn run_resolve_chain_sync(
    chain: &[Arc<dyn ResolveHook>],
    fallback: &DefaultResolver,
    request: ResolveRequest,
) -> Result<Resolution> {
    match chain.split_first() {
        None => fallback.resolve(&request),
        Some((hook, rest)) => {
            if !hook.sync_capable() {
                return Err(LoaderError::SyncLoadUnsupported(request.specifier));
            }
            let specifier = request.specifier.clone();
            let next = NextResolve::new(rest, fallback);
            let outcome = hook.resolve(request, &next)?;
            check_resolve_protocol(&specifier, &next, &outcome)?;
            Ok(outcome)
        }
    }
}

pub(crate) fn run_resolve_chain_async<'a>(
    chain: &'a [Arc<dyn ResolveHook>],
    fallback: &'a DefaultResolver,
    request: ResolveRequest,
) -> BoxFuture<'a, Result<Resolution>> {
    Box::pin(async move {
        match chain.split_first() {
            None => fallback.resolve(&request),
            Some((hook, rest)) => {
                let specifier = request.specifier.clone();
                let next = NextResolve::new(rest, fallback);
                let outcome = hook.resolve_async(request, &next).await?;
                check_resolve_protocol(&specifier, &next, &outcome)?;
                Ok(outcome)
            }
        }
    })
}

fn check_resolve_protocol(
    specifier: &str,
    next: &NextResolve<'_>,
    outcome: &Resolution,
) -> Result<()> {
    if !next.invoked() && !outcome.short_circuit {
        return Err(LoaderError::HookProtocolViolation(format!(
            "resolve hook answered for '{specifier}' without delegating or acknowledging a short-circuit"
        )));
    }
    Ok(())
}

pub(crate) fn run_load_chain_sync(
    chain: &[Arc<dyn LoadHook>],
    fallback: &DefaultLoad,
    request: LoadRequest,
) -> Result<Loaded> {
    match chain.split_first() {
        None => fallback.load(&request),
        Some((hook, rest)) => {
            if !hook.sync_capable() {
                return Err(LoaderError::SyncLoadUnsupported(request.id));
            }
            let id = request.id.clone();
            let next = NextLoad::new(rest, fallback);
            let outcome = hook.load(request, &next)?;
            check_load_protocol(&id, &next, &outcome)?;
            Ok(outcome)
        }
    }
}

pub(crate) fn run_load_chain_async<'a>(
    chain: &'a [Arc<dyn LoadHook>],
    fallback: &'a DefaultLoad,
    request: LoadRequest,
) -> BoxFuture<'a, Result<Loaded>> {
    Box::pin(async move {
        match chain.split_first() {
            None => fallback.load_async(&request).await,
            Some((hook, rest)) => {
                let id = request.id.clone();
                let next = NextLoad::new(rest, fallback);
                let outcome = hook.load_async(request, &next).await?;
                check_load_protocol(&id, &next, &outcome)?;
                Ok(outcome)
            }
        }
    })
}

fn check_load_protocol(id: &str, next: &NextLoad<'_>, outcome: &Loaded) -> Result<()> {
    if !next.invoked() && !outcome.short_circuit {
        return Err(LoaderError::HookProtocolViolation(format!(
            "load hook answered for '{id}' without delegating or acknowledging a short-circuit"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::BuiltinRegistry;
    use crate::config::LoaderOptions;
    use crate::source::FsSource;
    use parking_lot::Mutex;

    fn default_resolver() -> DefaultResolver {
        DefaultResolver::new(
            Arc::new(LoaderOptions::default()),
            Arc::new(BuiltinRegistry::with_core_modules()),
            Arc::new(FsSource),
        )
    }

    fn run(
        chain: Vec<Arc<dyn ResolveHook>>,
        specifier: &str,
    ) -> Result<Resolution> {
        let fallback = default_resolver();
        run_resolve_chain_sync(&chain, &fallback, ResolveRequest::new(specifier, None))
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let first = move |request: ResolveRequest, next: &NextResolve<'_>| {
            o1.lock().push("first");
            next.call(request)
        };
        let o2 = Arc::clone(&order);
        let second = move |request: ResolveRequest, next: &NextResolve<'_>| {
            o2.lock().push("second");
            let _ = next;
            Ok(Resolution::new("/virtual/answer.js", ModuleFormat::CommonJs).short_circuited())
        };

        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(first), Arc::new(second)];
        let resolution = run(chain, "anything").unwrap();
        assert_eq!(resolution.id, "/virtual/answer.js");
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_short_circuit_skips_default() {
        // The default resolver would fail on this bare name; the hook's
        // short-circuit means it is never consulted.
        let hook = |_request: ResolveRequest, _next: &NextResolve<'_>| {
            Ok(Resolution::new("/virtual/hit.js", ModuleFormat::CommonJs).short_circuited())
        };
        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(hook)];
        let resolution = run(chain, "no-such-package-anywhere").unwrap();
        assert_eq!(resolution.id, "/virtual/hit.js");
    }

    #[test]
    fn test_transforming_delegation() {
        let rewrite = |mut request: ResolveRequest, next: &NextResolve<'_>| {
            request.specifier = "core:time".to_string();
            next.call(request)
        };
        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(rewrite)];
        // The default resolver treats the rewritten specifier as builtin.
        let resolution = run(chain, "time-alias").unwrap();
        assert_eq!(resolution.format, ModuleFormat::Builtin);
    }

    #[test]
    fn test_double_next_is_rejected() {
        let greedy = |request: ResolveRequest, next: &NextResolve<'_>| {
            let _ = next.call(request.clone());
            next.call(request)
        };
        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(greedy)];
        let err = run(chain, "core:time").unwrap_err();
        assert!(matches!(err, LoaderError::HookProtocolViolation(_)));
    }

    #[test]
    fn test_missing_short_circuit_ack_is_rejected() {
        let sloppy = |_request: ResolveRequest, _next: &NextResolve<'_>| {
            Ok(Resolution::new("/virtual/x.js", ModuleFormat::CommonJs))
        };
        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(sloppy)];
        let err = run(chain, "whatever").unwrap_err();
        assert!(matches!(err, LoaderError::HookProtocolViolation(_)));
    }

    #[test]
    fn test_async_only_hook_refused_on_sync_walk() {
        struct AsyncOnly;

        #[async_trait]
        impl ResolveHook for AsyncOnly {
            fn sync_capable(&self) -> bool {
                false
            }

            async fn resolve_async(
                &self,
                request: ResolveRequest,
                next: &NextResolve<'_>,
            ) -> Result<Resolution> {
                next.call_async(request).await
            }
        }

        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(AsyncOnly)];
        let err = run(chain, "./a.js").unwrap_err();
        assert!(matches!(err, LoaderError::SyncLoadUnsupported(_)));
    }

    #[tokio::test]
    async fn test_async_walk_runs_async_only_hook() {
        struct AsyncOnly;

        #[async_trait]
        impl ResolveHook for AsyncOnly {
            fn sync_capable(&self) -> bool {
                false
            }

            async fn resolve_async(
                &self,
                _request: ResolveRequest,
                _next: &NextResolve<'_>,
            ) -> Result<Resolution> {
                Ok(Resolution::new("/virtual/async.js", ModuleFormat::Esm).short_circuited())
            }
        }

        let chain: Vec<Arc<dyn ResolveHook>> = vec![Arc::new(AsyncOnly)];
        let fallback = default_resolver();
        let resolution =
            run_resolve_chain_async(&chain, &fallback, ResolveRequest::new("m", None))
                .await
                .unwrap();
        assert_eq!(resolution.id, "/virtual/async.js");
    }
}
