// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The loader: hook registration, built-in bypass, and the two pipelines.
//!
//! `require` is the blocking pipeline: it never suspends, and fails with
//! [`LoaderError::SyncLoadUnsupported`] when a dependency can only be
//! produced asynchronously. `import` is the suspending pipeline: it may
//! yield at every hook boundary and while awaiting another request's
//! record. Both share one registry, so a module evaluates at most once no
//! matter how many pipelines and requests want it.

use crate::builtins::{BuiltinFactory, BuiltinRegistry};
use crate::config::LoaderOptions;
use crate::error::{LoaderError, Result};
use crate::evaluator::{EvalScope, Evaluator, LinkEvaluator, ModuleImporter};
use crate::hooks::{
    self, LoadHook, LoadRequest, Loaded, Resolution, ResolveHook, ResolveRequest,
};
use crate::registry::{ModuleFormat, ModuleId, ModuleRecord, ModuleRegistry, ModuleState};
use crate::resolver::DefaultResolver;
use crate::scan;
use crate::source::{ContentSource, DefaultLoad, FsSource};
use crate::specifier::{BUILTIN_PREFIX, SpecifierKind, classify};
use crate::value::{Value, json_to_value, publish_into};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Stack of record ids an in-flight request is currently evaluating.
/// Requesting an id already on the stack is a cycle; the requester gets the
/// in-progress record instead of re-entering it.
#[derive(Debug, Clone, Default)]
struct LoadStack(Vec<ModuleId>);

impl LoadStack {
    fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|entry| entry == id)
    }

    fn pushed(&self, id: &str) -> Self {
        let mut entries = self.0.clone();
        entries.push(id.to_string());
        Self(entries)
    }
}

/// Decrements the active-pass counter when a resolution pass ends
struct PassGuard<'a>(&'a AtomicUsize);

impl<'a> PassGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Module resolution and loading engine for one execution context
pub struct Loader {
    options: Arc<LoaderOptions>,
    registry: ModuleRegistry,
    builtins: Arc<BuiltinRegistry>,
    resolve_hooks: RwLock<Vec<Arc<dyn ResolveHook>>>,
    load_hooks: RwLock<Vec<Arc<dyn LoadHook>>>,
    default_resolver: DefaultResolver,
    default_load: DefaultLoad,
    evaluator: Arc<dyn Evaluator>,
    active_passes: AtomicUsize,
    main_module: RwLock<Option<ModuleId>>,
}

impl Loader {
    /// Loader over the local filesystem with the link-only evaluator
    pub fn new() -> Self {
        Self::with_options(LoaderOptions::default())
    }

    /// Loader with custom options, filesystem storage, link-only evaluator
    pub fn with_options(options: LoaderOptions) -> Self {
        let scan_limit = options.scan_limit;
        Self::with_parts(
            options,
            Arc::new(FsSource),
            Arc::new(LinkEvaluator::new(scan_limit)),
        )
    }

    /// Fully custom loader: options, content capability, and evaluator
    pub fn with_parts(
        options: LoaderOptions,
        content: Arc<dyn ContentSource>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        let options = Arc::new(options);
        let builtins = Arc::new(BuiltinRegistry::with_core_modules());
        let default_resolver = DefaultResolver::new(
            Arc::clone(&options),
            Arc::clone(&builtins),
            Arc::clone(&content),
        );
        let default_load = DefaultLoad::new(content);
        Self {
            options,
            registry: ModuleRegistry::new(),
            builtins,
            resolve_hooks: RwLock::new(Vec::new()),
            load_hooks: RwLock::new(Vec::new()),
            default_resolver,
            default_load,
            evaluator,
            active_passes: AtomicUsize::new(0),
            main_module: RwLock::new(None),
        }
    }

    /// The loader's policy
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// The module registry backing both pipelines
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The built-in namespace
    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    /// Mark a canonical id as the main module
    pub fn set_main(&self, id: impl Into<ModuleId>) {
        *self.main_module.write() = Some(id.into());
    }

    /// The main module, if one was set
    pub fn main(&self) -> Option<ModuleId> {
        self.main_module.read().clone()
    }

    /// Whether `id` is the main module
    pub fn is_main(&self, id: &str) -> bool {
        self.main_module.read().as_deref() == Some(id)
    }

    /// Append a resolve hook. Registration is a configuration-phase
    /// operation; doing it while a resolution pass is in flight is reported,
    /// not tolerated.
    pub fn register_resolve_hook(&self, hook: Arc<dyn ResolveHook>) -> Result<()> {
        self.check_registration()?;
        self.resolve_hooks.write().push(hook);
        Ok(())
    }

    /// Append a load hook; same phase rules as resolve hooks
    pub fn register_load_hook(&self, hook: Arc<dyn LoadHook>) -> Result<()> {
        self.check_registration()?;
        self.load_hooks.write().push(hook);
        Ok(())
    }

    /// Register a new built-in module (privileged, one-time per name)
    pub fn register_builtin(&self, name: &str, factory: BuiltinFactory) -> Result<()> {
        self.builtins.register(name, factory)
    }

    fn check_registration(&self) -> Result<()> {
        if self.active_passes.load(Ordering::SeqCst) != 0 {
            return Err(LoaderError::HookProtocolViolation(
                "hooks may not be registered while a resolution pass is in flight".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a specifier without loading it (blocking chain walk)
    pub fn resolve(&self, specifier: &str, parent: Option<&str>) -> Result<Resolution> {
        let _pass = PassGuard::enter(&self.active_passes);
        self.resolve_sync_inner(specifier, parent)
    }

    /// Resolve a specifier without loading it (suspending chain walk)
    pub async fn resolve_async(&self, specifier: &str, parent: Option<&str>) -> Result<Resolution> {
        let _pass = PassGuard::enter(&self.active_passes);
        self.resolve_async_inner(specifier, parent).await
    }

    /// Synchronously resolve, load, and evaluate a module
    pub fn require(&self, specifier: &str, parent: Option<&str>) -> Result<Value> {
        let _pass = PassGuard::enter(&self.active_passes);
        let (_, value) = self.require_with_stack(specifier, parent, &LoadStack::default())?;
        Ok(value)
    }

    /// Asynchronously resolve, load, link, and evaluate a module
    pub async fn import(&self, specifier: &str, parent: Option<&str>) -> Result<Value> {
        let _pass = PassGuard::enter(&self.active_passes);
        let (_, value) = self
            .import_with_stack(
                specifier.to_string(),
                parent.map(String::from),
                LoadStack::default(),
            )
            .await?;
        Ok(value)
    }

    /// [`Loader::import`] bounded by a caller-imposed deadline.
    ///
    /// The loader itself never times a request out; an indefinitely pending
    /// request only becomes observable through constructs like this one.
    pub async fn import_timed(
        &self,
        specifier: &str,
        parent: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.import(specifier, parent)).await {
            Ok(result) => result,
            Err(_) => Err(LoaderError::NeverSettled {
                specifier: specifier.to_string(),
                timeout,
            }),
        }
    }

    /// Built-ins bypass both hook chains: they must stay reachable even
    /// when every registered hook is broken or adversarial.
    fn try_builtin(&self, specifier: &str) -> Result<Option<Resolution>> {
        match classify(specifier)? {
            SpecifierKind::Builtin => {
                let name = &specifier[BUILTIN_PREFIX.len()..];
                if self.builtins.contains(name) {
                    Ok(Some(
                        Resolution::new(
                            format!("{BUILTIN_PREFIX}{name}"),
                            ModuleFormat::Builtin,
                        )
                        .short_circuited(),
                    ))
                } else {
                    Err(LoaderError::not_found(specifier))
                }
            }
            SpecifierKind::Bare if self.builtins.contains(specifier) => Ok(Some(
                Resolution::new(
                    format!("{BUILTIN_PREFIX}{specifier}"),
                    ModuleFormat::Builtin,
                )
                .short_circuited(),
            )),
            _ => Ok(None),
        }
    }

    fn resolve_sync_inner(&self, specifier: &str, parent: Option<&str>) -> Result<Resolution> {
        if let Some(resolution) = self.try_builtin(specifier)? {
            return Ok(resolution);
        }
        let chain = self.resolve_hooks.read().clone();
        hooks::run_resolve_chain_sync(
            &chain,
            &self.default_resolver,
            ResolveRequest::new(specifier, parent),
        )
    }

    async fn resolve_async_inner(
        &self,
        specifier: &str,
        parent: Option<&str>,
    ) -> Result<Resolution> {
        if let Some(resolution) = self.try_builtin(specifier)? {
            return Ok(resolution);
        }
        let chain = self.resolve_hooks.read().clone();
        hooks::run_resolve_chain_async(
            &chain,
            &self.default_resolver,
            ResolveRequest::new(specifier, parent),
        )
        .await
    }

    fn require_with_stack(
        &self,
        specifier: &str,
        parent: Option<&str>,
        stack: &LoadStack,
    ) -> Result<(ModuleId, Value)> {
        let resolution = self.resolve_sync_inner(specifier, parent)?;
        if resolution.format == ModuleFormat::Builtin {
            let value = self.instantiate_builtin(&resolution.id)?;
            return Ok((resolution.id, value));
        }
        if !resolution.format.is_sync_capable() {
            return Err(LoaderError::SyncLoadUnsupported(resolution.id));
        }

        let (record, created) = self
            .registry
            .get_or_create(&resolution.id, resolution.format)?;
        if !created {
            let value = self.join_sync(&record, stack)?;
            return Ok((record.id().to_string(), value));
        }

        match self.drive_sync(&record, resolution, stack) {
            Ok(()) => Ok((record.id().to_string(), record.exports().to_value())),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let shared = self.registry.mark_errored(record.id(), err)?;
                Err(LoaderError::Cached(shared))
            }
        }
    }

    fn import_with_stack<'a>(
        &'a self,
        specifier: String,
        parent: Option<String>,
        stack: LoadStack,
    ) -> BoxFuture<'a, Result<(ModuleId, Value)>> {
        Box::pin(async move {
            let resolution = self
                .resolve_async_inner(&specifier, parent.as_deref())
                .await?;
            if resolution.format == ModuleFormat::Builtin {
                let value = self.instantiate_builtin(&resolution.id)?;
                return Ok((resolution.id, value));
            }

            let (record, created) = self
                .registry
                .get_or_create(&resolution.id, resolution.format)?;
            if !created {
                let value = self.join_async(&record, &stack).await?;
                return Ok((record.id().to_string(), value));
            }

            match self.drive_async(&record, resolution, &stack).await {
                Ok(()) => Ok((record.id().to_string(), record.exports().to_value())),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    let shared = self.registry.mark_errored(record.id(), err)?;
                    Err(LoaderError::Cached(shared))
                }
            }
        })
    }

    /// Join a record someone else owns, without suspending
    fn join_sync(&self, record: &Arc<ModuleRecord>, stack: &LoadStack) -> Result<Value> {
        if stack.contains(record.id()) {
            tracing::debug!("cycle: '{}' observed mid-evaluation", record.id());
            return Ok(record.exports().to_value());
        }
        match record.state() {
            ModuleState::Evaluated => Ok(record.exports().to_value()),
            ModuleState::Errored => Err(LoaderError::Cached(self.sticky_error(record)?)),
            // In flight on a suspending request; blocking this thread until
            // it settles could deadlock the scheduler, so refuse instead.
            _ => Err(LoaderError::SyncLoadUnsupported(record.id().to_string())),
        }
    }

    /// Join a record someone else owns, suspending until it settles
    async fn join_async(&self, record: &Arc<ModuleRecord>, stack: &LoadStack) -> Result<Value> {
        if stack.contains(record.id()) {
            tracing::debug!("cycle: '{}' observed mid-evaluation", record.id());
            return Ok(record.exports().to_value());
        }
        let mut rx = record.watch();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ModuleState::Evaluated => return Ok(record.exports().to_value()),
                ModuleState::Errored => {
                    return Err(LoaderError::Cached(self.sticky_error(record)?));
                }
                _ => {
                    rx.changed().await.map_err(|_| {
                        self.registry.invariant_failure(format!(
                            "module '{}' dropped while being awaited",
                            record.id()
                        ))
                    })?;
                }
            }
        }
    }

    fn sticky_error(&self, record: &ModuleRecord) -> Result<Arc<LoaderError>> {
        record.error().ok_or_else(|| {
            self.registry.invariant_failure(format!(
                "errored module '{}' has no error recorded",
                record.id()
            ))
        })
    }

    fn drive_sync(
        &self,
        record: &Arc<ModuleRecord>,
        resolution: Resolution,
        stack: &LoadStack,
    ) -> Result<()> {
        let id = record.id().to_string();
        self.registry.mark_resolving(&id)?;
        self.registry.mark_loading(&id)?;

        let chain = self.load_hooks.read().clone();
        let loaded =
            hooks::run_load_chain_sync(&chain, &self.default_load, LoadRequest::from(resolution))?;
        if loaded.format != record.format() {
            tracing::debug!("load hook reclassified '{id}' as {}", loaded.format);
            record.set_format(loaded.format);
        }
        if !loaded.format.is_sync_capable() {
            return Err(LoaderError::SyncLoadUnsupported(id));
        }

        self.registry.mark_evaluating(&id)?;
        self.run_evaluator(record, &loaded, stack)?;
        self.registry.mark_evaluated(&id)?;
        Ok(())
    }

    async fn drive_async(
        &self,
        record: &Arc<ModuleRecord>,
        resolution: Resolution,
        stack: &LoadStack,
    ) -> Result<()> {
        let id = record.id().to_string();
        self.registry.mark_resolving(&id)?;
        self.registry.mark_loading(&id)?;

        let chain = self.load_hooks.read().clone();
        let loaded = hooks::run_load_chain_async(
            &chain,
            &self.default_load,
            LoadRequest::from(resolution),
        )
        .await?;
        if loaded.format != record.format() {
            tracing::debug!("load hook reclassified '{id}' as {}", loaded.format);
            record.set_format(loaded.format);
        }

        self.registry.mark_evaluating(&id)?;

        // Import-style sources link static dependencies depth-first in
        // declared order before their own evaluation. A dependency that
        // leads back here is served the in-progress record via the stack.
        if matches!(record.format(), ModuleFormat::Esm | ModuleFormat::DataUrl) {
            let Some(text) = loaded.source.as_str() else {
                return Err(LoaderError::format_mismatch(&id, "source is not valid UTF-8"));
            };
            let imports = scan::scan(text, self.options.scan_limit).imports;
            let child_stack = stack.pushed(&id);
            for dependency in imports {
                let (dep_id, _) = self
                    .import_with_stack(dependency, Some(id.clone()), child_stack.clone())
                    .await?;
                record.add_dependency(dep_id);
            }
        }

        self.run_evaluator(record, &loaded, stack)?;
        self.registry.mark_evaluated(&id)?;
        Ok(())
    }

    /// Invoke the evaluator (or materialize JSON) exactly once per record
    fn run_evaluator(
        &self,
        record: &Arc<ModuleRecord>,
        loaded: &Loaded,
        stack: &LoadStack,
    ) -> Result<()> {
        let id = record.id().to_string();
        match record.format() {
            ModuleFormat::Json => {
                let json: serde_json::Value = serde_json::from_slice(loaded.source.as_bytes())
                    .map_err(|e| {
                        LoaderError::format_mismatch(&id, format!("not valid JSON: {e}"))
                    })?;
                publish_into(record.exports(), json_to_value(&json));
            }
            ModuleFormat::Builtin => {
                return Err(self.registry.invariant_failure(format!(
                    "built-in '{id}' routed through the load pipeline"
                )));
            }
            _ => {
                let importer = RecordImporter {
                    loader: self,
                    record: Arc::clone(record),
                    stack: stack.pushed(&id),
                };
                let scope = EvalScope {
                    id: &id,
                    format: record.format(),
                    source: &loaded.source,
                    exports: record.exports(),
                    importer: &importer,
                };
                self.evaluator.evaluate(scope)?;
            }
        }
        tracing::debug!("evaluated '{id}'");
        Ok(())
    }

    /// Materialize a built-in record. No hooks, no content source; the
    /// factory from the namespace table is the whole pipeline.
    fn instantiate_builtin(&self, id: &str) -> Result<Value> {
        let name = id.strip_prefix(BUILTIN_PREFIX).unwrap_or(id);
        let (record, created) = self.registry.get_or_create(id, ModuleFormat::Builtin)?;
        if created {
            let drive = || -> Result<()> {
                self.registry.mark_resolving(id)?;
                self.registry.mark_loading(id)?;
                self.registry.mark_evaluating(id)?;
                let value = self.builtins.instantiate(name)?;
                publish_into(record.exports(), value);
                self.registry.mark_evaluated(id)?;
                Ok(())
            };
            return match drive() {
                Ok(()) => Ok(record.exports().to_value()),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    let shared = self.registry.mark_errored(id, err)?;
                    Err(LoaderError::Cached(shared))
                }
            };
        }
        match record.state() {
            ModuleState::Evaluated => Ok(record.exports().to_value()),
            ModuleState::Errored => Err(LoaderError::Cached(self.sticky_error(&record)?)),
            // Factories run synchronously, so this window is a concurrent
            // initializer mid-flight on another thread
            _ => Err(LoaderError::SyncLoadUnsupported(id.to_string())),
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

/// Importer handed to the evaluator: pulls dependencies through the
/// blocking pipeline and records the dependency edge
struct RecordImporter<'a> {
    loader: &'a Loader,
    record: Arc<ModuleRecord>,
    stack: LoadStack,
}

impl ModuleImporter for RecordImporter<'_> {
    fn import(&self, specifier: &str) -> Result<Value> {
        let (dep_id, value) =
            self.loader
                .require_with_stack(specifier, Some(self.record.id()), &self.stack)?;
        self.record.add_dependency(dep_id);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{NextLoad, NextResolve};
    use crate::source::SourceText;
    use async_trait::async_trait;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, content: &str) -> PathBuf {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn canonical(path: &Path) -> String {
        path.canonicalize().unwrap().display().to_string()
    }

    struct CountingEvaluator {
        count: AtomicUsize,
        delay: Duration,
    }

    impl CountingEvaluator {
        fn new(delay: Duration) -> Self {
            Self {
                count: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl Evaluator for CountingEvaluator {
        fn evaluate(&self, _scope: EvalScope<'_>) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(())
        }
    }

    #[test]
    fn test_require_relative_file() {
        let dir = TempDir::new().unwrap();
        let entry = write(&dir, "index.js", "");
        let target = write(&dir, "a.js", "module.exports = 1;");

        let loader = Loader::new();
        let value = loader
            .require("./a.js", Some(&entry.display().to_string()))
            .unwrap();
        assert!(matches!(value, Value::Object(_)));

        let record = loader.registry().get(&canonical(&target)).unwrap();
        assert_eq!(record.format(), ModuleFormat::CommonJs);
        assert_eq!(record.state(), ModuleState::Evaluated);
    }

    #[test]
    fn test_require_missing_package() {
        let dir = TempDir::new().unwrap();
        let entry = write(&dir, "index.js", "");

        let loader = Loader::new();
        let err = loader
            .require("pkg", Some(&entry.display().to_string()))
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(spec) if spec == "pkg"));
    }

    #[test]
    fn test_builtin_survives_adversarial_hooks() {
        let loader = Loader::new();
        loader
            .register_resolve_hook(Arc::new(
                |request: ResolveRequest, _next: &NextResolve<'_>| -> Result<Resolution> {
                    Err(LoaderError::load_failed(request.specifier, "adversarial resolver"))
                },
            ))
            .unwrap();
        loader
            .register_load_hook(Arc::new(
                |request: LoadRequest, _next: &NextLoad<'_>| -> Result<Loaded> {
                    Err(LoaderError::load_failed(request.id, "adversarial loader"))
                },
            ))
            .unwrap();

        let value = loader.require("core:time", None).unwrap();
        let exports = value.as_object().unwrap();
        assert!(matches!(
            exports.get("nowMillis"),
            Some(Value::NativeFunction(_))
        ));
        // Bare built-in names take the same bypass
        assert!(loader.require("time", None).is_ok());
    }

    #[test]
    fn test_builtin_redefinition_denied() {
        let loader = Loader::new();
        let err = loader
            .register_builtin("time", Arc::new(|| Value::Undefined))
            .unwrap_err();
        assert!(matches!(err, LoaderError::BuiltinRedefinition(_)));
        loader
            .register_builtin("answers", Arc::new(|| Value::Number(42.0)))
            .unwrap();
        let value = loader.require("core:answers", None).unwrap();
        let exports = value.as_object().unwrap();
        assert!(matches!(exports.get("default"), Some(Value::Number(n)) if n == 42.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_at_most_once_evaluation_under_contention() {
        let dir = TempDir::new().unwrap();
        let target = write(&dir, "hot.js", "module.exports = {};");
        let id = canonical(&target);

        let evaluator = Arc::new(CountingEvaluator::new(Duration::from_millis(20)));
        let loader = Arc::new(Loader::with_parts(
            LoaderOptions::default(),
            Arc::new(FsSource),
            Arc::clone(&evaluator) as Arc<dyn Evaluator>,
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let loader = Arc::clone(&loader);
            let id = id.clone();
            handles.push(tokio::spawn(async move { loader.import(&id, None).await }));
        }

        let mut exports = Vec::new();
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            exports.push(value.as_object().unwrap().clone());
        }

        // Evaluated exactly once; every requester sees the same record
        assert_eq!(evaluator.count.load(Ordering::SeqCst), 1);
        let first = &exports[0];
        for other in &exports[1..] {
            assert!(first.shares_storage(other));
        }
        assert_eq!(loader.registry().len(), 1);
    }

    /// Evaluator that records what a dependency's exports looked like at
    /// the moment it was imported
    struct ProbeEvaluator;

    impl Evaluator for ProbeEvaluator {
        fn evaluate(&self, scope: EvalScope<'_>) -> Result<()> {
            scope.exports.set("early", Value::Boolean(true));
            if let Some(text) = scope.source.as_str() {
                for spec in scan::scan(text, usize::MAX).requires {
                    let value = scope.importer.import(&spec)?;
                    if let Value::Object(dep) = value {
                        let early = dep.get("early").and_then(|v| v.as_bool()).unwrap_or(false);
                        let late = dep.get("late").and_then(|v| v.as_bool()).unwrap_or(false);
                        scope.exports.set(format!("dep_early:{spec}"), Value::Boolean(early));
                        scope.exports.set(format!("dep_late:{spec}"), Value::Boolean(late));
                    }
                }
            }
            scope.exports.set("late", Value::Boolean(true));
            Ok(())
        }
    }

    #[test]
    fn test_cycle_tolerance_observes_partial_exports() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.js", "require('./b.js');");
        let b = write(&dir, "b.js", "require('./a.js');");

        let loader = Loader::with_parts(
            LoaderOptions::default(),
            Arc::new(FsSource),
            Arc::new(ProbeEvaluator),
        );
        loader
            .require(&a.display().to_string(), None)
            .unwrap();

        let a_record = loader.registry().get(&canonical(&a)).unwrap();
        let b_record = loader.registry().get(&canonical(&b)).unwrap();
        assert_eq!(a_record.state(), ModuleState::Evaluated);
        assert_eq!(b_record.state(), ModuleState::Evaluated);

        // b re-entered a mid-evaluation: early was visible, late was not
        let saw_early = b_record.exports().get("dep_early:./a.js").unwrap();
        let saw_late = b_record.exports().get("dep_late:./a.js").unwrap();
        assert_eq!(saw_early.as_bool(), Some(true));
        assert_eq!(saw_late.as_bool(), Some(false));

        // a saw b fully evaluated
        let saw_late = a_record.exports().get("dep_late:./b.js").unwrap();
        assert_eq!(saw_late.as_bool(), Some(true));

        // Dependency edges were recorded as ids
        assert_eq!(a_record.dependencies(), vec![canonical(&b)]);
        assert_eq!(b_record.dependencies(), vec![canonical(&a)]);
    }

    #[tokio::test]
    async fn test_sync_refuses_import_style_modules() {
        let dir = TempDir::new().unwrap();
        write(&dir, "mod.mjs", "export const x = 1;");
        let entry = write(&dir, "index.js", "");
        let parent = entry.display().to_string();

        let loader = Loader::new();
        let err = loader.require("./mod.mjs", Some(&parent)).unwrap_err();
        assert!(matches!(err, LoaderError::SyncLoadUnsupported(_)));

        // The suspending pipeline handles the same module fine
        let value = loader.import("./mod.mjs", Some(&parent)).await.unwrap();
        assert!(matches!(value, Value::Object(_)));
    }

    struct AsyncOnlyResolve;

    #[async_trait]
    impl ResolveHook for AsyncOnlyResolve {
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

    #[tokio::test]
    async fn test_async_only_hook_fails_sync_caller_fast() {
        let dir = TempDir::new().unwrap();
        let entry = write(&dir, "index.js", "");
        write(&dir, "a.js", "module.exports = 1;");
        let parent = entry.display().to_string();

        let loader = Loader::new();
        loader.register_resolve_hook(Arc::new(AsyncOnlyResolve)).unwrap();

        let err = loader.require("./a.js", Some(&parent)).unwrap_err();
        assert!(matches!(err, LoaderError::SyncLoadUnsupported(_)));

        let value = loader.import("./a.js", Some(&parent)).await.unwrap();
        assert!(matches!(value, Value::Object(_)));
    }

    struct FailingEvaluator {
        count: AtomicUsize,
    }

    impl Evaluator for FailingEvaluator {
        fn evaluate(&self, scope: EvalScope<'_>) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Err(LoaderError::load_failed(scope.id, "deliberate failure"))
        }
    }

    #[test]
    fn test_errors_are_cached_not_retried() {
        let dir = TempDir::new().unwrap();
        let target = write(&dir, "bad.js", "module.exports = 1;");
        let id = canonical(&target);

        let evaluator = Arc::new(FailingEvaluator {
            count: AtomicUsize::new(0),
        });
        let loader = Loader::with_parts(
            LoaderOptions::default(),
            Arc::new(FsSource),
            Arc::clone(&evaluator) as Arc<dyn Evaluator>,
        );

        let first = loader.require(&id, None).unwrap_err();
        let second = loader.require(&id, None).unwrap_err();
        assert!(matches!(first.root(), LoaderError::LoadFailed { .. }));
        assert!(matches!(second.root(), LoaderError::LoadFailed { .. }));
        assert_eq!(evaluator.count.load(Ordering::SeqCst), 1);

        let record = loader.registry().get(&id).unwrap();
        assert_eq!(record.state(), ModuleState::Errored);
    }

    #[test]
    fn test_registration_rejected_during_pass() {
        let dir = TempDir::new().unwrap();
        let entry = write(&dir, "index.js", "");
        write(&dir, "a.js", "");

        let loader = Arc::new(Loader::new());
        let inner = Arc::clone(&loader);
        loader
            .register_resolve_hook(Arc::new(
                move |request: ResolveRequest, next: &NextResolve<'_>| {
                    inner.register_load_hook(Arc::new(
                        |request: LoadRequest, next: &NextLoad<'_>| next.call(request),
                    ))?;
                    next.call(request)
                },
            ))
            .unwrap();

        let err = loader
            .require("./a.js", Some(&entry.display().to_string()))
            .unwrap_err();
        assert!(matches!(err.root(), LoaderError::HookProtocolViolation(_)));
    }

    struct PendingResolve;

    #[async_trait]
    impl ResolveHook for PendingResolve {
        fn sync_capable(&self) -> bool {
            false
        }

        async fn resolve_async(
            &self,
            _request: ResolveRequest,
            _next: &NextResolve<'_>,
        ) -> Result<Resolution> {
            futures::future::pending::<()>().await;
            unreachable!("pending future never completes")
        }
    }

    #[tokio::test]
    async fn test_deadline_surfaces_never_settled() {
        let loader = Loader::new();
        loader.register_resolve_hook(Arc::new(PendingResolve)).unwrap();

        let err = loader
            .import_timed("./stuck.js", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::NeverSettled { .. }));
    }

    #[test]
    fn test_json_module_exports() {
        let dir = TempDir::new().unwrap();
        let data = write(&dir, "data.json", r#"{"answer": 42, "name": "tether"}"#);

        let loader = Loader::new();
        let value = loader.require(&data.display().to_string(), None).unwrap();
        let exports = value.as_object().unwrap();
        assert!(matches!(exports.get("answer"), Some(Value::Number(n)) if n == 42.0));
        assert!(exports.get("default").is_some());

        let record = loader.registry().get(&canonical(&data)).unwrap();
        assert_eq!(record.format(), ModuleFormat::Json);
    }

    #[tokio::test]
    async fn test_data_url_import() {
        let loader = Loader::new();
        let specifier = "data:text/javascript,export%20const%20x%3D1";
        let value = loader.import(specifier, None).await.unwrap();
        assert!(matches!(value, Value::Object(_)));

        let record = loader.registry().get(specifier).unwrap();
        assert_eq!(record.format(), ModuleFormat::DataUrl);
        assert_eq!(record.state(), ModuleState::Evaluated);
    }

    #[test]
    fn test_load_hook_can_instrument_source() {
        let dir = TempDir::new().unwrap();
        let target = write(&dir, "a.js", "module.exports = 1;");
        let extra = write(&dir, "extra.js", "module.exports = 2;");
        let target_id = canonical(&target);

        let loader = Loader::new();
        let rewrite_for = target_id.clone();
        loader
            .register_load_hook(Arc::new(
                move |request: LoadRequest, next: &NextLoad<'_>| {
                    let mut loaded = next.call(request.clone())?;
                    if request.id == rewrite_for {
                        loaded.source = SourceText::from("require('./extra.js');");
                    }
                    Ok(loaded)
                },
            ))
            .unwrap();

        loader.require(&target_id, None).unwrap();
        // The injected dependency was pulled in through the importer
        let record = loader.registry().get(&target_id).unwrap();
        assert_eq!(record.dependencies(), vec![canonical(&extra)]);
    }

    #[tokio::test]
    async fn test_static_import_linking_order() {
        let dir = TempDir::new().unwrap();
        let entry = write(
            &dir,
            "entry.mjs",
            "import './one.mjs';\nimport './two.mjs';\nexport const done = 1;",
        );
        let one = write(&dir, "one.mjs", "export const one = 1;");
        let two = write(&dir, "two.mjs", "export const two = 2;");

        let loader = Loader::new();
        loader
            .import(&entry.display().to_string(), None)
            .await
            .unwrap();

        let record = loader.registry().get(&canonical(&entry)).unwrap();
        assert_eq!(record.dependencies(), vec![canonical(&one), canonical(&two)]);
        for id in record.dependencies() {
            assert_eq!(
                loader.registry().get(&id).unwrap().state(),
                ModuleState::Evaluated
            );
        }
    }

    #[tokio::test]
    async fn test_async_cycle_links_without_recursing() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.mjs", "import './b.mjs';\nexport const a = 1;");
        let b = write(&dir, "b.mjs", "import './a.mjs';\nexport const b = 2;");

        let loader = Loader::new();
        loader.import(&a.display().to_string(), None).await.unwrap();

        let a_record = loader.registry().get(&canonical(&a)).unwrap();
        let b_record = loader.registry().get(&canonical(&b)).unwrap();
        assert_eq!(a_record.state(), ModuleState::Evaluated);
        assert_eq!(b_record.state(), ModuleState::Evaluated);
        assert_eq!(a_record.dependencies(), vec![canonical(&b)]);
        assert_eq!(b_record.dependencies(), vec![canonical(&a)]);
    }

    #[test]
    fn test_evict_allows_reevaluation() {
        let dir = TempDir::new().unwrap();
        let target = write(&dir, "a.js", "module.exports = 1;");
        let id = canonical(&target);

        let evaluator = Arc::new(CountingEvaluator::new(Duration::ZERO));
        let loader = Loader::with_parts(
            LoaderOptions::default(),
            Arc::new(FsSource),
            Arc::clone(&evaluator) as Arc<dyn Evaluator>,
        );

        loader.require(&id, None).unwrap();
        loader.require(&id, None).unwrap();
        assert_eq!(evaluator.count.load(Ordering::SeqCst), 1);

        assert!(loader.registry().evict(&id));
        loader.require(&id, None).unwrap();
        assert_eq!(evaluator.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_main_module_tracking() {
        let loader = Loader::new();
        assert!(loader.main().is_none());
        loader.set_main("/srv/app/main.js");
        assert!(loader.is_main("/srv/app/main.js"));
        assert!(!loader.is_main("/srv/app/other.js"));
    }
}
