// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module registry: one record per canonical id, owning the at-most-once
//! evaluation guarantee and cycle tolerance.
//!
//! Records live in an arena keyed by canonical id. Dependency edges are
//! stored as ids, never as owning pointers, so cyclic graphs cannot leak.
//! Records move through their states monotonically; the first broken
//! transition poisons the whole registry.

use crate::error::{LoaderError, Result};
use crate::value::ExportsObject;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Canonical resolved identity of a module, unique per registry
pub type ModuleId = String;

/// What kind of content a module record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// Privileged module from the built-in namespace
    Builtin,
    /// Synchronous require-style source
    CommonJs,
    /// Asynchronous import-style source
    Esm,
    /// Parsed JSON value
    Json,
    /// Inline `data:` URL source (import-style semantics)
    DataUrl,
    /// Native addon payload
    Addon,
}

impl ModuleFormat {
    /// Whether the blocking pipeline may produce this format
    pub fn is_sync_capable(&self) -> bool {
        matches!(
            self,
            ModuleFormat::Builtin | ModuleFormat::CommonJs | ModuleFormat::Json | ModuleFormat::Addon
        )
    }
}

impl fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModuleFormat::Builtin => "builtin",
            ModuleFormat::CommonJs => "commonjs",
            ModuleFormat::Esm => "module",
            ModuleFormat::Json => "json",
            ModuleFormat::DataUrl => "data-url",
            ModuleFormat::Addon => "addon",
        };
        f.write_str(label)
    }
}

/// Lifecycle state of a module record.
///
/// Transitions only move forward, except that `Errored` is reachable from
/// any non-terminal state. `Evaluated` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Record exists but its pipeline has not started
    Uninitialized,
    /// Resolution bookkeeping for this record is being finalized
    Resolving,
    /// Content is being produced by the load chain
    Loading,
    /// The evaluator is running (or dependencies are being linked)
    Evaluating,
    /// Evaluation finished; exports are final from the registry's view
    Evaluated,
    /// Pipeline failed; the error is sticky
    Errored,
}

impl ModuleState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Evaluated | ModuleState::Errored)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModuleState::Uninitialized => "uninitialized",
            ModuleState::Resolving => "resolving",
            ModuleState::Loading => "loading",
            ModuleState::Evaluating => "evaluating",
            ModuleState::Evaluated => "evaluated",
            ModuleState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// One module's identity, state, exports, and dependency edges
pub struct ModuleRecord {
    id: ModuleId,
    format: Mutex<ModuleFormat>,
    state: Mutex<ModuleState>,
    exports: ExportsObject,
    dependencies: Mutex<Vec<ModuleId>>,
    error: OnceLock<Arc<LoaderError>>,
    state_tx: watch::Sender<ModuleState>,
}

impl ModuleRecord {
    fn new(id: &str, format: ModuleFormat) -> Self {
        let (state_tx, _) = watch::channel(ModuleState::Uninitialized);
        Self {
            id: id.to_string(),
            format: Mutex::new(format),
            state: Mutex::new(ModuleState::Uninitialized),
            exports: ExportsObject::new(),
            dependencies: Mutex::new(Vec::new()),
            error: OnceLock::new(),
            state_tx,
        }
    }

    /// Canonical id this record is cached under
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current format tag
    pub fn format(&self) -> ModuleFormat {
        *self.format.lock()
    }

    /// Reclassification by a load hook, before evaluation starts
    pub(crate) fn set_format(&self, format: ModuleFormat) {
        *self.format.lock() = format;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    /// Whether the record reached `Evaluated` or `Errored`
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The exports object, shared with every importer.
    ///
    /// Published before evaluation completes: a cyclic importer sees the
    /// exports in whatever shape they currently have.
    pub fn exports(&self) -> &ExportsObject {
        &self.exports
    }

    /// Dependency edges in declaration order
    pub fn dependencies(&self) -> Vec<ModuleId> {
        self.dependencies.lock().clone()
    }

    /// Record a dependency edge (duplicates collapse)
    pub(crate) fn add_dependency(&self, id: ModuleId) {
        let mut deps = self.dependencies.lock();
        if !deps.contains(&id) {
            deps.push(id);
        }
    }

    /// The sticky failure, once the record errored
    pub fn error(&self) -> Option<Arc<LoaderError>> {
        self.error.get().cloned()
    }

    /// Subscribe to state transitions
    pub fn watch(&self) -> watch::Receiver<ModuleState> {
        self.state_tx.subscribe()
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("format", &self.format())
            .field("state", &self.state())
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

/// Arena of module records, one per canonical id
pub struct ModuleRegistry {
    records: DashMap<ModuleId, Arc<ModuleRecord>>,
    poisoned: AtomicBool,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            poisoned: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(LoaderError::InternalConsistency(
                "registry was poisoned by an earlier invariant violation".to_string(),
            ));
        }
        Ok(())
    }

    /// Poison the registry and produce the fatal error
    pub(crate) fn invariant_failure(&self, message: impl Into<String>) -> LoaderError {
        let message = message.into();
        self.poisoned.store(true, Ordering::SeqCst);
        tracing::error!("module registry invariant violated: {message}");
        LoaderError::InternalConsistency(message)
    }

    /// Fetch a record without creating it
    pub fn get(&self, id: &str) -> Option<Arc<ModuleRecord>> {
        self.records.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Fetch or create the record for `id`.
    ///
    /// Atomic with respect to concurrent requests for the same id: exactly
    /// one caller observes `created == true` and owns the record's pipeline;
    /// everyone else joins the existing record.
    pub fn get_or_create(&self, id: &str, format: ModuleFormat) -> Result<(Arc<ModuleRecord>, bool)> {
        self.guard()?;
        match self.records.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                tracing::debug!("registry: new record for '{id}' ({format})");
                let record = Arc::new(ModuleRecord::new(id, format));
                entry.insert(Arc::clone(&record));
                Ok((record, true))
            }
        }
    }

    fn advance(&self, id: &str, to: ModuleState, legal_from: &[ModuleState]) -> Result<()> {
        self.guard()?;
        let Some(record) = self.get(id) else {
            return Err(self.invariant_failure(format!(
                "transition to {to} requested for unknown module '{id}'"
            )));
        };
        let mut state = record.state.lock();
        if !legal_from.contains(&*state) {
            let current = *state;
            drop(state);
            return Err(self.invariant_failure(format!(
                "illegal transition for '{id}': {current} -> {to}"
            )));
        }
        tracing::trace!("registry: '{id}' {} -> {to}", *state);
        *state = to;
        drop(state);
        record.state_tx.send_replace(to);
        Ok(())
    }

    /// Mark a record as finalizing its resolution
    pub fn mark_resolving(&self, id: &str) -> Result<()> {
        self.advance(id, ModuleState::Resolving, &[ModuleState::Uninitialized])
    }

    /// Mark a record as producing content
    pub fn mark_loading(&self, id: &str) -> Result<()> {
        self.advance(
            id,
            ModuleState::Loading,
            &[ModuleState::Uninitialized, ModuleState::Resolving],
        )
    }

    /// Mark a record as linking/evaluating
    pub fn mark_evaluating(&self, id: &str) -> Result<()> {
        self.advance(id, ModuleState::Evaluating, &[ModuleState::Loading])
    }

    /// Mark a record as successfully evaluated
    pub fn mark_evaluated(&self, id: &str) -> Result<()> {
        self.advance(id, ModuleState::Evaluated, &[ModuleState::Evaluating])
    }

    /// Mark a record as failed. The error becomes sticky: every current and
    /// future requester of this id receives it.
    pub fn mark_errored(&self, id: &str, error: LoaderError) -> Result<Arc<LoaderError>> {
        self.guard()?;
        let Some(record) = self.get(id) else {
            return Err(self.invariant_failure(format!(
                "error recorded for unknown module '{id}'"
            )));
        };
        let shared = Arc::new(error);
        if record.error.set(Arc::clone(&shared)).is_err() {
            return Err(self.invariant_failure(format!(
                "module '{id}' errored twice"
            )));
        }
        self.advance(
            id,
            ModuleState::Errored,
            &[
                ModuleState::Uninitialized,
                ModuleState::Resolving,
                ModuleState::Loading,
                ModuleState::Evaluating,
            ],
        )?;
        Ok(shared)
    }

    /// Drop a terminal record from the cache. Records still in flight are
    /// kept; evicting them would break the at-most-once guarantee.
    pub fn evict(&self, id: &str) -> bool {
        match self.get(id) {
            Some(record) if record.is_terminal() => {
                self.records.remove(id);
                true
            }
            Some(_) => {
                tracing::warn!("refusing to evict in-flight module '{id}'");
                false
            }
            None => false,
        }
    }

    /// Ids of every cached record
    pub fn ids(&self) -> Vec<ModuleId> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether an invariant violation has shut this registry down
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let registry = ModuleRegistry::new();
        let (record, created) = registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        assert!(created);
        registry.mark_resolving("/m.js").unwrap();
        registry.mark_loading("/m.js").unwrap();
        registry.mark_evaluating("/m.js").unwrap();
        registry.mark_evaluated("/m.js").unwrap();
        assert_eq!(record.state(), ModuleState::Evaluated);
        assert!(record.is_terminal());
    }

    #[test]
    fn test_second_caller_joins_existing_record() {
        let registry = ModuleRegistry::new();
        let (first, created_first) = registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        let (second, created_second) = registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        assert!(created_first);
        assert!(!created_second);
        assert!(first.exports().shares_storage(second.exports()));
    }

    #[test]
    fn test_double_evaluated_poisons_registry() {
        let registry = ModuleRegistry::new();
        registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        registry.mark_loading("/m.js").unwrap();
        registry.mark_evaluating("/m.js").unwrap();
        registry.mark_evaluated("/m.js").unwrap();

        let err = registry.mark_evaluated("/m.js").unwrap_err();
        assert!(err.is_fatal());
        assert!(registry.is_poisoned());
        // Everything afterwards fails too
        assert!(registry.get_or_create("/other.js", ModuleFormat::CommonJs).is_err());
    }

    #[test]
    fn test_errored_is_reachable_and_sticky() {
        let registry = ModuleRegistry::new();
        let (record, _) = registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        registry.mark_loading("/m.js").unwrap();
        let shared = registry
            .mark_errored("/m.js", LoaderError::not_found("/m.js"))
            .unwrap();
        assert_eq!(record.state(), ModuleState::Errored);
        assert!(Arc::ptr_eq(&record.error().unwrap(), &shared));
        // A second failure on the same record is an invariant violation
        assert!(registry
            .mark_errored("/m.js", LoaderError::not_found("/m.js"))
            .is_err());
    }

    #[test]
    fn test_evict_only_terminal_records() {
        let registry = ModuleRegistry::new();
        registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        assert!(!registry.evict("/m.js"));
        registry.mark_loading("/m.js").unwrap();
        registry.mark_evaluating("/m.js").unwrap();
        registry.mark_evaluated("/m.js").unwrap();
        assert!(registry.evict("/m.js"));
        assert!(registry.get("/m.js").is_none());
    }

    #[test]
    fn test_watch_observes_transitions() {
        let registry = ModuleRegistry::new();
        let (record, _) = registry.get_or_create("/m.js", ModuleFormat::CommonJs).unwrap();
        let rx = record.watch();
        registry.mark_loading("/m.js").unwrap();
        assert_eq!(*rx.borrow(), ModuleState::Loading);
    }
}
