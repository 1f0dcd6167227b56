// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # tether-loader
//!
//! Module resolution and loading core for the Tether script runtime.
//!
//! This crate turns specifier strings (relative paths, bare package names,
//! URLs, built-in names) into evaluated modules, under two pipelines at
//! once:
//!
//! - A synchronous require-style pipeline that never suspends
//! - An asynchronous import-style pipeline that may suspend at every hook
//!   boundary and dependency await
//!
//! Both share one module registry, which guarantees at-most-once evaluation
//! per canonical id and tolerates cyclic imports by handing cyclic
//! importers the in-progress exports object.
//!
//! Resolution and loading are pluggable through ordered hook chains
//! composed with explicit `next` delegation; built-in `core:` modules
//! bypass the chains entirely.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_loader::Loader;
//!
//! #[tokio::main]
//! async fn main() -> tether_loader::Result<()> {
//!     let loader = Loader::new();
//!     let exports = loader.import("/srv/app/main.js", None).await?;
//!     println!("{exports:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Hooks
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_loader::{Loader, Resolution, ResolveRequest, NextResolve};
//!
//! let loader = Loader::new();
//! loader.register_resolve_hook(Arc::new(
//!     |request: ResolveRequest, next: &NextResolve<'_>| {
//!         // Delegate, then tag the result
//!         next.call(request)
//!     },
//! ))?;
//! # tether_loader::Result::Ok(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtins;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod hooks;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod scan;
pub mod source;
pub mod specifier;
pub mod value;

// Re-exports
pub use builtins::{BuiltinFactory, BuiltinRegistry};
pub use config::LoaderOptions;
pub use error::{LoaderError, Result};
pub use evaluator::{EvalScope, Evaluator, LinkEvaluator, ModuleImporter};
pub use hooks::{
    LoadHook, LoadRequest, Loaded, NextLoad, NextResolve, Resolution, ResolveHook, ResolveRequest,
};
pub use loader::Loader;
pub use registry::{ModuleFormat, ModuleId, ModuleRecord, ModuleRegistry, ModuleState};
pub use resolver::DefaultResolver;
pub use source::{ContentSource, FsSource, SourceText};
pub use specifier::{BUILTIN_PREFIX, SpecifierKind, classify};
pub use value::{ExportsObject, NativeFunction, Value};

/// Version of the tether loader
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
