// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The evaluator seam.
//!
//! The loader orchestrates *which* source gets evaluated and *when*; the
//! evaluator executes it. Implementations receive the module's shared
//! exports object and an importer callback so require-style dependencies
//! can be pulled in mid-evaluation (which is how cycles come back around).

use crate::error::{LoaderError, Result};
use crate::registry::ModuleFormat;
use crate::scan;
use crate::source::SourceText;
use crate::value::{ExportsObject, Value};

/// Callback for pulling in a dependency during evaluation
pub trait ModuleImporter {
    /// Synchronously import `specifier` relative to the evaluating module
    fn import(&self, specifier: &str) -> Result<Value>;
}

/// Everything the evaluator gets for one module
pub struct EvalScope<'a> {
    /// Canonical id of the module being evaluated
    pub id: &'a str,
    /// Format of the content
    pub format: ModuleFormat,
    /// The module's source
    pub source: &'a SourceText,
    /// The module's exports; shared, and already visible to cyclic importers
    pub exports: &'a ExportsObject,
    /// Dependency import callback
    pub importer: &'a dyn ModuleImporter,
}

/// Compiles and runs already-resolved source.
///
/// The loader calls `evaluate` exactly once per module record.
pub trait Evaluator: Send + Sync {
    /// Evaluate one module into its exports object
    fn evaluate(&self, scope: EvalScope<'_>) -> Result<()>;
}

/// Evaluator that links dependencies without executing anything.
///
/// Require-style sources have their `require()` calls resolved and loaded;
/// import-style sources are already linked by the pipeline before this
/// runs. Exports stay empty. This is what the CLI's graph and check
/// commands run with, and the default for embedders that only need
/// resolution.
#[derive(Debug, Default)]
pub struct LinkEvaluator {
    scan_limit: usize,
}

impl LinkEvaluator {
    /// Link-only evaluator with the given scan bound
    pub fn new(scan_limit: usize) -> Self {
        Self { scan_limit }
    }
}

impl Evaluator for LinkEvaluator {
    fn evaluate(&self, scope: EvalScope<'_>) -> Result<()> {
        let limit = if self.scan_limit == 0 {
            usize::MAX
        } else {
            self.scan_limit
        };
        match scope.format {
            ModuleFormat::CommonJs => {
                let Some(text) = scope.source.as_str() else {
                    return Err(LoaderError::format_mismatch(
                        scope.id,
                        "source is not valid UTF-8",
                    ));
                };
                for specifier in scan::scan(text, limit).requires {
                    scope.importer.import(&specifier)?;
                }
                Ok(())
            }
            // Static imports were linked before evaluation; nothing runs
            ModuleFormat::Esm | ModuleFormat::DataUrl => Ok(()),
            ModuleFormat::Addon => Err(LoaderError::load_failed(
                scope.id,
                "native addons are not supported by the link evaluator",
            )),
            // JSON and built-ins are materialized by the loader itself
            ModuleFormat::Json | ModuleFormat::Builtin => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingImporter {
        seen: Mutex<Vec<String>>,
    }

    impl ModuleImporter for RecordingImporter {
        fn import(&self, specifier: &str) -> Result<Value> {
            self.seen.lock().push(specifier.to_string());
            Ok(Value::Undefined)
        }
    }

    #[test]
    fn test_link_evaluator_pulls_requires() {
        let importer = RecordingImporter {
            seen: Mutex::new(Vec::new()),
        };
        let source = SourceText::from("const a = require('./a');\nconst b = require('b');\n");
        let exports = ExportsObject::new();
        let scope = EvalScope {
            id: "/m.js",
            format: ModuleFormat::CommonJs,
            source: &source,
            exports: &exports,
            importer: &importer,
        };
        LinkEvaluator::default().evaluate(scope).unwrap();
        assert_eq!(*importer.seen.lock(), vec!["./a", "b"]);
    }

    #[test]
    fn test_link_evaluator_refuses_addons() {
        let importer = RecordingImporter {
            seen: Mutex::new(Vec::new()),
        };
        let source = SourceText::from_bytes(vec![0u8, 1, 2]);
        let exports = ExportsObject::new();
        let scope = EvalScope {
            id: "/native.node",
            format: ModuleFormat::Addon,
            source: &source,
            exports: &exports,
            importer: &importer,
        };
        assert!(LinkEvaluator::default().evaluate(scope).is_err());
    }
}
