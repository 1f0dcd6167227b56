// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Built-in module namespace.
//!
//! A fixed table of privileged modules addressed as `core:<name>`. Lookup
//! bypasses the resolve and load hook chains entirely: built-ins must stay
//! reachable even when a registered hook is broken or adversarial, since
//! embedders implement hooks in terms of built-ins.

use crate::error::{LoaderError, Result};
use crate::value::{ExportsObject, NativeFunction, Value, expect_string};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces the exports of one built-in module
pub type BuiltinFactory = Arc<dyn Fn() -> Value + Send + Sync>;

/// The privileged module table
pub struct BuiltinRegistry {
    entries: DashMap<String, BuiltinFactory>,
}

impl BuiltinRegistry {
    /// Empty table (embedders that want full control)
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Table pre-populated with the core module set
    pub fn with_core_modules() -> Self {
        let registry = Self::new();
        registry.install("runtime", runtime_module);
        registry.install("time", time_module);
        registry.install("path", path_module);
        registry.install("env", env_module);
        registry
    }

    fn install(&self, name: &str, factory: fn() -> Value) {
        self.entries.insert(name.to_string(), Arc::new(factory));
    }

    /// Whether `name` (without prefix) is a built-in
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All built-in names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Register a new built-in. Existing entries are immutable; trying to
    /// replace one is denied.
    pub fn register(&self, name: &str, factory: BuiltinFactory) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(LoaderError::BuiltinRedefinition(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(factory);
                Ok(())
            }
        }
    }

    /// Run the factory for `name`
    pub fn instantiate(&self, name: &str) -> Result<Value> {
        match self.entries.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(LoaderError::not_found(format!("core:{name}"))),
        }
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::with_core_modules()
    }
}

fn runtime_module() -> Value {
    let exports = ExportsObject::new();
    exports.set("name", Value::String("tether".to_string()));
    exports.set(
        "version",
        Value::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    Value::Object(exports)
}

fn time_module() -> Value {
    let exports = ExportsObject::new();
    exports.set(
        "nowMillis",
        Value::NativeFunction(NativeFunction::new("nowMillis", |_args| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0);
            Ok(Value::Number(millis))
        })),
    );
    Value::Object(exports)
}

fn path_module() -> Value {
    let exports = ExportsObject::new();
    exports.set(
        "sep",
        Value::String(std::path::MAIN_SEPARATOR.to_string()),
    );
    exports.set(
        "dirname",
        Value::NativeFunction(NativeFunction::new("dirname", |args| {
            let path = expect_string(args, 0, "path")?;
            let dir = Path::new(&path)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".to_string());
            Ok(Value::String(dir))
        })),
    );
    exports.set(
        "basename",
        Value::NativeFunction(NativeFunction::new("basename", |args| {
            let path = expect_string(args, 0, "path")?;
            let base = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(Value::String(base))
        })),
    );
    exports.set(
        "join",
        Value::NativeFunction(NativeFunction::new("join", |args| {
            let mut joined = std::path::PathBuf::new();
            for arg in args {
                joined.push(expect_string(std::slice::from_ref(arg), 0, "path segment")?);
            }
            Ok(Value::String(joined.display().to_string()))
        })),
    );
    Value::Object(exports)
}

fn env_module() -> Value {
    let exports = ExportsObject::new();
    exports.set(
        "get",
        Value::NativeFunction(NativeFunction::new("get", |args| {
            let name = expect_string(args, 0, "variable name")?;
            Ok(match std::env::var(&name) {
                Ok(value) => Value::String(value),
                Err(_) => Value::Undefined,
            })
        })),
    );
    Value::Object(exports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_set_present() {
        let registry = BuiltinRegistry::with_core_modules();
        assert!(registry.contains("time"));
        assert!(registry.contains("path"));
        assert!(!registry.contains("fs"));
    }

    #[test]
    fn test_redefinition_denied() {
        let registry = BuiltinRegistry::with_core_modules();
        let err = registry
            .register("time", Arc::new(|| Value::Undefined))
            .unwrap_err();
        assert!(matches!(err, LoaderError::BuiltinRedefinition(name) if name == "time"));
    }

    #[test]
    fn test_new_builtin_registers_once() {
        let registry = BuiltinRegistry::with_core_modules();
        registry
            .register("answer", Arc::new(|| Value::Number(42.0)))
            .unwrap();
        assert!(matches!(
            registry.instantiate("answer").unwrap(),
            Value::Number(n) if n == 42.0
        ));
        assert!(registry.register("answer", Arc::new(|| Value::Undefined)).is_err());
    }

    #[test]
    fn test_unknown_builtin_not_found() {
        let registry = BuiltinRegistry::with_core_modules();
        assert!(matches!(
            registry.instantiate("nope"),
            Err(LoaderError::NotFound(_))
        ));
    }

    #[test]
    fn test_path_module_functions() {
        let Value::Object(exports) = path_module() else {
            panic!("path module must export an object");
        };
        let Some(Value::NativeFunction(dirname)) = exports.get("dirname") else {
            panic!("dirname must be a function");
        };
        let result = dirname.call(&[Value::String("/a/b/c.js".into())]).unwrap();
        assert_eq!(result.as_str(), Some("/a/b"));
    }
}
